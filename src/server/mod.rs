//! TCP listener and per-session frame pump.
//!
//! Grounded on `other_examples/6057998c_alttch-rmodbus__src-server-mod.rs.rs`
//! for the request/response framing shape, and on `connection::tcp_worker`
//! for the `tokio::select!`-driven session loop structure (there applied to
//! a client's single connection, here to one accepted server-side
//! connection per task).

pub mod memory;

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::byte_ring::ByteRing;
use crate::error::Result;

const MBAP_HEADER_LEN: usize = 6;
const MAX_PDU_LEN: usize = 254;

/// Handles one parsed request PDU and writes a response into `response`.
///
/// `0` means no reply is sent, a negative value means the connection should
/// be closed, and a positive value `n` means the first `n` bytes of
/// `response` are the reply PDU.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request_pdu: &[u8], response: &mut Vec<u8>) -> i64;
}

pub struct Listener {
    listener: TokioTcpListener,
}

impl Listener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TokioTcpListener::bind(addr)
            .await
            .map_err(|e| crate::error::Error::Connect(e, addr.to_string()))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().map_err(crate::error::Error::Receive)
    }

    /// Accepts connections until `shutdown` fires, spawning one session task
    /// per client and waiting for all of them to finish before returning.
    pub async fn serve<H: Handler + 'static>(self, handler: Arc<H>, shutdown: CancellationToken) {
        let mut sessions = tokio::task::JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(message = "accepted connection", %peer);
                            let handler = Arc::clone(&handler);
                            let session_ct = shutdown.clone();
                            sessions.spawn(async move {
                                run_session(stream, handler, session_ct).await;
                            });
                        }
                        Err(e) => warn!(message = "accept failed", error = %e),
                    }
                }
            }
        }
        while sessions.join_next().await.is_some() {}
    }
}

async fn run_session<H: Handler + 'static>(
    mut stream: TcpStream,
    handler: Arc<H>,
    shutdown: CancellationToken,
) {
    let ring = Arc::new(ByteRing::new());
    let (read_half, mut write_half) = stream.split();
    let mut read_half = read_half;

    let pump_shutdown = shutdown.clone();
    let pump_ring = Arc::clone(&ring);
    let read_pump = async move {
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                _ = pump_shutdown.cancelled() => break,
                read = read_half.read(&mut buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(n) => pump_ring.enqueue(&buf[..n]),
                        Err(e) => {
                            match e.kind() {
                                std::io::ErrorKind::ConnectionAborted => {
                                    warn!(message = "connection aborted");
                                }
                                std::io::ErrorKind::ConnectionReset => {
                                    warn!(message = "connection reset");
                                }
                                _ => debug!(message = "read pump stopped", error = %e),
                            }
                            break;
                        }
                    }
                }
            }
        }
    };

    let frame_pump = async {
        loop {
            let header = match ring.dequeue_async(MBAP_HEADER_LEN, &shutdown).await {
                Ok(h) => h,
                Err(_) => break,
            };
            let transaction_id = [header[0], header[1]];
            let declared_length = u16::from_be_bytes([header[4], header[5]]) as usize;
            if declared_length == 0 || declared_length > MAX_PDU_LEN {
                warn!(message = "rejecting oversized request", declared_length);
                break;
            }
            let request_pdu = match ring.dequeue_async(declared_length, &shutdown).await {
                Ok(b) => b,
                Err(_) => break,
            };

            let mut response_buf = Vec::new();
            let n = handler.handle(&request_pdu, &mut response_buf).await;
            if n < 0 {
                break;
            }
            if n == 0 {
                continue;
            }
            let n = n as usize;
            let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + n);
            frame.extend(transaction_id);
            frame.extend([0u8, 0u8]);
            frame.extend((n as u16).to_be_bytes());
            frame.extend_from_slice(&response_buf[..n]);
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = read_pump => {}
        _ = frame_pump => {}
        _ = shutdown.cancelled() => {}
    }
    let _ = write_half.shutdown().await;
}
