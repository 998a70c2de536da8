//! How a [`super::Client`] opens a fresh connection when it has none, or
//! when the previous one broke. Kept as a small trait so the client's retry
//! and idle-close logic is transport-agnostic.

use crate::error::Result;
use crate::transport::tcp::TcpTransport;
use crate::transport::Transport;

#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

/// Opens a fresh [`TcpTransport`] to a fixed address on every call.
pub struct TcpConnectionFactory {
    addr: String,
}

impl TcpConnectionFactory {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let transport = TcpTransport::connect(&self.addr).await?;
        Ok(Box::new(transport))
    }
}

/// Opens a fresh RTU connection against a fixed serial device on every call.
///
/// Unlike the TCP side, a serial port that is already open cannot usually be
/// reopened by a second handle, so in practice this factory's `connect` is
/// called once and the resulting transport is kept for the client's
/// lifetime (or until an I/O error forces a reconnect attempt, which will
/// fail if the device is still exclusively held elsewhere).
pub struct RtuConnectionFactory {
    path: String,
    baud_rate: u32,
    parity: tokio_serial::Parity,
}

impl RtuConnectionFactory {
    /// Modbus's documented default line settings: 19200 baud, even parity.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: 19200,
            parity: tokio_serial::Parity::Even,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_parity(mut self, parity: tokio_serial::Parity) -> Self {
        self.parity = parity;
        self
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for RtuConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let transport =
            crate::transport::rtu::RtuTransport::open(&self.path, self.baud_rate, self.parity)?;
        Ok(Box::new(transport))
    }
}
