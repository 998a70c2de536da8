//! End-to-end client scenarios against a scripted TCP peer, in the idiom of
//! `hadijannat-virtual-plc`'s `mock_modbus_server`-backed integration tests:
//! instead of exercising the driver against a live device, a small scripted
//! server stands in, with full control over the bytes it sends back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use modbus_engine::client::{Client, ClientConfig, TcpConnectionFactory};
use modbus_engine::object::{ObjectCollection, ObjectType};
use modbus_engine::range::Range;

/// Binds an ephemeral TCP listener and runs `handler` against the first
/// accepted connection on a background task.
async fn scripted_server<F, Fut>(handler: F) -> std::net::SocketAddr
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        handler(stream).await;
    });
    addr
}

async fn read_mbap_request(stream: &mut TcpStream) -> (u16, Vec<u8>) {
    let mut header = [0u8; 6];
    stream.read_exact(&mut header).await.unwrap();
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let len = u16::from_be_bytes([header[4], header[5]]);
    let mut pdu = vec![0u8; usize::from(len)];
    stream.read_exact(&mut pdu).await.unwrap();
    (transaction_id, pdu)
}

async fn write_mbap_response(stream: &mut TcpStream, transaction_id: u16, pdu: &[u8]) {
    let mut frame = Vec::with_capacity(6 + pdu.len());
    frame.extend(transaction_id.to_be_bytes());
    frame.extend([0u8, 0u8]);
    frame.extend((pdu.len() as u16).to_be_bytes());
    frame.extend_from_slice(pdu);
    stream.write_all(&frame).await.unwrap();
    stream.flush().await.unwrap();
}

fn client(addr: std::net::SocketAddr, config: ClientConfig) -> Arc<Client> {
    let factory = Arc::new(TcpConnectionFactory::new(addr.to_string()));
    Client::new(factory, config)
}

/// S1: reading holding registers 100..=102 sends the expected wire bytes
/// and decodes the reply into the expected addresses.
#[tokio::test]
async fn s1_read_holding_registers_over_tcp() {
    let addr = scripted_server(|mut stream| async move {
        let (tx, pdu) = read_mbap_request(&mut stream).await;
        assert_eq!(pdu, [0x01, 0x03, 0x00, 0x64, 0x00, 0x03]);
        write_mbap_response(
            &mut stream,
            tx,
            &[0x01, 0x03, 0x06, 0x00, 0x0A, 0x00, 0x14, 0x00, 0x1E],
        )
        .await;
    })
    .await;

    let config = ClientConfig::default().with_retry_count(0);
    let client = client(addr, config);
    let ct = CancellationToken::new();
    let ranges = [Range::new(100, 102).unwrap()];
    let collection = client
        .read(ObjectType::HoldingRegister, 1, &ranges, &ct)
        .await
        .unwrap();
    assert_eq!(collection.get_u16(100).unwrap(), 10);
    assert_eq!(collection.get_u16(101).unwrap(), 20);
    assert_eq!(collection.get_u16(102).unwrap(), 30);
}

/// S2: reading 10 coils unpacks the two data bytes `0xCD, 0x01` into the
/// expected per-address bit pattern (LSB = lowest address).
#[tokio::test]
async fn s2_read_coils_bit_packing() {
    let addr = scripted_server(|mut stream| async move {
        let (tx, pdu) = read_mbap_request(&mut stream).await;
        assert_eq!(pdu, [0x01, 0x01, 0x00, 0x00, 0x00, 0x0A]);
        write_mbap_response(&mut stream, tx, &[0x01, 0x01, 0x02, 0xCD, 0x01]).await;
    })
    .await;

    let client = client(addr, ClientConfig::default().with_retry_count(0));
    let ct = CancellationToken::new();
    let ranges = [Range::new(0, 9).unwrap()];
    let collection = client.read(ObjectType::Coil, 1, &ranges, &ct).await.unwrap();
    let expected = [
        (0, true),
        (1, false),
        (2, true),
        (3, true),
        (4, false),
        (5, false),
        (6, true),
        (7, true),
        (8, true),
        (9, false),
    ];
    for (addr, value) in expected {
        assert_eq!(collection.get_bit(addr).unwrap(), value, "address {addr}");
    }
}

/// S3: a single coil write that the device echoes back with the wrong value
/// surfaces as a `WriteMismatch`, not a silent success.
#[tokio::test]
async fn s3_single_write_coil_mismatch() {
    let addr = scripted_server(|mut stream| async move {
        let (tx, pdu) = read_mbap_request(&mut stream).await;
        assert_eq!(pdu, [0x01, 0x05, 0x00, 0x05, 0xFF, 0x00]);
        // Echo address 5 but value 0x0000 instead of the requested 0xFF00.
        write_mbap_response(&mut stream, tx, &[0x01, 0x05, 0x00, 0x05, 0x00, 0x00]).await;
    })
    .await;

    let client = client(addr, ClientConfig::default().with_retry_count(0));
    let ct = CancellationToken::new();
    let mut to_write = ObjectCollection::new(ObjectType::Coil);
    to_write.set_bit(5, true).unwrap();
    let err = client.write(1, &to_write, &ct).await.unwrap_err();
    assert!(matches!(err, modbus_engine::error::Error::WriteMismatch { .. }));
}

/// S4: a read for 4 registers that comes back with only 2 triggers a second
/// request for the remaining addresses, and the two partial reads are
/// stitched into one contiguous collection.
#[tokio::test]
async fn s4_short_response_recovery() {
    let addr = scripted_server(|mut stream| async move {
        let (tx1, pdu1) = read_mbap_request(&mut stream).await;
        assert_eq!(pdu1, [0x01, 0x03, 0x00, 0x00, 0x00, 0x04]);
        // Only 2 of the 4 requested registers come back.
        write_mbap_response(&mut stream, tx1, &[0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02]).await;

        let (tx2, pdu2) = read_mbap_request(&mut stream).await;
        assert_eq!(pdu2, [0x01, 0x03, 0x00, 0x02, 0x00, 0x02]);
        write_mbap_response(&mut stream, tx2, &[0x01, 0x03, 0x04, 0x00, 0x03, 0x00, 0x04]).await;
    })
    .await;

    let client = client(addr, ClientConfig::default().with_retry_count(0));
    let ct = CancellationToken::new();
    let ranges = [Range::new(0, 3).unwrap()];
    let collection = client
        .read(ObjectType::HoldingRegister, 1, &ranges, &ct)
        .await
        .unwrap();
    assert_eq!(collection.get_u16(0).unwrap(), 1);
    assert_eq!(collection.get_u16(1).unwrap(), 2);
    assert_eq!(collection.get_u16(2).unwrap(), 3);
    assert_eq!(collection.get_u16(3).unwrap(), 4);
}

/// S5: two `ServerDeviceBusy` exceptions followed by a success are retried
/// with at least `busy_retry_delay` between attempts, and the call still
/// reports success overall.
#[tokio::test]
async fn s5_busy_retry_then_success() {
    let busy_retry_delay = Duration::from_millis(40);
    let addr = scripted_server(move |mut stream| async move {
        for _ in 0..2 {
            let (tx, _pdu) = read_mbap_request(&mut stream).await;
            write_mbap_response(&mut stream, tx, &[0x01, 0x83, 0x06]).await;
        }
        let (tx, _pdu) = read_mbap_request(&mut stream).await;
        write_mbap_response(&mut stream, tx, &[0x01, 0x03, 0x02, 0x00, 0x2A]).await;
    })
    .await;

    let config = ClientConfig::default()
        .with_retry_count(4)
        .with_busy_retry_delay(busy_retry_delay);
    let client = client(addr, config);
    let ct = CancellationToken::new();
    let ranges = [Range::new(0, 0).unwrap()];
    let started = Instant::now();
    let collection = client
        .read(ObjectType::HoldingRegister, 1, &ranges, &ct)
        .await
        .unwrap();
    assert_eq!(collection.get_u16(0).unwrap(), 42);
    assert!(
        started.elapsed() >= busy_retry_delay * 2,
        "expected at least two busy-retry waits, elapsed {:?}",
        started.elapsed()
    );
}

/// The write-mode auto-detect flips exactly once: an `IllegalFunction` on a
/// single-register write switches to multiple-register writes for the rest
/// of the client's lifetime, and a subsequent single-address write still
/// goes out as a multi-write.
#[tokio::test]
async fn write_mode_auto_switch_is_latched() {
    let addr = scripted_server(|mut stream| async move {
        // First attempt: single-register write, device refuses with IllegalFunction.
        let (tx, pdu) = read_mbap_request(&mut stream).await;
        assert_eq!(pdu[1], 0x06);
        write_mbap_response(&mut stream, tx, &[0x01, 0x86, 0x01]).await;

        // Retried as a multiple-register write; succeeds.
        let (tx, pdu) = read_mbap_request(&mut stream).await;
        assert_eq!(pdu[1], 0x10);
        write_mbap_response(&mut stream, tx, &[0x01, 0x10, 0x00, 0x0A, 0x00, 0x01]).await;

        // A second, independent single-address write request goes out
        // directly as a multiple-register write, no further IllegalFunction
        // round trip needed.
        let (tx, pdu) = read_mbap_request(&mut stream).await;
        assert_eq!(pdu[1], 0x10);
        write_mbap_response(&mut stream, tx, &[0x01, 0x10, 0x00, 0x0B, 0x00, 0x01]).await;
    })
    .await;

    let client = client(addr, ClientConfig::default().with_retry_count(1));
    let ct = CancellationToken::new();

    let mut first = ObjectCollection::new(ObjectType::HoldingRegister);
    first.set_u16(10, 1).unwrap();
    client.write(1, &first, &ct).await.unwrap();

    let mut second = ObjectCollection::new(ObjectType::HoldingRegister);
    second.set_u16(11, 2).unwrap();
    client.write(1, &second, &ct).await.unwrap();
}
