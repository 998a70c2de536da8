//! Wire transports: TCP (MBAP) and RTU (CRC-framed serial).

pub mod rtu;
pub mod tcp;

/// One request/response exchange: send `request_pdu` (device id + function
/// code + payload), return the matching response PDU (same shape, device id
/// still at byte 0) once a complete frame has arrived.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(&mut self, request_pdu: &[u8]) -> crate::error::Result<Vec<u8>>;
}
