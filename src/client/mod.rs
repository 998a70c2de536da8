//! Client connection lifecycle, retry policy, and protocol auto-adaptation.
//!
//! Restructured from `connection::Connection`/`tcp_worker`, which multiplexes
//! many in-flight requests by transaction id behind an unbounded queue, into
//! a single-owner-lock-per-request model: one connection, one request in
//! flight at a time, acquired and released around each exchange. The idiom
//! of `thiserror` errors, `tracing` events at retry/reconnect boundaries, and
//! a reset-able `tokio::time` sleep for pacing (there `send_slot_sleeper`,
//! here the idle-close timer) carries over unchanged.

mod config;
mod factory;

pub use config::ClientConfig;
pub use factory::{ConnectionFactory, RtuConnectionFactory, TcpConnectionFactory};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::frame::{self, Request, Response};
use crate::object::{ObjectCollection, ObjectType};
use crate::range::{self, Range};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Unknown,
    Single,
    Multiple,
}

struct ConnectionState {
    transport: Option<Box<dyn Transport>>,
    write_mode: WriteMode,
}

/// A Modbus client: one logical connection (TCP or RTU), reopened on demand
/// by `factory`, with retries, idle-close, and function-code write-mode
/// auto-detect.
pub struct Client {
    factory: Arc<dyn ConnectionFactory>,
    config: ClientConfig,
    state: Mutex<ConnectionState>,
    idle_deadline: Mutex<Option<Instant>>,
    idle_notify: Notify,
}

impl Client {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: ClientConfig) -> Arc<Self> {
        let client = Arc::new(Self {
            factory,
            config,
            state: Mutex::new(ConnectionState {
                transport: None,
                write_mode: WriteMode::Unknown,
            }),
            idle_deadline: Mutex::new(None),
            idle_notify: Notify::new(),
        });
        tokio::spawn(idle_task(Arc::clone(&client)));
        client
    }

    pub async fn read(
        &self,
        object_type: ObjectType,
        device_id: u8,
        ranges: &[Range],
        ct: &CancellationToken,
    ) -> Result<ObjectCollection> {
        let mut collection = ObjectCollection::new(object_type);
        let max_len = effective_max_length(object_type, self.config.max_request_length);
        let planned = range::plan(ranges, max_len, self.config.allowed_request_waste);
        for planned_range in planned {
            let mut remaining = planned_range;
            loop {
                let count = remaining.len();
                let request = Request::Read {
                    object_type,
                    start: remaining.start,
                    count,
                };
                let response = self.send_generic(&request, device_id, ct).await?;
                let delivered = match response {
                    Response::ReadBits { values } => {
                        for (i, value) in values.iter().enumerate() {
                            collection.set_bit(remaining.start.wrapping_add(i as u16), *value)?;
                        }
                        values.len()
                    }
                    Response::ReadRegisters { values } => {
                        for (i, value) in values.iter().enumerate() {
                            collection.set_word(remaining.start.wrapping_add(i as u16), *value)?;
                        }
                        values.len()
                    }
                    _ => return Err(Error::Malformed("unexpected response shape for a read")),
                };
                if delivered as u16 >= count {
                    break;
                }
                match remaining.subrange(delivered as u16) {
                    Some(r) => remaining = r,
                    None => break,
                }
            }
        }
        Ok(collection)
    }

    pub async fn write(
        &self,
        device_id: u8,
        objects: &ObjectCollection,
        ct: &CancellationToken,
    ) -> Result<()> {
        let object_type = objects.object_type();
        if !object_type.is_writable() {
            return Err(Error::ObjectTypeMismatch);
        }
        let max_len = effective_max_length(object_type, self.config.max_request_length);
        let ranges = objects.get_ranges(max_len, self.config.allowed_request_waste);
        for range in ranges {
            self.write_range(device_id, object_type, range, objects, ct).await?;
        }
        Ok(())
    }

    async fn write_range(
        &self,
        device_id: u8,
        object_type: ObjectType,
        range: Range,
        objects: &ObjectCollection,
        ct: &CancellationToken,
    ) -> Result<()> {
        let mut attempt = 0u32;
        let mut range = range;
        loop {
            let mode = self.state.lock().await.write_mode;
            let use_single = range.len() == 1 && mode != WriteMode::Multiple || mode == WriteMode::Single;
            let request = build_write_request(object_type, range, objects, use_single)?;
            match self.send_once(&request, device_id, ct).await {
                Ok(response) => {
                    // A multi-write confirming fewer objects than requested
                    // is a VIOLATION: re-send the unconfirmed remainder
                    // instead of reporting success for the whole range.
                    let confirmed = match response {
                        Response::WriteMultipleConfirm { count, .. } => count,
                        _ => range.len(),
                    };
                    if confirmed >= range.len() {
                        return Ok(());
                    }
                    match range.subrange(confirmed) {
                        Some(remaining) => {
                            range = remaining;
                            attempt = 0;
                            continue;
                        }
                        None => return Ok(()),
                    }
                }
                Err(e) => {
                    if let Some(code) = e.exception_code() {
                        if code.is_server_busy() {
                            if attempt >= self.config.retry_count {
                                return Err(e);
                            }
                            attempt += 1;
                            self.sleep_with_jitter(self.config.busy_retry_delay, ct).await?;
                            continue;
                        }
                        if code.is_illegal_function() && self.try_switch_write_mode(use_single).await {
                            continue;
                        }
                        return Err(e);
                    }
                    if matches!(e, Error::Timeout) && self.try_switch_write_mode(use_single).await {
                        continue;
                    }
                    if !e.is_retryable() || attempt >= self.config.retry_count {
                        return Err(e);
                    }
                    attempt += 1;
                    self.sleep_with_jitter(self.config.exception_retry_delay, ct).await?;
                }
            }
        }
    }

    pub async fn read_device_identification(
        &self,
        device_id: u8,
        ct: &CancellationToken,
    ) -> Result<BTreeMap<u8, Vec<u8>>> {
        let mut objects = BTreeMap::new();
        let mut category = 1u8;
        let mut max_category = 1u8;
        while category <= max_category {
            let mut object_id = 0u8;
            loop {
                let request = Request::ReadDeviceIdentification { category, object_id };
                match self.send_generic(&request, device_id, ct).await {
                    Ok(Response::DeviceIdentification {
                        conformity_level,
                        more_follows,
                        next_object_id,
                        objects: objs,
                    }) => {
                        max_category = max_category.max(conformity_level & 0x7F);
                        for obj in objs {
                            objects.insert(obj.id, obj.value);
                        }
                        if !more_follows {
                            break;
                        }
                        object_id = next_object_id;
                    }
                    Ok(_) => return Err(Error::Malformed("unexpected response shape for device identification")),
                    Err(e) => {
                        if let Some(code) = e.exception_code() {
                            if code.is_illegal_data_address() && object_id == 0 && (category == 2 || category == 3) {
                                object_id = if category == 2 { 3 } else { 0x80 };
                                continue;
                            }
                        }
                        return Err(e);
                    }
                }
            }
            category += 1;
        }
        Ok(objects)
    }

    async fn send_generic(&self, request: &Request, device_id: u8, ct: &CancellationToken) -> Result<Response> {
        let mut attempt = 0u32;
        loop {
            match self.send_once(request, device_id, ct).await {
                Ok(r) => return Ok(r),
                Err(e) => {
                    if matches!(e, Error::Cancelled) {
                        return Err(e);
                    }
                    let busy = e.exception_code().map(|c| c.is_server_busy()).unwrap_or(false);
                    if !e.is_retryable() || attempt >= self.config.retry_count {
                        return Err(e);
                    }
                    attempt += 1;
                    let delay = if busy {
                        self.config.busy_retry_delay
                    } else {
                        self.config.exception_retry_delay
                    };
                    self.sleep_with_jitter(delay, ct).await?;
                }
            }
        }
    }

    async fn send_once(&self, request: &Request, device_id: u8, ct: &CancellationToken) -> Result<Response> {
        let mut state = self.state.lock().await;
        if state.transport.is_none() {
            debug!(message = "opening connection");
            state.transport = Some(self.factory.connect().await?);
        }
        let pdu = request.build(device_id)?;
        trace!(message = "sending pdu", ?pdu);
        let transport = state.transport.as_mut().expect("just ensured present");

        let exchange = transport.exchange(&pdu);
        let outcome = if self.config.response_timeout == Duration::MAX {
            tokio::select! {
                result = exchange => Ok(result),
                _ = ct.cancelled() => Err(Error::Cancelled),
            }
        } else {
            tokio::select! {
                result = tokio::time::timeout(self.config.response_timeout, exchange) => {
                    Ok(result.map_err(|_| Error::Timeout))
                }
                _ = ct.cancelled() => Err(Error::Cancelled),
            }
        };

        let response_pdu = match outcome {
            Err(cancelled) => {
                drop(state);
                self.arm_idle_timer().await;
                return Err(cancelled);
            }
            Ok(Err(timeout_or_cancel)) => {
                state.transport = None;
                drop(state);
                self.arm_idle_timer().await;
                return Err(timeout_or_cancel);
            }
            Ok(Ok(Err(io_error))) => {
                state.transport = None;
                drop(state);
                self.arm_idle_timer().await;
                return Err(io_error);
            }
            Ok(Ok(Ok(bytes))) => bytes,
        };
        drop(state);
        self.arm_idle_timer().await;
        let Some((&got_device_id, pdu)) = response_pdu.split_first() else {
            return Err(Error::IncompleteResponse {
                expected: 1,
                actual: response_pdu.len(),
            });
        };
        if got_device_id != device_id {
            // VIOLATION: permissive per the same posture as the TCP
            // transaction id mismatch - logged, not fatal.
            debug!(message = "device id mismatch in response", expected = device_id, got = got_device_id);
        }
        frame::decode(request, pdu)
    }

    async fn try_switch_write_mode(&self, used_single: bool) -> bool {
        let mut state = self.state.lock().await;
        if state.write_mode == WriteMode::Unknown {
            state.write_mode = if used_single { WriteMode::Multiple } else { WriteMode::Single };
            debug!(message = "switched write mode after IllegalFunction/timeout", ?state.write_mode);
            true
        } else {
            false
        }
    }

    async fn sleep_with_jitter(&self, base: Duration, ct: &CancellationToken) -> Result<()> {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
        tokio::select! {
            _ = tokio::time::sleep(base + jitter) => Ok(()),
            _ = ct.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn arm_idle_timer(&self) {
        if self.config.idle_timeout.is_zero() {
            let mut state = self.state.lock().await;
            if state.transport.is_some() {
                debug!(message = "closing connection immediately (idle_timeout = 0)");
                state.transport = None;
            }
            return;
        }
        if self.config.idle_timeout == Duration::MAX {
            *self.idle_deadline.lock().await = None;
            return;
        }
        *self.idle_deadline.lock().await = Some(Instant::now() + self.config.idle_timeout);
        self.idle_notify.notify_one();
    }
}

async fn idle_task(client: Arc<Client>) {
    loop {
        let deadline = *client.idle_deadline.lock().await;
        match deadline {
            None => client.idle_notify.notified().await,
            Some(instant) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(instant) => {
                        let mut deadline_guard = client.idle_deadline.lock().await;
                        if *deadline_guard == Some(instant) {
                            *deadline_guard = None;
                            drop(deadline_guard);
                            let mut state = client.state.lock().await;
                            if state.transport.is_some() {
                                debug!(message = "closing idle connection");
                                state.transport = None;
                            }
                        }
                    }
                    _ = client.idle_notify.notified() => {}
                }
            }
        }
    }
}

fn effective_max_length(object_type: ObjectType, configured: u16) -> u16 {
    let cap = object_type.protocol_max_length();
    if configured == 0 || configured > cap {
        cap
    } else {
        configured
    }
}

fn build_write_request(
    object_type: ObjectType,
    range: Range,
    objects: &ObjectCollection,
    use_single: bool,
) -> Result<Request> {
    match (object_type, use_single) {
        (ObjectType::Coil, true) => Ok(Request::WriteSingleCoil {
            address: range.start,
            value: objects.get_bit(range.start)?,
        }),
        (ObjectType::Coil, false) => {
            let values = (range.start..=range.end)
                .map(|a| objects.get_bit(a))
                .collect::<Result<Vec<_>>>()?;
            Ok(Request::WriteMultipleCoils {
                start: range.start,
                values,
            })
        }
        (ObjectType::HoldingRegister, true) => Ok(Request::WriteSingleRegister {
            address: range.start,
            value: objects.get_word(range.start)?,
        }),
        (ObjectType::HoldingRegister, false) => {
            let values = (range.start..=range.end)
                .map(|a| objects.get_word(a))
                .collect::<Result<Vec<_>>>()?;
            Ok(Request::WriteMultipleRegisters {
                start: range.start,
                values,
            })
        }
        _ => Err(Error::ObjectTypeMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::memory::MemoryHandler;
    use crate::server::Listener;

    async fn spawn_loopback_server() -> (std::net::SocketAddr, CancellationToken) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(MemoryHandler::new());
        handler.seed_holding_register(100, 10);
        handler.seed_holding_register(101, 20);
        handler.seed_holding_register(102, 30);
        let ct = CancellationToken::new();
        let serve_ct = ct.clone();
        tokio::spawn(async move { listener.serve(handler, serve_ct).await });
        (addr, ct)
    }

    #[tokio::test]
    async fn read_holding_registers_over_loopback() {
        let (addr, _shutdown) = spawn_loopback_server().await;
        let factory = Arc::new(TcpConnectionFactory::new(addr.to_string()));
        let client = Client::new(factory, ClientConfig::default());
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

    #[tokio::test]
    async fn write_then_read_back_single_register() {
        let (addr, _shutdown) = spawn_loopback_server().await;
        let factory = Arc::new(TcpConnectionFactory::new(addr.to_string()));
        let client = Client::new(factory, ClientConfig::default());
        let ct = CancellationToken::new();
        let mut to_write = ObjectCollection::new(ObjectType::HoldingRegister);
        to_write.set_u16(200, 777).unwrap();
        client.write(1, &to_write, &ct).await.unwrap();
        let ranges = [Range::new(200, 200).unwrap()];
        let collection = client
            .read(ObjectType::HoldingRegister, 1, &ranges, &ct)
            .await
            .unwrap();
        assert_eq!(collection.get_u16(200).unwrap(), 777);
    }
}
