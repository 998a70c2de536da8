//! A minimal in-memory reference [`Handler`](super::Handler), used by this
//! crate's own loopback tests and as a starting point for callers who just
//! want somewhere to store register/coil values.
//!
//! The server-side data store itself is not a shipped feature (callers
//! supply their own business logic behind the `Handler` contract); this one
//! exists purely so the frame-pump/dispatch plumbing can be exercised
//! end-to-end without a real device on the other end.

use std::sync::Mutex;

use crate::error::ExceptionCode;
use crate::frame::{self, Request, ResponseData};
use crate::object::{ObjectCollection, ObjectType};

pub struct MemoryHandler {
    coils: Mutex<ObjectCollection>,
    discrete_inputs: Mutex<ObjectCollection>,
    holding_registers: Mutex<ObjectCollection>,
    input_registers: Mutex<ObjectCollection>,
}

impl Default for MemoryHandler {
    fn default() -> Self {
        Self {
            coils: Mutex::new(ObjectCollection::new(ObjectType::Coil)),
            discrete_inputs: Mutex::new(ObjectCollection::new(ObjectType::DiscreteInput)),
            holding_registers: Mutex::new(ObjectCollection::new(ObjectType::HoldingRegister)),
            input_registers: Mutex::new(ObjectCollection::new(ObjectType::InputRegister)),
        }
    }
}

impl MemoryHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_holding_register(&self, address: u16, value: u16) {
        self.holding_registers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_u16(address, value)
            .expect("holding registers always accept u16 words");
    }

    pub fn seed_input_register(&self, address: u16, value: u16) {
        self.input_registers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_u16(address, value)
            .expect("input registers always accept u16 words");
    }

    pub fn seed_coil(&self, address: u16, value: bool) {
        self.coils
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_bit(address, value)
            .expect("coils always accept bits");
    }

    fn collection_for(&self, object_type: ObjectType) -> &Mutex<ObjectCollection> {
        match object_type {
            ObjectType::Coil => &self.coils,
            ObjectType::DiscreteInput => &self.discrete_inputs,
            ObjectType::HoldingRegister => &self.holding_registers,
            ObjectType::InputRegister => &self.input_registers,
        }
    }

    fn dispatch(&self, device_id: u8, request: &Request) -> Result<Vec<u8>, ExceptionCode> {
        match request {
            Request::Read { object_type, start, count } => {
                let collection = self.collection_for(*object_type).lock().unwrap_or_else(|e| e.into_inner());
                if object_type.is_bit() {
                    let values: Result<Vec<bool>, ExceptionCode> = (0..*count)
                        .map(|i| {
                            collection
                                .get_bit(start.wrapping_add(i))
                                .map_err(|_| ExceptionCode::IllegalDataAddress)
                        })
                        .collect();
                    let values = values?;
                    frame::build_response(request, device_id, &ResponseData::Bits(values))
                        .map_err(|_| ExceptionCode::ServerDeviceFailure)
                } else {
                    let values: Result<Vec<u16>, ExceptionCode> = (0..*count)
                        .map(|i| {
                            collection
                                .get_word(start.wrapping_add(i))
                                .map_err(|_| ExceptionCode::IllegalDataAddress)
                        })
                        .collect();
                    let values = values?;
                    frame::build_response(request, device_id, &ResponseData::Registers(values))
                        .map_err(|_| ExceptionCode::ServerDeviceFailure)
                }
            }
            Request::WriteSingleCoil { address, value } => {
                self.coils
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .set_bit(*address, *value)
                    .map_err(|_| ExceptionCode::IllegalDataAddress)?;
                frame::build_response(request, device_id, &ResponseData::Ack)
                    .map_err(|_| ExceptionCode::ServerDeviceFailure)
            }
            Request::WriteSingleRegister { address, value } => {
                self.holding_registers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .set_u16(*address, *value)
                    .map_err(|_| ExceptionCode::IllegalDataAddress)?;
                frame::build_response(request, device_id, &ResponseData::Ack)
                    .map_err(|_| ExceptionCode::ServerDeviceFailure)
            }
            Request::WriteMultipleCoils { start, values } => {
                let mut collection = self.coils.lock().unwrap_or_else(|e| e.into_inner());
                for (i, value) in values.iter().enumerate() {
                    collection
                        .set_bit(start.wrapping_add(i as u16), *value)
                        .map_err(|_| ExceptionCode::IllegalDataAddress)?;
                }
                drop(collection);
                frame::build_response(request, device_id, &ResponseData::Ack)
                    .map_err(|_| ExceptionCode::ServerDeviceFailure)
            }
            Request::WriteMultipleRegisters { start, values } => {
                let mut collection = self.holding_registers.lock().unwrap_or_else(|e| e.into_inner());
                for (i, value) in values.iter().enumerate() {
                    collection
                        .set_u16(start.wrapping_add(i as u16), *value)
                        .map_err(|_| ExceptionCode::IllegalDataAddress)?;
                }
                drop(collection);
                frame::build_response(request, device_id, &ResponseData::Ack)
                    .map_err(|_| ExceptionCode::ServerDeviceFailure)
            }
            Request::ReadDeviceIdentification { .. } => Err(ExceptionCode::IllegalFunction),
        }
    }
}

fn parse_request(pdu: &[u8]) -> Option<(u8, Request)> {
    let &[device_id, function_code, ref rest @ ..] = pdu else {
        return None;
    };
    let request = match function_code {
        frame::FC_READ_COILS | frame::FC_READ_DISCRETE_INPUTS
        | frame::FC_READ_HOLDING_REGISTERS | frame::FC_READ_INPUT_REGISTERS => {
            let &[a0, a1, c0, c1] = rest else { return None };
            let object_type = match function_code {
                frame::FC_READ_COILS => ObjectType::Coil,
                frame::FC_READ_DISCRETE_INPUTS => ObjectType::DiscreteInput,
                frame::FC_READ_HOLDING_REGISTERS => ObjectType::HoldingRegister,
                _ => ObjectType::InputRegister,
            };
            Request::Read {
                object_type,
                start: u16::from_be_bytes([a0, a1]),
                count: u16::from_be_bytes([c0, c1]),
            }
        }
        frame::FC_WRITE_SINGLE_COIL => {
            let &[a0, a1, v0, v1] = rest else { return None };
            Request::WriteSingleCoil {
                address: u16::from_be_bytes([a0, a1]),
                value: u16::from_be_bytes([v0, v1]) == 0xFF00,
            }
        }
        frame::FC_WRITE_SINGLE_REGISTER => {
            let &[a0, a1, v0, v1] = rest else { return None };
            Request::WriteSingleRegister {
                address: u16::from_be_bytes([a0, a1]),
                value: u16::from_be_bytes([v0, v1]),
            }
        }
        frame::FC_WRITE_MULTIPLE_COILS => {
            let &[a0, a1, c0, c1, byte_count, ref data @ ..] = rest else { return None };
            let count = u16::from_be_bytes([c0, c1]);
            if data.len() < usize::from(byte_count) {
                return None;
            }
            let values = (0..count)
                .map(|i| data[usize::from(i) / 8] & (1 << (i % 8)) != 0)
                .collect();
            Request::WriteMultipleCoils {
                start: u16::from_be_bytes([a0, a1]),
                values,
            }
        }
        frame::FC_WRITE_MULTIPLE_REGISTERS => {
            let &[a0, a1, c0, c1, _byte_count, ref data @ ..] = rest else { return None };
            let count = usize::from(u16::from_be_bytes([c0, c1]));
            if data.len() < count * 2 {
                return None;
            }
            let values = (0..count)
                .map(|i| u16::from_be_bytes([data[i * 2], data[i * 2 + 1]]))
                .collect();
            Request::WriteMultipleRegisters {
                start: u16::from_be_bytes([a0, a1]),
                values,
            }
        }
        _ => return None,
    };
    Some((device_id, request))
}

#[async_trait::async_trait]
impl super::Handler for MemoryHandler {
    async fn handle(&self, request_pdu: &[u8], response: &mut Vec<u8>) -> i64 {
        let Some((device_id, request)) = parse_request(request_pdu) else {
            return -1;
        };
        match self.dispatch(device_id, &request) {
            Ok(bytes) => {
                response.extend_from_slice(&bytes);
                bytes.len() as i64
            }
            Err(code) => {
                let bytes = frame::build_exception(request.function_code(), device_id, code);
                response.extend_from_slice(&bytes);
                bytes.len() as i64
            }
        }
    }
}
