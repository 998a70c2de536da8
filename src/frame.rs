//! Builds Modbus PDU bodies for requests and decodes them from responses.
//!
//! A "body" here is `[deviceId, functionCode, ...]` as described by the
//! wire layouts; transports are responsible for wrapping it in MBAP framing
//! (TCP) or CRC framing (RTU). Decoding operates on the PDU with the device
//! id already stripped by the transport, since both transports need to read
//! the device id themselves to route/validate the exchange.

use crate::error::{Error, ExceptionCode, Result};
use crate::object::ObjectType;

pub const FC_READ_COILS: u8 = 1;
pub const FC_READ_DISCRETE_INPUTS: u8 = 2;
pub const FC_READ_HOLDING_REGISTERS: u8 = 3;
pub const FC_READ_INPUT_REGISTERS: u8 = 4;
pub const FC_WRITE_SINGLE_COIL: u8 = 5;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 6;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 15;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 16;
pub const FC_READ_DEVICE_IDENTIFICATION: u8 = 43;
const MEI_TYPE_READ_DEVICE_ID: u8 = 14;

fn read_function_code(object_type: ObjectType) -> u8 {
    match object_type {
        ObjectType::Coil => FC_READ_COILS,
        ObjectType::DiscreteInput => FC_READ_DISCRETE_INPUTS,
        ObjectType::HoldingRegister => FC_READ_HOLDING_REGISTERS,
        ObjectType::InputRegister => FC_READ_INPUT_REGISTERS,
    }
}

#[derive(Debug, Clone)]
pub enum Request {
    Read {
        object_type: ObjectType,
        start: u16,
        count: u16,
    },
    WriteSingleCoil {
        address: u16,
        value: bool,
    },
    WriteSingleRegister {
        address: u16,
        value: u16,
    },
    WriteMultipleCoils {
        start: u16,
        values: Vec<bool>,
    },
    WriteMultipleRegisters {
        start: u16,
        values: Vec<u16>,
    },
    ReadDeviceIdentification {
        category: u8,
        object_id: u8,
    },
}

impl Request {
    pub fn function_code(&self) -> u8 {
        match self {
            Self::Read { object_type, .. } => read_function_code(*object_type),
            Self::WriteSingleCoil { .. } => FC_WRITE_SINGLE_COIL,
            Self::WriteSingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
            Self::WriteMultipleCoils { .. } => FC_WRITE_MULTIPLE_COILS,
            Self::WriteMultipleRegisters { .. } => FC_WRITE_MULTIPLE_REGISTERS,
            Self::ReadDeviceIdentification { .. } => FC_READ_DEVICE_IDENTIFICATION,
        }
    }

    /// Builds the PDU body, `[deviceId, functionCode, ...]`.
    pub fn build(&self, device_id: u8) -> Result<Vec<u8>> {
        let mut out = vec![device_id, self.function_code()];
        match self {
            Self::Read { start, count, .. } => {
                out.extend(start.to_be_bytes());
                out.extend(count.to_be_bytes());
            }
            Self::WriteSingleCoil { address, value } => {
                out.extend(address.to_be_bytes());
                out.extend(if *value { 0xFF00u16 } else { 0x0000u16 }.to_be_bytes());
            }
            Self::WriteSingleRegister { address, value } => {
                out.extend(address.to_be_bytes());
                out.extend(value.to_be_bytes());
            }
            Self::WriteMultipleCoils { start, values } => {
                out.extend(start.to_be_bytes());
                out.extend((values.len() as u16).to_be_bytes());
                let byte_count = values.len().div_ceil(8);
                out.push(byte_count as u8);
                let mut bytes = vec![0u8; byte_count];
                for (i, &bit) in values.iter().enumerate() {
                    if bit {
                        bytes[i / 8] |= 1 << (i % 8);
                    }
                }
                out.extend(bytes);
            }
            Self::WriteMultipleRegisters { start, values } => {
                out.extend(start.to_be_bytes());
                out.extend((values.len() as u16).to_be_bytes());
                out.push((values.len() * 2) as u8);
                for value in values {
                    out.extend(value.to_be_bytes());
                }
            }
            Self::ReadDeviceIdentification {
                category,
                object_id,
            } => {
                out.push(MEI_TYPE_READ_DEVICE_ID);
                out.push(*category);
                out.push(*object_id);
            }
        }
        Ok(out)
    }

    /// Upper bound on response PDU length (including device id and function
    /// code, excluding transport-specific framing), used by RTU to know how
    /// many bytes to read before it has the whole frame.
    pub fn expected_response_length(&self) -> usize {
        match self {
            Self::Read { object_type, count, .. } => {
                if object_type.is_bit() {
                    3 + usize::from(*count).div_ceil(8)
                } else {
                    3 + usize::from(*count) * 2
                }
            }
            Self::WriteSingleCoil { .. } | Self::WriteSingleRegister { .. } => 6,
            Self::WriteMultipleCoils { .. } | Self::WriteMultipleRegisters { .. } => 6,
            Self::ReadDeviceIdentification { .. } => 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdObject {
    pub id: u8,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    ReadBits { values: Vec<bool> },
    ReadRegisters { values: Vec<u16> },
    WriteSingleCoilConfirm { address: u16, value: bool },
    WriteSingleRegisterConfirm { address: u16, value: u16 },
    WriteMultipleConfirm { start: u16, count: u16 },
    DeviceIdentification {
        conformity_level: u8,
        more_follows: bool,
        next_object_id: u8,
        objects: Vec<DeviceIdObject>,
    },
}

/// Decodes a PDU (`[functionCode, ...]`, device id already stripped) given
/// the request it answers.
pub fn decode(request: &Request, pdu: &[u8]) -> Result<Response> {
    let &[function_code, ref rest @ ..] = pdu else {
        return Err(Error::IncompleteResponse {
            expected: 1,
            actual: pdu.len(),
        });
    };

    if function_code & 0x80 != 0 {
        let &[code, ..] = rest else {
            return Err(Error::IncompleteResponse {
                expected: 2,
                actual: pdu.len(),
            });
        };
        return Err(Error::Exception(ExceptionCode::from_byte(code)));
    }

    match request {
        Request::Read { object_type, count, .. } => {
            let &[byte_count, ref data @ ..] = rest else {
                return Err(Error::IncompleteResponse {
                    expected: 1,
                    actual: rest.len(),
                });
            };
            let byte_count = usize::from(byte_count);
            if data.len() < byte_count {
                return Err(Error::IncompleteResponse {
                    expected: byte_count,
                    actual: data.len(),
                });
            }
            let data = &data[..byte_count];
            if object_type.is_bit() {
                let delivered = (byte_count * 8).min(usize::from(*count));
                let values = (0..delivered)
                    .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
                    .collect();
                Ok(Response::ReadBits { values })
            } else {
                let delivered = byte_count / 2;
                let values = (0..delivered)
                    .map(|i| u16::from_be_bytes([data[i * 2], data[i * 2 + 1]]))
                    .collect();
                Ok(Response::ReadRegisters { values })
            }
        }
        Request::WriteSingleCoil { address, value } => {
            let &[a0, a1, v0, v1] = rest else {
                return Err(Error::IncompleteResponse {
                    expected: 4,
                    actual: rest.len(),
                });
            };
            let got_address = u16::from_be_bytes([a0, a1]);
            if got_address != *address {
                return Err(Error::AddressMismatch {
                    expected: *address,
                    actual: got_address,
                });
            }
            let raw = u16::from_be_bytes([v0, v1]);
            let got_value = match raw {
                0xFF00 => true,
                0x0000 => false,
                _ => {
                    return Err(Error::WriteMismatch {
                        expected: vec![0xFF, 0x00],
                        actual: vec![v0, v1],
                    })
                }
            };
            if got_value != *value {
                return Err(Error::WriteMismatch {
                    expected: vec![if *value { 0xFF } else { 0x00 }, 0x00],
                    actual: vec![v0, v1],
                });
            }
            Ok(Response::WriteSingleCoilConfirm {
                address: got_address,
                value: got_value,
            })
        }
        Request::WriteSingleRegister { address, value } => {
            let &[a0, a1, v0, v1] = rest else {
                return Err(Error::IncompleteResponse {
                    expected: 4,
                    actual: rest.len(),
                });
            };
            let got_address = u16::from_be_bytes([a0, a1]);
            if got_address != *address {
                return Err(Error::AddressMismatch {
                    expected: *address,
                    actual: got_address,
                });
            }
            let got_value = u16::from_be_bytes([v0, v1]);
            if got_value != *value {
                return Err(Error::WriteMismatch {
                    expected: value.to_be_bytes().to_vec(),
                    actual: vec![v0, v1],
                });
            }
            Ok(Response::WriteSingleRegisterConfirm {
                address: got_address,
                value: got_value,
            })
        }
        Request::WriteMultipleCoils { start, .. } | Request::WriteMultipleRegisters { start, .. } => {
            let &[a0, a1, c0, c1] = rest else {
                return Err(Error::IncompleteResponse {
                    expected: 4,
                    actual: rest.len(),
                });
            };
            let got_start = u16::from_be_bytes([a0, a1]);
            if got_start != *start {
                return Err(Error::AddressMismatch {
                    expected: *start,
                    actual: got_start,
                });
            }
            let count = u16::from_be_bytes([c0, c1]);
            if count == 0 {
                return Err(Error::WriteMismatch {
                    expected: vec![],
                    actual: vec![],
                });
            }
            Ok(Response::WriteMultipleConfirm {
                start: got_start,
                count,
            })
        }
        Request::ReadDeviceIdentification { object_id, .. } => {
            decode_device_identification(rest, *object_id)
        }
    }
}

fn decode_device_identification(rest: &[u8], last_requested: u8) -> Result<Response> {
    // rest = [meiType, category, conformityLevel, moreFollows, nextObjectId, objectCount, {id,len,bytes}...]
    if rest.len() < 5 {
        return Err(Error::IncompleteResponse {
            expected: 5,
            actual: rest.len(),
        });
    }
    let category = rest[1];
    let conformity_level = rest[2];
    // VIOLATION: some gateways put a numeric echo (not a valid 1..8 error
    // code) at the `category` position and the actual protocol error one
    // byte further in, without ever setting the function code's high bit.
    if !(1..=8).contains(&category) && (1..=8).contains(&conformity_level) {
        return Err(Error::Exception(ExceptionCode::from_byte(conformity_level)));
    }
    let more_follows = rest[3] != 0;
    let next_object_id = rest[4];
    let mut objects = Vec::new();
    let mut offset = 6usize.min(rest.len());
    while offset + 2 <= rest.len() {
        let id = rest[offset];
        let len = usize::from(rest[offset + 1]);
        let value_start = offset + 2;
        if value_start + len > rest.len() {
            break;
        }
        objects.push(DeviceIdObject {
            id,
            value: rest[value_start..value_start + len].to_vec(),
        });
        offset = value_start + len;
    }
    if more_follows && next_object_id <= last_requested {
        return Err(Error::ReadDeviceIdentificationLoop {
            next: next_object_id,
            last: last_requested,
        });
    }
    Ok(Response::DeviceIdentification {
        conformity_level,
        more_follows,
        next_object_id,
        objects,
    })
}

/// Builds a success response PDU for the given request, used by the server
/// side to turn decoded request parameters plus fetched data into wire
/// bytes.
pub fn build_response(request: &Request, device_id: u8, data: &ResponseData) -> Result<Vec<u8>> {
    let mut out = vec![device_id, request.function_code()];
    match (request, data) {
        (Request::Read { object_type, .. }, ResponseData::Bits(bits)) => {
            if !object_type.is_bit() {
                return Err(Error::ObjectTypeMismatch);
            }
            let byte_count = bits.len().div_ceil(8);
            out.push(byte_count as u8);
            let mut bytes = vec![0u8; byte_count];
            for (i, &bit) in bits.iter().enumerate() {
                if bit {
                    bytes[i / 8] |= 1 << (i % 8);
                }
            }
            out.extend(bytes);
        }
        (Request::Read { object_type, .. }, ResponseData::Registers(words)) => {
            if object_type.is_bit() {
                return Err(Error::ObjectTypeMismatch);
            }
            out.push((words.len() * 2) as u8);
            for w in words {
                out.extend(w.to_be_bytes());
            }
        }
        (Request::WriteSingleCoil { address, value }, ResponseData::Ack) => {
            out.extend(address.to_be_bytes());
            out.extend(if *value { 0xFF00u16 } else { 0x0000u16 }.to_be_bytes());
        }
        (Request::WriteSingleRegister { address, value }, ResponseData::Ack) => {
            out.extend(address.to_be_bytes());
            out.extend(value.to_be_bytes());
        }
        (Request::WriteMultipleCoils { start, values }, ResponseData::Ack) => {
            out.extend(start.to_be_bytes());
            out.extend((values.len() as u16).to_be_bytes());
        }
        (Request::WriteMultipleRegisters { start, values }, ResponseData::Ack) => {
            out.extend(start.to_be_bytes());
            out.extend((values.len() as u16).to_be_bytes());
        }
        _ => return Err(Error::Malformed("response data does not match request shape")),
    }
    Ok(out)
}

/// Builds an exception response PDU: `[deviceId, functionCode|0x80, code]`.
pub fn build_exception(function_code: u8, device_id: u8, code: ExceptionCode) -> Vec<u8> {
    vec![device_id, function_code | 0x80, code.to_byte()]
}

/// Maps a write function code to the object type it targets, or `None` if
/// the function code is not a write at all. Servers that keep their own
/// typed storage (rather than dispatching on the already-decoded `Request`
/// the way [`crate::server::memory::MemoryHandler`] does) can use this to
/// route a raw function code to the right collection before parsing the
/// rest of the PDU.
pub fn writable_object_type_for(function_code: u8) -> Option<ObjectType> {
    match function_code {
        FC_WRITE_SINGLE_COIL | FC_WRITE_MULTIPLE_COILS => Some(ObjectType::Coil),
        FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_REGISTERS => Some(ObjectType::HoldingRegister),
        _ => None,
    }
}

pub enum ResponseData {
    Bits(Vec<bool>),
    Registers(Vec<u16>),
    Ack,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_holding_registers_request_matches_wire_layout() {
        let req = Request::Read {
            object_type: ObjectType::HoldingRegister,
            start: 100,
            count: 3,
        };
        let body = req.build(1).unwrap();
        assert_eq!(body, vec![0x01, 0x03, 0x00, 0x64, 0x00, 0x03]);
    }

    #[test]
    fn read_holding_registers_response_decodes() {
        let req = Request::Read {
            object_type: ObjectType::HoldingRegister,
            start: 100,
            count: 3,
        };
        let pdu = [0x03, 0x06, 0x00, 0x0A, 0x00, 0x14, 0x00, 0x1E];
        let response = decode(&req, &pdu).unwrap();
        assert_eq!(
            response,
            Response::ReadRegisters {
                values: vec![10, 20, 30]
            }
        );
    }

    #[test]
    fn read_coils_bit_packing() {
        let req = Request::Read {
            object_type: ObjectType::Coil,
            start: 0,
            count: 10,
        };
        let pdu = [0x01, 0x02, 0xCD, 0x01];
        let response = decode(&req, &pdu).unwrap();
        let Response::ReadBits { values } = response else {
            panic!("wrong variant");
        };
        assert_eq!(
            values,
            vec![true, false, true, true, false, false, true, true, true, false]
        );
    }

    #[test]
    fn exception_response_decodes() {
        let req = Request::Read {
            object_type: ObjectType::HoldingRegister,
            start: 0,
            count: 1,
        };
        let pdu = [0x83, 0x02];
        let err = decode(&req, &pdu).unwrap_err();
        assert_eq!(err.exception_code(), Some(ExceptionCode::IllegalDataAddress));
    }

    #[test]
    fn write_single_coil_mismatch_is_an_error() {
        let req = Request::WriteSingleCoil {
            address: 5,
            value: true,
        };
        let pdu = [0x05, 0x00, 0x05, 0x00, 0x00];
        assert!(decode(&req, &pdu).is_err());
    }

    #[test]
    fn short_write_multiple_confirm_is_reported() {
        let req = Request::WriteMultipleRegisters {
            start: 0,
            values: vec![1, 2, 3, 4],
        };
        let pdu = [0x10, 0x00, 0x00, 0x00, 0x02];
        let response = decode(&req, &pdu).unwrap();
        assert_eq!(
            response,
            Response::WriteMultipleConfirm { start: 0, count: 2 }
        );
    }

    #[test]
    fn device_identification_tolerates_extra_objects_and_ignores_count() {
        let req = Request::ReadDeviceIdentification {
            category: 1,
            object_id: 0,
        };
        let pdu = [
            0x2B, 0x0E, 0x01, 0x83, 0x00, 0x02, 0xFF, // category, conformity, moreFollows=0, next=2, objectCount(wrong)=255
            0x00, 0x02, b'A', b'B', // object 0: id 0, len 2, "AB"
            0x01, 0x01, b'C', // object 1: id 1, len 1, "C"
        ];
        let response = decode(&req, &pdu).unwrap();
        let Response::DeviceIdentification { objects, .. } = response else {
            panic!("wrong variant");
        };
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].value, b"AB");
    }

    #[test]
    fn device_identification_loop_detected() {
        let req = Request::ReadDeviceIdentification {
            category: 1,
            object_id: 5,
        };
        let pdu = [0x2B, 0x0E, 0x01, 0x83, 0x01, 0x05, 0x00];
        assert!(decode(&req, &pdu).is_err());
    }
}
