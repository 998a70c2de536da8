//! Crate-level error taxonomy: protocol exceptions, integrity failures, and
//! transport-level I/O errors, all composed into one `Error`.

use std::fmt;

/// A Modbus exception code as returned in a negative PDU response (function
/// code with the high bit set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    NegativeAcknowledge,
    MemoryParityError,
    Other(u8),
}

impl ExceptionCode {
    pub fn from_byte(code: u8) -> Self {
        match code {
            1 => Self::IllegalFunction,
            2 => Self::IllegalDataAddress,
            3 => Self::IllegalDataValue,
            4 => Self::ServerDeviceFailure,
            5 => Self::Acknowledge,
            6 => Self::ServerDeviceBusy,
            7 => Self::NegativeAcknowledge,
            8 => Self::MemoryParityError,
            other => Self::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::IllegalFunction => 1,
            Self::IllegalDataAddress => 2,
            Self::IllegalDataValue => 3,
            Self::ServerDeviceFailure => 4,
            Self::Acknowledge => 5,
            Self::ServerDeviceBusy => 6,
            Self::NegativeAcknowledge => 7,
            Self::MemoryParityError => 8,
            Self::Other(b) => b,
        }
    }

    pub fn is_server_busy(self) -> bool {
        matches!(self, Self::ServerDeviceBusy)
    }

    pub fn is_illegal_function(self) -> bool {
        matches!(self, Self::IllegalFunction)
    }

    pub fn is_illegal_data_address(self) -> bool {
        matches!(self, Self::IllegalDataAddress)
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IllegalFunction => "illegal function",
            Self::IllegalDataAddress => "illegal data address",
            Self::IllegalDataValue => "illegal data value",
            Self::ServerDeviceFailure => "server device failure",
            Self::Acknowledge => "acknowledge",
            Self::ServerDeviceBusy => "server device busy",
            Self::NegativeAcknowledge => "negative acknowledge",
            Self::MemoryParityError => "memory parity error",
            Self::Other(b) => return write!(f, "unknown exception code {b}"),
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("device returned exception: {0}")]
    Exception(ExceptionCode),

    #[error("CRC mismatch: calculated {calculated:#06x}, received {received:#06x}")]
    CrcMismatch { calculated: u16, received: u16 },

    #[error("response was incomplete: expected at least {expected} bytes, got {actual}")]
    IncompleteResponse { expected: usize, actual: usize },

    #[error("response address {actual:#06x} did not match request address {expected:#06x}")]
    AddressMismatch { expected: u16, actual: u16 },

    #[error("write confirmation mismatch: expected {expected:?}, got {actual:?}")]
    WriteMismatch { expected: Vec<u8>, actual: Vec<u8> },

    #[error("device identification read loop detected (next object id {next} <= last requested {last})")]
    ReadDeviceIdentificationLoop { next: u8, last: u8 },

    #[error("address {0} is not present in the collection")]
    AddressNotFound(u16),

    #[error("collection holds a different object type than requested")]
    ObjectTypeMismatch,

    #[error("range end {end} is before range start {start}")]
    InvalidRange { start: u16, end: u16 },

    #[error("could not resolve or connect to `{1}`")]
    Connect(#[source] std::io::Error, String),

    #[error("could not open serial device {1:?}")]
    OpenSerial(#[source] std::io::Error, std::path::PathBuf),

    #[error("could not read from the transport")]
    Receive(#[source] std::io::Error),

    #[error("could not write to the transport")]
    Send(#[source] std::io::Error),

    #[error("could not flush the transport")]
    Flush(#[source] std::io::Error),

    #[error("could not shut down the connection")]
    Shutdown(#[source] std::io::Error),

    #[error("request timed out")]
    Timeout,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("connection is closed and no factory is available to reopen it")]
    NoConnection,

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

impl Error {
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            Self::Exception(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled
                | Self::CrcMismatch { .. }
                | Self::IncompleteResponse { .. }
                | Self::AddressMismatch { .. }
                | Self::WriteMismatch { .. }
                | Self::ReadDeviceIdentificationLoop { .. }
                | Self::AddressNotFound(_)
                | Self::ObjectTypeMismatch
                | Self::InvalidRange { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
