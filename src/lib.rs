//! Modbus TCP and RTU protocol engine: a client with read/write/device-id
//! transactions, retry and protocol auto-adaptation, and a server-side frame
//! listener that dispatches parsed requests to a user-supplied [`Handler`].
//!
//! See [`client::Client`] for the client entry point and [`server::Listener`]
//! for the server entry point. [`object::ObjectCollection`] is the typed
//! sparse address-keyed value store both sides build requests from and
//! decode responses into.

pub mod byte_ring;
pub mod client;
pub mod crc;
pub mod error;
pub mod frame;
pub mod object;
pub mod range;
pub mod server;
pub mod transport;

pub use client::{Client, ClientConfig, ConnectionFactory, RtuConnectionFactory, TcpConnectionFactory};
pub use error::{Error, ExceptionCode, Result};
pub use object::{ObjectCollection, ObjectType};
pub use range::Range;
pub use server::{Handler, Listener};
