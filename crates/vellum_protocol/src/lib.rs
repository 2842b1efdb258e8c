//! # Vellum Protocol
//!
//! Binary wire protocol spoken between Vellum clients and servers.
//!
//! This crate provides:
//! - [`Channel`] / [`WireChannel`]: big-endian primitives over a buffered transport
//! - [`opcode`]: request opcodes and status bytes
//! - [`frame`]: the record frame
//! - [`TransactionProxy`]: streaming decoder for TX_COMMIT batches
//! - [`command`]: CBOR command requests and results
//! - [`RemoteClient`]: a blocking client

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod client;
pub mod command;
mod error;
pub mod frame;
pub mod opcode;
pub mod transaction;

pub use channel::{Channel, InputSource, WireChannel, DEFAULT_MAX_LENGTH};
pub use client::{CommandResult, RemoteClient};
pub use command::{CommandMode, CommandRequest, CommandValue};
pub use error::{ProtocolError, ProtocolResult};
pub use transaction::{write_transaction, TransactionEntries, TransactionProxy};
