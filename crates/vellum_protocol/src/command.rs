//! Command payloads.
//!
//! The COMMAND opcode carries a mode byte and a CBOR-encoded
//! [`CommandRequest`]. Synchronous results are tagged with one byte:
//!
//! | Tag | Body |
//! |---|---|
//! | `n` | null `bytes` |
//! | `r` | record frame |
//! | `a` | `bytes` holding a CBOR [`CommandValue`] |
//!
//! Asynchronous results are a stream of `1` + record frame, closed by `0`.

use crate::error::{ProtocolError, ProtocolResult};
use crate::opcode::COMMAND_ASYNC;
use serde::{Deserialize, Serialize};

/// Result tag: no value.
pub const RESULT_NULL: u8 = b'n';
/// Result tag: one record frame.
pub const RESULT_RECORD: u8 = b'r';
/// Result tag: a CBOR value.
pub const RESULT_VALUE: u8 = b'a';

/// Stream marker preceding one record frame.
pub const STREAM_RECORD: u8 = 1;
/// Stream marker closing an asynchronous result.
pub const STREAM_END: u8 = 0;

/// How the client wants results delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    /// One tagged result.
    Sync,
    /// A stream of record frames.
    Async,
}

impl CommandMode {
    /// Decodes the mode byte; anything but `a` is synchronous.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        if byte == COMMAND_ASYNC {
            Self::Async
        } else {
            Self::Sync
        }
    }

    /// The mode byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Sync => crate::opcode::COMMAND_SYNC,
            Self::Async => COMMAND_ASYNC,
        }
    }
}

/// A command and its result limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Command text.
    pub text: String,
    /// Maximum number of results; `-1` for no limit.
    #[serde(default = "unlimited")]
    pub limit: i32,
}

const fn unlimited() -> i32 {
    -1
}

impl CommandRequest {
    /// A request without a result limit.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            limit: -1,
        }
    }

    /// Caps the number of results.
    #[must_use]
    pub fn with_limit(mut self, limit: i32) -> Self {
        self.limit = limit;
        self
    }

    /// The limit as a count; `None` when unlimited.
    #[must_use]
    pub fn max_results(&self) -> Option<usize> {
        usize::try_from(self.limit).ok()
    }

    /// Encodes the request as CBOR.
    ///
    /// # Errors
    ///
    /// Serializer failures.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes a CBOR request.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Command`] when the payload is not a request.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_cbor(bytes)
    }
}

/// A scalar or list result of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandValue {
    /// No value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Integer(i64),
    /// Floating point.
    Float(f64),
    /// Text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered values.
    List(Vec<CommandValue>),
    /// A record identity in `#c:p` form.
    Rid(String),
}

impl CommandValue {
    /// Encodes the value as CBOR.
    ///
    /// # Errors
    ///
    /// Serializer failures.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes a CBOR value.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Command`] when the payload is not a value.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_cbor(bytes)
    }
}

fn encode_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|err| ProtocolError::Command(err.to_string()))?;
    Ok(buf)
}

fn decode_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::de::from_reader(bytes).map_err(|err| ProtocolError::Command(err.to_string()))
}
