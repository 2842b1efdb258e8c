//! Error types for the wire protocol.

use std::io;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while reading or writing protocol messages.
///
/// [`ProtocolError::Io`] is a transport failure: the connection is gone or
/// unusable. Every other variant is a decode failure of one request and
/// leaves the connection usable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The transport failed (EOF, reset, timeout).
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// A length prefix below -1.
    #[error("invalid length prefix {len}")]
    InvalidLength {
        /// The length read.
        len: i32,
    },

    /// A length prefix above the channel limit.
    #[error("length {len} exceeds the limit of {max} bytes")]
    LengthTooLarge {
        /// The length read.
        len: i32,
        /// The configured limit.
        max: usize,
    },

    /// A string operand is not UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// A record type tag outside `d`, `b`, `f`.
    #[error("unknown record type {0:#04x}")]
    UnknownRecordType(u8),

    /// A transaction entry status outside 1..=3.
    #[error("unknown transaction entry status {0}")]
    UnknownTxStatus(u8),

    /// A negative entry count in a transaction header.
    #[error("negative transaction entry count {0}")]
    NegativeEntryCount(i32),

    /// A null where a value is required.
    #[error("missing {0}")]
    MissingValue(&'static str),

    /// A record identity that does not parse.
    #[error("invalid record id: {0}")]
    InvalidRecordId(String),

    /// A command payload that does not decode.
    #[error("invalid command payload: {0}")]
    Command(String),

    /// The server answered with an error envelope.
    #[error("server error [{}]: {}", .category.as_deref().unwrap_or("unknown"), .message.as_deref().unwrap_or("no message"))]
    Remote {
        /// Category name, if the server sent one.
        category: Option<String>,
        /// Message, if the server sent one.
        message: Option<String>,
    },

    /// A status byte that is neither OK nor ERROR.
    #[error("unexpected response status {0}")]
    UnexpectedStatus(u8),
}

impl ProtocolError {
    /// Whether the transport itself failed.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Category of an error envelope received from the server.
    #[must_use]
    pub fn remote_category(&self) -> Option<&str> {
        match self {
            Self::Remote { category, .. } => category.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        let eof = ProtocolError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(eof.is_transport());
        assert!(!ProtocolError::InvalidUtf8.is_transport());
        assert!(!ProtocolError::UnknownTxStatus(9).is_transport());
    }

    #[test]
    fn remote_display() {
        let err = ProtocolError::Remote {
            category: Some("not-found".into()),
            message: Some("record not found: #3:0".into()),
        };
        assert_eq!(
            err.to_string(),
            "server error [not-found]: record not found: #3:0"
        );
        assert_eq!(err.remote_category(), Some("not-found"));

        let bare = ProtocolError::Remote {
            category: None,
            message: None,
        };
        assert_eq!(bare.to_string(), "server error [unknown]: no message");
    }
}
