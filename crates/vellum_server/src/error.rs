//! Error types for the server.

use thiserror::Error;
use vellum_core::{CommitError, CoreError};
use vellum_protocol::ProtocolError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised while serving a request.
///
/// Every variant except a transport failure is reported to the client as an
/// error envelope carrying [`ServerError::category`].
#[derive(Error, Debug)]
pub enum ServerError {
    /// Wire-level failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Store, engine, or commit failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Bad credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The principal may not perform the operation.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The opcode needs a database and none is bound to the session.
    #[error("no database is open on this connection")]
    DatabaseNotOpen,

    /// Well-formed but unacceptable request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Command could not be executed.
    #[error("command failed: {0}")]
    Command(String),

    /// Unusable server configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error outside a connection (binding, config files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Category name sent in the error envelope.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Protocol(err) => match err {
                ProtocolError::Remote { .. } | ProtocolError::UnexpectedStatus(_) => "internal",
                _ => "decode",
            },
            Self::Core(err) => core_category(err),
            Self::AuthenticationFailed(_) => "authentication",
            Self::NotAuthorized(_) => "authorization",
            Self::DatabaseNotOpen => "not-open",
            Self::InvalidRequest(_) => "invalid-request",
            Self::Command(_) => "command",
            Self::Config(_) | Self::Internal(_) | Self::Io(_) => "internal",
        }
    }

    /// Whether the connection itself failed; no envelope can be sent.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Protocol(err) if err.is_transport())
    }

    /// Whether the failure is the server's fault rather than the request's.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        !self.is_transport() && self.category() == "internal"
    }
}

fn core_category(err: &CoreError) -> &'static str {
    match err {
        CoreError::VersionConflict { .. } => "version-conflict",
        CoreError::RecordNotFound { .. }
        | CoreError::ClusterNotFound { .. }
        | CoreError::DatabaseNotFound { .. } => "not-found",
        CoreError::ClusterExists { .. }
        | CoreError::DatabaseExists { .. }
        | CoreError::UnsupportedStorage { .. }
        | CoreError::InvalidRecordId { .. }
        | CoreError::InvalidTransaction { .. }
        | CoreError::InvalidOperation { .. } => "invalid-request",
        CoreError::DatabaseClosed => "not-open",
        CoreError::Storage(_)
        | CoreError::Io(_)
        | CoreError::SegmentCorruption { .. }
        | CoreError::ChecksumMismatch { .. }
        | CoreError::DatabaseLocked => "internal",
    }
}

impl From<CommitError<ProtocolError>> for ServerError {
    fn from(err: CommitError<ProtocolError>) -> Self {
        match err {
            CommitError::Store(err) => Self::Core(err),
            CommitError::Source(err) => Self::Protocol(err),
        }
    }
}
