//! Error types for Vellum core.

use crate::types::RecordId;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the record store, the engines, and the commit coordinator.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] vellum_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The segment log is unreadable.
    #[error("segment corruption: {message}")]
    SegmentCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch in the segment log.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum stored with the record.
        expected: u32,
        /// Checksum computed over the record.
        actual: u32,
    },

    /// The caller's version does not match the stored one.
    #[error("version conflict on {id}: expected version {expected}, found {actual}")]
    VersionConflict {
        /// Record that conflicted.
        id: RecordId,
        /// Version the caller supplied.
        expected: i32,
        /// Version currently stored.
        actual: i32,
    },

    /// No record at the given identity.
    #[error("record not found: {id}")]
    RecordNotFound {
        /// The identity looked up.
        id: RecordId,
    },

    /// Cluster lookup failed.
    #[error("cluster not found: {cluster}")]
    ClusterNotFound {
        /// Name or numeric id of the cluster.
        cluster: String,
    },

    /// A cluster with the same name already exists.
    #[error("cluster already exists: {name}")]
    ClusterExists {
        /// Name of the cluster.
        name: String,
    },

    /// No database with this name.
    #[error("database not found: {name}")]
    DatabaseNotFound {
        /// Name of the database.
        name: String,
    },

    /// A database with this name already exists.
    #[error("database already exists: {name}")]
    DatabaseExists {
        /// Name of the database.
        name: String,
    },

    /// No engine is registered for the requested storage mode.
    #[error("unsupported storage mode: {mode}")]
    UnsupportedStorage {
        /// The requested mode.
        mode: String,
    },

    /// Text that does not parse as `#cluster:position`.
    #[error("invalid record id: {text}")]
    InvalidRecordId {
        /// The offending text.
        text: String,
    },

    /// A transaction batch is malformed.
    #[error("invalid transaction: {message}")]
    InvalidTransaction {
        /// What is wrong with the batch.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Another handle holds the database directory.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,
}

impl CoreError {
    /// Creates a segment corruption error.
    pub fn segment_corruption(message: impl Into<String>) -> Self {
        Self::SegmentCorruption {
            message: message.into(),
        }
    }

    /// Creates a not-found error for a cluster id.
    pub fn cluster_id_not_found(id: i16) -> Self {
        Self::ClusterNotFound {
            cluster: id.to_string(),
        }
    }

    /// Creates a not-found error for a cluster name.
    pub fn cluster_name_not_found(name: impl Into<String>) -> Self {
        Self::ClusterNotFound {
            cluster: name.into(),
        }
    }

    /// Creates an invalid record id error.
    pub fn invalid_record_id(text: impl Into<String>) -> Self {
        Self::InvalidRecordId { text: text.into() }
    }

    /// Creates an invalid transaction error.
    pub fn invalid_transaction(message: impl Into<String>) -> Self {
        Self::InvalidTransaction {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Whether the error is an optimistic concurrency failure.
    #[must_use]
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
