//! Record identity and record types.

use crate::error::{CoreError, CoreResult};
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// Identifier of a cluster.
pub type ClusterId = i16;

/// Address of a record: `(cluster, position)`.
///
/// Identities are assigned by the store at creation and never change.
/// The textual form is `#<cluster>:<position>`, which is also the key the
/// record cache uses.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId {
    /// Cluster the record lives in.
    pub cluster_id: ClusterId,
    /// Position inside the cluster.
    pub position: i64,
}

impl RecordId {
    /// Position of a record that has not been stored yet.
    pub const POSITION_INVALID: i64 = -1;

    /// Creates an identity.
    #[must_use]
    pub const fn new(cluster_id: ClusterId, position: i64) -> Self {
        Self {
            cluster_id,
            position,
        }
    }

    /// Whether the identity can address a stored record.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.cluster_id >= 0 && self.position >= 0
    }

    /// Whether this is a batch-local placeholder handed out inside a transaction.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.position <= -2
    }

    /// Temporary identity of the `ordinal`-th record created in a transaction.
    #[must_use]
    pub const fn temporary(cluster_id: ClusterId, ordinal: usize) -> Self {
        Self::new(cluster_id, -2 - ordinal as i64)
    }

    /// Ordinal encoded by a temporary identity.
    #[must_use]
    pub const fn temporary_ordinal(&self) -> Option<usize> {
        if self.is_temporary() {
            Some((-2 - self.position) as usize)
        } else {
            None
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster_id, self.position)
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({self})")
    }
}

impl FromStr for RecordId {
    type Err = CoreError;

    /// Parses `#3:0`; the leading `#` is optional.
    fn from_str(text: &str) -> CoreResult<Self> {
        let body = text.strip_prefix('#').unwrap_or(text);
        let (cluster, position) = body
            .split_once(':')
            .ok_or_else(|| CoreError::invalid_record_id(text))?;
        let cluster_id = cluster
            .trim()
            .parse::<ClusterId>()
            .map_err(|_| CoreError::invalid_record_id(text))?;
        let position = position
            .trim()
            .parse::<i64>()
            .map_err(|_| CoreError::invalid_record_id(text))?;
        Ok(Self::new(cluster_id, position))
    }
}

/// One-byte tag describing how a record's content is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// Schema-aware document.
    Document,
    /// Opaque bytes.
    Bytes,
    /// Flat string content.
    Flat,
}

impl RecordType {
    /// Decodes the wire tag.
    #[must_use]
    pub const fn from_byte(tag: u8) -> Option<Self> {
        match tag {
            b'd' => Some(Self::Document),
            b'b' => Some(Self::Bytes),
            b'f' => Some(Self::Flat),
            _ => None,
        }
    }

    /// The wire tag.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Document => b'd',
            Self::Bytes => b'b',
            Self::Flat => b'f',
        }
    }
}

/// A versioned record as held by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Identity.
    pub id: RecordId,
    /// Version; 0 at creation, +1 per successful update.
    pub version: i32,
    /// Content tag.
    pub record_type: RecordType,
    /// Serialized content.
    pub content: Bytes,
}

impl Record {
    /// Creates a record snapshot.
    #[must_use]
    pub fn new(id: RecordId, version: i32, record_type: RecordType, content: impl Into<Bytes>) -> Self {
        Self {
            id,
            version,
            record_type,
            content: content.into(),
        }
    }

    /// The cache key of this record.
    #[must_use]
    pub fn cache_key(&self) -> String {
        self.id.to_string()
    }
}
