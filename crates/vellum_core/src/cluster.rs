//! Cluster descriptors.

use crate::types::{ClusterId, RecordId};

/// How a cluster stores its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterKind {
    /// Owns its own storage.
    Physical {
        /// Storage file hint supplied at creation, if any.
        file_name: Option<String>,
        /// Initial size hint; -1 when unspecified.
        start_size: i32,
    },
    /// Keeps its records inside a physical container cluster.
    Logical {
        /// The physical cluster holding the records.
        container_id: ClusterId,
        /// Descriptor record created in the container.
        descriptor: RecordId,
    },
}

impl ClusterKind {
    /// Whether this is a logical cluster.
    #[must_use]
    pub const fn is_logical(&self) -> bool {
        matches!(self, Self::Logical { .. })
    }

    /// Human-readable kind name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Physical { .. } => "physical",
            Self::Logical { .. } => "logical",
        }
    }
}

/// Public description of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    /// Numeric id, unique within the database.
    pub id: ClusterId,
    /// Name, unique within the database.
    pub name: String,
    /// Storage kind.
    pub kind: ClusterKind,
}

impl ClusterInfo {
    /// The cluster whose storage holds this cluster's records.
    #[must_use]
    pub const fn storage_id(&self) -> ClusterId {
        match self.kind {
            ClusterKind::Physical { .. } => self.id,
            ClusterKind::Logical { container_id, .. } => container_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_id_follows_container() {
        let physical = ClusterInfo {
            id: 2,
            name: "default".into(),
            kind: ClusterKind::Physical {
                file_name: None,
                start_size: -1,
            },
        };
        assert_eq!(physical.storage_id(), 2);
        assert_eq!(physical.kind.as_str(), "physical");

        let logical = ClusterInfo {
            id: 7,
            name: "people".into(),
            kind: ClusterKind::Logical {
                container_id: 2,
                descriptor: RecordId::new(2, 0),
            },
        };
        assert_eq!(logical.storage_id(), 2);
        assert!(logical.kind.is_logical());
    }
}
