//! Optimistic transaction commit.
//!
//! A batch is applied entry by entry against the [`RecordStore`], each
//! write carrying its own version check. Nothing is locked across the
//! batch; instead every applied entry leaves an undo step, and the first
//! failure replays those steps in reverse so the batch is all-or-nothing.

use crate::error::{CoreError, CoreResult};
use crate::store::RecordStore;
use crate::types::{ClusterId, Record, RecordId, RecordType};
use bytes::Bytes;
use std::fmt;
use tracing::{debug, error, warn};

/// What a transaction entry does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Creates a record.
    Created,
    /// Replaces a record's content.
    Updated,
    /// Removes a record.
    Deleted,
}

impl TxStatus {
    /// Decodes the wire status byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Created),
            2 => Some(Self::Updated),
            3 => Some(Self::Deleted),
            _ => None,
        }
    }

    /// The wire status byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Created => 1,
            Self::Updated => 2,
            Self::Deleted => 3,
        }
    }
}

/// One decoded mutation of a transaction batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEntry {
    /// Kind of mutation.
    pub status: TxStatus,
    /// Target identity; the position is [`RecordId::POSITION_INVALID`] for creations.
    pub id: RecordId,
    /// Version the client last read (updates and deletes).
    pub expected_version: i32,
    /// New content (creations and updates).
    pub content: Option<Bytes>,
    /// Target cluster name (creations).
    pub cluster_name: Option<String>,
}

impl TxEntry {
    /// A creation in `cluster_id`, or in the named cluster when given.
    pub fn created(
        cluster_id: ClusterId,
        cluster_name: Option<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        Self {
            status: TxStatus::Created,
            id: RecordId::new(cluster_id, RecordId::POSITION_INVALID),
            expected_version: 0,
            content: Some(content.into()),
            cluster_name,
        }
    }

    /// An update of `id` expected to be at `expected_version`.
    pub fn updated(id: RecordId, expected_version: i32, content: impl Into<Bytes>) -> Self {
        Self {
            status: TxStatus::Updated,
            id,
            expected_version,
            content: Some(content.into()),
            cluster_name: None,
        }
    }

    /// A deletion of `id` expected to be at `expected_version`.
    pub fn deleted(id: RecordId, expected_version: i32) -> Self {
        Self {
            status: TxStatus::Deleted,
            id,
            expected_version,
            content: None,
            cluster_name: None,
        }
    }
}

/// Result of a committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Client-chosen transaction id, echoed back.
    pub client_tx_id: i32,
    /// `(temporary id, assigned id)` per created record, in batch order.
    pub created: Vec<(RecordId, RecordId)>,
    /// `(id, new version)` per updated record, in batch order.
    pub updated: Vec<(RecordId, i32)>,
    /// Number of deleted records.
    pub deleted: usize,
}

/// Why a batch did not commit.
///
/// `Source` carries failures of the entry source (for a wire transaction,
/// a decode error); the batch is rolled back in both cases.
#[derive(Debug)]
pub enum CommitError<E> {
    /// An entry failed against the store.
    Store(CoreError),
    /// The entry source failed.
    Source(E),
}

impl<E: fmt::Display> fmt::Display for CommitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(err) => write!(f, "commit failed: {err}"),
            Self::Source(err) => write!(f, "commit aborted: {err}"),
        }
    }
}

impl<E> std::error::Error for CommitError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Source(err) => Some(err),
        }
    }
}

impl<E> From<CoreError> for CommitError<E> {
    fn from(err: CoreError) -> Self {
        Self::Store(err)
    }
}

enum Undo {
    Created { id: RecordId },
    Updated { written: i32, previous: Record },
    Deleted { previous: Record },
}

/// Applies transaction batches to a store.
#[derive(Debug, Clone, Copy)]
pub struct CommitCoordinator<'a> {
    store: &'a RecordStore,
}

impl<'a> CommitCoordinator<'a> {
    /// Creates a coordinator over `store`.
    #[must_use]
    pub const fn new(store: &'a RecordStore) -> Self {
        Self { store }
    }

    /// Applies `entries` in order as one unit.
    ///
    /// The `n`-th created entry (0-based) is known inside the batch by the
    /// temporary identity `(clusterId, -2 - n)`; later entries addressing a
    /// position `<= -2` are redirected to the record that entry created.
    ///
    /// On the first failure every applied entry is compensated in reverse
    /// order and no further entry is pulled from `entries`.
    pub fn commit<I, E>(
        &self,
        client_tx_id: i32,
        entries: I,
    ) -> Result<CommitOutcome, CommitError<E>>
    where
        I: IntoIterator<Item = Result<TxEntry, E>>,
    {
        let mut outcome = CommitOutcome {
            client_tx_id,
            ..CommitOutcome::default()
        };
        let mut undo = Vec::new();

        for (index, entry) in entries.into_iter().enumerate() {
            let result = match entry {
                Ok(entry) => self
                    .apply(entry, &mut outcome, &mut undo)
                    .map_err(CommitError::Store),
                Err(err) => Err(CommitError::Source(err)),
            };
            if let Err(err) = result {
                debug!(
                    tx = client_tx_id,
                    entry = index,
                    applied = undo.len(),
                    "transaction entry failed; rolling back"
                );
                self.rollback(client_tx_id, undo);
                return Err(err);
            }
        }

        self.store.stats().record_commit();
        debug!(
            tx = client_tx_id,
            created = outcome.created.len(),
            updated = outcome.updated.len(),
            deleted = outcome.deleted,
            "transaction committed"
        );
        Ok(outcome)
    }

    fn apply(
        &self,
        entry: TxEntry,
        outcome: &mut CommitOutcome,
        undo: &mut Vec<Undo>,
    ) -> CoreResult<()> {
        match entry.status {
            TxStatus::Created => {
                let content = entry
                    .content
                    .ok_or_else(|| CoreError::invalid_transaction("created entry has no content"))?;
                let cluster_id = self.target_cluster(entry.id.cluster_id, entry.cluster_name.as_deref())?;
                let record = self.store.create(cluster_id, content, RecordType::Document)?;
                let temporary = RecordId::temporary(entry.id.cluster_id, outcome.created.len());
                undo.push(Undo::Created { id: record.id });
                outcome.created.push((temporary, record.id));
            }
            TxStatus::Updated => {
                let content = entry
                    .content
                    .ok_or_else(|| CoreError::invalid_transaction("updated entry has no content"))?;
                let id = resolve(entry.id, &outcome.created)?;
                let (updated, previous) =
                    self.store
                        .replace(id, content, entry.expected_version, None)?;
                undo.push(Undo::Updated {
                    written: updated.version,
                    previous,
                });
                outcome.updated.push((id, updated.version));
            }
            TxStatus::Deleted => {
                let id = resolve(entry.id, &outcome.created)?;
                let previous = self.store.remove(id, entry.expected_version)?;
                undo.push(Undo::Deleted { previous });
                outcome.deleted += 1;
            }
        }
        Ok(())
    }

    fn target_cluster(&self, cluster_id: ClusterId, name: Option<&str>) -> CoreResult<ClusterId> {
        match name.filter(|name| !name.is_empty()) {
            Some(name) => self
                .store
                .cluster_id_by_name(name)
                .ok_or_else(|| CoreError::cluster_name_not_found(name)),
            None if cluster_id >= 0 => Ok(cluster_id),
            None => self.store.default_cluster_id(),
        }
    }

    fn rollback(&self, client_tx_id: i32, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            let (id, result) = match &step {
                Undo::Created { id } => (*id, self.store.compensate(*id, Some(0), None)),
                Undo::Updated { written, previous } => (
                    previous.id,
                    self.store
                        .compensate(previous.id, Some(*written), Some(previous)),
                ),
                Undo::Deleted { previous } => (
                    previous.id,
                    self.store.compensate(previous.id, None, Some(previous)),
                ),
            };
            match result {
                Ok(true) => {}
                Ok(false) => warn!(
                    tx = client_tx_id,
                    record = %id,
                    "record changed after this transaction wrote it; compensation skipped"
                ),
                Err(err) => error!(
                    tx = client_tx_id,
                    record = %id,
                    error = %err,
                    "compensation failed"
                ),
            }
        }
        self.store.stats().record_rollback();
    }
}

/// Maps a temporary identity to the record created for it in this batch.
fn resolve(id: RecordId, created: &[(RecordId, RecordId)]) -> CoreResult<RecordId> {
    match id.temporary_ordinal() {
        None => Ok(id),
        Some(ordinal) => created
            .get(ordinal)
            .map(|(_, assigned)| *assigned)
            .ok_or_else(|| {
                CoreError::invalid_transaction(format!(
                    "{id} refers to a record not created earlier in the transaction"
                ))
            }),
    }
}
