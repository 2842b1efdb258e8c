//! Store statistics.
//!
//! Counters are bumped by the record store, the cache, and the commit
//! coordinator. `store_reads` counts reads that reached cluster storage,
//! so it stays flat while a record is served from the cache.

use std::sync::atomic::{AtomicU64, Ordering};

/// Store statistics.
///
/// All counters are atomic and can be read while operations are in progress.
#[derive(Debug, Default)]
pub struct StoreStats {
    /// Reads served by cluster storage.
    store_reads: AtomicU64,
    /// Reads served by the cache.
    cache_hits: AtomicU64,
    /// Cache lookups that fell through to storage.
    cache_misses: AtomicU64,
    /// Records created.
    creates: AtomicU64,
    /// Records updated.
    updates: AtomicU64,
    /// Records deleted.
    deletes: AtomicU64,
    /// Writes rejected for a stale version.
    version_conflicts: AtomicU64,
    /// Transaction batches applied.
    commits: AtomicU64,
    /// Transaction batches rolled back.
    rollbacks: AtomicU64,
    /// Content bytes written.
    bytes_written: AtomicU64,
    /// Content bytes read from storage.
    bytes_read: AtomicU64,
}

impl StoreStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_store_read(&self, bytes: u64) {
        self.store_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_create(&self, bytes: u64) {
        self.creates.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_update(&self, bytes: u64) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_version_conflict(&self) {
        self.version_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads that reached cluster storage.
    pub fn store_reads(&self) -> u64 {
        self.store_reads.load(Ordering::Relaxed)
    }

    /// Reads answered from the cache.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Cache lookups that missed.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Records created.
    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::Relaxed)
    }

    /// Records updated.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Records deleted.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Writes rejected because the caller's version was stale.
    pub fn version_conflicts(&self) -> u64 {
        self.version_conflicts.load(Ordering::Relaxed)
    }

    /// Transaction batches fully applied.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Transaction batches rolled back.
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    /// Content bytes written.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Content bytes read from storage.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            store_reads: self.store_reads(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            creates: self.creates(),
            updates: self.updates(),
            deletes: self.deletes(),
            version_conflicts: self.version_conflicts(),
            commits: self.commits(),
            rollbacks: self.rollbacks(),
            bytes_written: self.bytes_written(),
            bytes_read: self.bytes_read(),
        }
    }
}

/// A point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Reads that reached cluster storage.
    pub store_reads: u64,
    /// Reads answered from the cache.
    pub cache_hits: u64,
    /// Cache lookups that missed.
    pub cache_misses: u64,
    /// Records created.
    pub creates: u64,
    /// Records updated.
    pub updates: u64,
    /// Records deleted.
    pub deletes: u64,
    /// Writes rejected for a stale version.
    pub version_conflicts: u64,
    /// Transaction batches applied.
    pub commits: u64,
    /// Transaction batches rolled back.
    pub rollbacks: u64,
    /// Content bytes written.
    pub bytes_written: u64,
    /// Content bytes read from storage.
    pub bytes_read: u64,
}
