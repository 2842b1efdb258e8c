//! Read-through record cache.

use crate::types::Record;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Bounded map from a record's string identity to its latest known snapshot.
///
/// The cache never holds a version older than the store's: the store
/// refreshes or evicts an entry inside the same critical section that
/// mutates the record. When full, an arbitrary entry is evicted.
#[derive(Debug)]
pub struct RecordCache {
    entries: RwLock<HashMap<String, Record>>,
    capacity: usize,
}

impl RecordCache {
    /// Creates a cache holding at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Returns a copy of the cached record.
    pub fn get(&self, key: &str) -> Option<Record> {
        self.entries.read().get(key).cloned()
    }

    /// Stores `record` under `key`, evicting another entry when full.
    pub fn insert(&self, key: String, record: Record) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            if let Some(victim) = entries.keys().next().cloned() {
                entries.remove(&victim);
            }
        }
        entries.insert(key, record);
    }

    /// Drops the entry for `key`.
    pub fn remove(&self, key: &str) -> Option<Record> {
        self.entries.write().remove(key)
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Maximum number of records.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
