//! Per-database dictionary: string keys bound to record identities.

use crate::error::CoreResult;
use crate::segment::{SegmentManager, SegmentRecord};
use crate::types::RecordId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Key → record map persisted in the database's segment log.
pub struct Dictionary {
    entries: RwLock<BTreeMap<String, RecordId>>,
    segments: Arc<SegmentManager>,
}

impl Dictionary {
    /// Rebuilds the dictionary from replayed log records.
    pub fn recover(segments: Arc<SegmentManager>, log: &[SegmentRecord]) -> Self {
        let mut entries = BTreeMap::new();
        for record in log {
            match record {
                SegmentRecord::DictionaryPut { key, id } => {
                    entries.insert(key.clone(), *id);
                }
                SegmentRecord::DictionaryRemoved { key } => {
                    entries.remove(key);
                }
                _ => {}
            }
        }
        Self {
            entries: RwLock::new(entries),
            segments,
        }
    }

    /// Record bound to `key`.
    pub fn get(&self, key: &str) -> Option<RecordId> {
        self.entries.read().get(key).copied()
    }

    /// Binds `key` to `id`; returns the previous binding.
    pub fn put(&self, key: &str, id: RecordId) -> CoreResult<Option<RecordId>> {
        let mut entries = self.entries.write();
        self.segments.append(&SegmentRecord::DictionaryPut {
            key: key.to_string(),
            id,
        })?;
        Ok(entries.insert(key.to_string(), id))
    }

    /// Drops `key`; returns the binding it had.
    pub fn remove(&self, key: &str) -> CoreResult<Option<RecordId>> {
        let mut entries = self.entries.write();
        if !entries.contains_key(key) {
            return Ok(None);
        }
        self.segments.append(&SegmentRecord::DictionaryRemoved {
            key: key.to_string(),
        })?;
        Ok(entries.remove(key))
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no key is bound.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Every key, in order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dictionary")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_storage::InMemoryBackend;

    fn segments() -> Arc<SegmentManager> {
        Arc::new(SegmentManager::new(Box::new(InMemoryBackend::new()), false))
    }

    #[test]
    fn put_get_remove() {
        let dict = Dictionary::recover(segments(), &[]);
        assert!(dict.is_empty());

        assert_eq!(dict.put("root", RecordId::new(2, 0)).unwrap(), None);
        assert_eq!(
            dict.put("root", RecordId::new(2, 1)).unwrap(),
            Some(RecordId::new(2, 0))
        );
        assert_eq!(dict.get("root"), Some(RecordId::new(2, 1)));
        assert_eq!(dict.len(), 1);

        assert_eq!(dict.remove("root").unwrap(), Some(RecordId::new(2, 1)));
        assert_eq!(dict.remove("root").unwrap(), None);
        assert!(dict.get("root").is_none());
    }

    #[test]
    fn keys_are_sorted() {
        let dict = Dictionary::recover(segments(), &[]);
        for key in ["b", "c", "a"] {
            dict.put(key, RecordId::new(2, 0)).unwrap();
        }
        assert_eq!(dict.keys(), vec!["a", "b", "c"]);
    }

    #[test]
    fn recovers_from_log() {
        let segments = segments();
        let dict = Dictionary::recover(Arc::clone(&segments), &[]);
        dict.put("kept", RecordId::new(3, 1)).unwrap();
        dict.put("dropped", RecordId::new(3, 2)).unwrap();
        dict.remove("dropped").unwrap();

        let log = segments.replay().unwrap();
        let recovered = Dictionary::recover(segments, &log);
        assert_eq!(recovered.keys(), vec!["kept"]);
        assert_eq!(recovered.get("kept"), Some(RecordId::new(3, 1)));
    }
}
