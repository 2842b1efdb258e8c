//! In-memory backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// A backend that keeps the log in a `Vec<u8>`.
///
/// Backs `memory` databases: contents live as long as the database instance.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    bytes: RwLock<Vec<u8>>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-loaded with `bytes`, as if they had been appended.
    #[must_use]
    pub fn with_data(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let bytes = self.bytes.read();
        let size = bytes.len() as u64;
        let end = offset.checked_add(len as u64);

        match end {
            Some(end) if end <= size => {
                let start = offset as usize;
                Ok(bytes[start..start + len].to_vec())
            }
            _ => Err(StorageError::ReadPastEnd { offset, len, size }),
        }
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut bytes = self.bytes.write();
        let offset = bytes.len() as u64;
        bytes.extend_from_slice(data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut bytes = self.bytes.write();
        let size = bytes.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_size,
                size,
            });
        }
        bytes.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn appends_are_laid_out_back_to_back() {
        let mut log = InMemoryBackend::new();
        assert_eq!(log.append(b"put").unwrap(), 0);
        assert_eq!(log.append(b"tombstone").unwrap(), 3);
        assert_eq!(log.size().unwrap(), 12);
        assert_eq!(log.read_at(3, 9).unwrap(), b"tombstone");
    }

    #[test]
    fn read_past_end_is_rejected() {
        let mut log = InMemoryBackend::new();
        log.append(b"abc").unwrap();
        assert!(matches!(
            log.read_at(2, 5),
            Err(StorageError::ReadPastEnd { size: 3, .. })
        ));
        assert!(matches!(
            log.read_at(u64::MAX, 1),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn truncate_cuts_torn_tail() {
        let mut log = InMemoryBackend::with_data(b"complete-torn".to_vec());
        log.truncate(8).unwrap();
        assert_eq!(log.snapshot(), b"complete");
        assert!(matches!(
            log.truncate(100),
            Err(StorageError::TruncateBeyondEnd { requested: 100, size: 8 })
        ));
    }

    #[test]
    fn read_all_returns_whole_log() {
        let log = InMemoryBackend::with_data(vec![1, 2, 3]);
        assert_eq!(log.read_all().unwrap(), vec![1, 2, 3]);
        assert!(InMemoryBackend::new().read_all().unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn every_append_reads_back(chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..16)) {
            let mut log = InMemoryBackend::new();
            let offsets: Vec<u64> = chunks.iter().map(|c| log.append(c).unwrap()).collect();
            for (chunk, offset) in chunks.iter().zip(offsets) {
                prop_assert_eq!(&log.read_at(offset, chunk.len()).unwrap(), chunk);
            }
        }
    }
}
