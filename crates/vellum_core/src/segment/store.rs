//! Segment log management.

use crate::error::{CoreError, CoreResult};
use crate::segment::record::SegmentRecord;
use parking_lot::RwLock;
use tracing::{debug, warn};
use vellum_storage::StorageBackend;

/// Owns the storage backend of one database and appends log records to it.
pub struct SegmentManager {
    backend: RwLock<Box<dyn StorageBackend>>,
    sync_on_write: bool,
}

impl SegmentManager {
    /// Creates a manager over `backend`.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> Self {
        Self {
            backend: RwLock::new(backend),
            sync_on_write,
        }
    }

    /// Appends a record and returns the offset it was written at.
    pub fn append(&self, record: &SegmentRecord) -> CoreResult<u64> {
        let encoded = record.encode();
        let mut backend = self.backend.write();
        let offset = backend.append(&encoded)?;
        if self.sync_on_write {
            backend.sync()?;
        }
        Ok(offset)
    }

    /// Reads every complete record from the start of the log.
    ///
    /// A record cut short at the end of the log is the trace of an
    /// interrupted append; it is truncated away and replay succeeds. A
    /// complete record with a bad checksum is corruption and fails.
    pub fn replay(&self) -> CoreResult<Vec<SegmentRecord>> {
        let mut backend = self.backend.write();
        let data = backend.read_all()?;
        let size = data.len();

        let mut records = Vec::new();
        let mut offset = 0usize;

        while offset < size {
            if offset + 4 > size {
                break;
            }
            let record_len = u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            if record_len == 0 {
                return Err(CoreError::segment_corruption(format!(
                    "zero-length record at offset {offset}"
                )));
            }
            if offset + record_len > size {
                break;
            }

            records.push(SegmentRecord::decode(&data[offset..offset + record_len])?);
            offset += record_len;
        }

        if offset < size {
            warn!(
                offset,
                dropped = size - offset,
                "truncating torn record at end of segment log"
            );
            backend.truncate(offset as u64)?;
        }

        debug!(records = records.len(), bytes = offset, "segment log replayed");
        Ok(records)
    }

    /// Flushes buffered writes.
    pub fn flush(&self) -> CoreResult<()> {
        self.backend.write().flush()?;
        Ok(())
    }

    /// Makes every appended record durable.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.write().sync()?;
        Ok(())
    }

    /// Size of the log in bytes.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.read().size()?)
    }
}

impl std::fmt::Debug for SegmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentManager")
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}
