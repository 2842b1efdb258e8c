//! On-disk layout of `local` databases.
//!
//! ```text
//! <storage root>/<database>/
//! ├─ LOCK            holder pid; flock-ed while a handle is open
//! └─ segments.dat    segment log
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = "LOCK";
const SEGMENT_FILE: &str = "segments.dat";

/// Exclusive handle on a database directory.
///
/// The lock is advisory (`flock`) and lasts until the handle is dropped.
#[derive(Debug)]
pub struct DatabaseDir {
    root: PathBuf,
    lock: File,
}

impl DatabaseDir {
    /// Locks the directory at `root`, creating it when `create` is set.
    ///
    /// Fails with `DatabaseLocked` when another handle, in this process or
    /// another one, holds the directory.
    pub fn open(root: &Path, create: bool) -> CoreResult<Self> {
        match fs::metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(CoreError::invalid_operation(format!(
                    "{} exists and is not a directory",
                    root.display()
                )))
            }
            Err(_) if create => fs::create_dir_all(root)?,
            Err(_) => {
                return Err(CoreError::DatabaseNotFound {
                    name: root.display().to_string(),
                })
            }
        }

        let mut lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        if lock.try_lock_exclusive().is_err() {
            debug!(path = %root.display(), holder = ?read_holder(&mut lock), "directory busy");
            return Err(CoreError::DatabaseLocked);
        }

        lock.set_len(0)?;
        lock.seek(SeekFrom::Start(0))?;
        write!(lock, "{}", std::process::id())?;
        lock.flush()?;

        Ok(Self {
            root: root.to_path_buf(),
            lock,
        })
    }

    /// Whether `root` holds a segment log.
    #[must_use]
    pub fn is_database(root: &Path) -> bool {
        root.join(SEGMENT_FILE).is_file()
    }

    /// The directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Location of the segment log.
    #[must_use]
    pub fn segment_path(&self) -> PathBuf {
        self.root.join(SEGMENT_FILE)
    }

    /// Process id recorded by the current holder.
    pub fn holder(&mut self) -> Option<u32> {
        read_holder(&mut self.lock)
    }
}

fn read_holder(lock: &mut File) -> Option<u32> {
    let mut text = String::new();
    lock.seek(SeekFrom::Start(0)).ok()?;
    lock.read_to_string(&mut text).ok()?;
    text.trim().parse().ok()
}
