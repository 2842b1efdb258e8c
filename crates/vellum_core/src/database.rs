//! Database facade and recovery.

use crate::commit::{CommitCoordinator, CommitError, CommitOutcome, TxEntry};
use crate::config::Config;
use crate::dictionary::Dictionary;
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::segment::SegmentManager;
use crate::stats::StoreStats;
use crate::store::RecordStore;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use vellum_storage::{FileBackend, InMemoryBackend, StorageBackend};

/// Where a database keeps its segment log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageMode {
    /// Process memory; gone when the server stops.
    Memory,
    /// A directory on disk.
    Local,
}

impl StorageMode {
    /// Engine name of this mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageMode {
    type Err = CoreError;

    fn from_str(mode: &str) -> CoreResult<Self> {
        match mode.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "local" => Ok(Self::Local),
            _ => Err(CoreError::UnsupportedStorage {
                mode: mode.to_string(),
            }),
        }
    }
}

/// Lifecycle event delivered to [`DatabaseListener`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEvent {
    /// The database was just created.
    Create,
    /// The database was opened from storage.
    Open,
    /// The database is closing.
    Close,
}

impl DatabaseEvent {
    /// Lower-case event name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Open => "open",
            Self::Close => "close",
        }
    }
}

/// Observer of database lifecycle events.
///
/// A failing listener never stops the lifecycle action; the failure is
/// collected and logged.
pub trait DatabaseListener: Send + Sync {
    /// Name used in failure reports.
    fn name(&self) -> &str;

    /// Called after the database was created.
    fn on_create(&self, _database: &Database) -> CoreResult<()> {
        Ok(())
    }

    /// Called after the database was opened from storage.
    fn on_open(&self, _database: &Database) -> CoreResult<()> {
        Ok(())
    }

    /// Called while the database closes; it no longer accepts commits.
    fn on_close(&self, _database: &Database) -> CoreResult<()> {
        Ok(())
    }
}

/// A failure reported by a component that must not block its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleFailure {
    /// Component that failed, e.g. `listener audit on demo`.
    pub component: String,
    /// Error text.
    pub message: String,
}

impl LifecycleFailure {
    /// Creates a failure record and logs it.
    pub fn new(component: impl Into<String>, message: impl Into<String>) -> Self {
        let failure = Self {
            component: component.into(),
            message: message.into(),
        };
        warn!(
            component = %failure.component,
            error = %failure.message,
            "lifecycle step failed"
        );
        failure
    }
}

impl fmt::Display for LifecycleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.component, self.message)
    }
}

/// An open database: record store, dictionary, and the log behind them.
pub struct Database {
    name: String,
    mode: StorageMode,
    config: Config,
    segments: Arc<SegmentManager>,
    store: RecordStore,
    dictionary: Dictionary,
    /// Directory lock of `local` databases; released on close.
    dir: Mutex<Option<DatabaseDir>>,
    listeners: RwLock<Vec<Arc<dyn DatabaseListener>>>,
    is_open: RwLock<bool>,
}

impl Database {
    /// Creates an empty in-memory database.
    pub fn open_in_memory(name: &str, config: Config) -> CoreResult<Self> {
        Self::open_with_backend(name, StorageMode::Memory, config, Box::new(InMemoryBackend::new()))
    }

    /// Opens (or creates) a `local` database stored in `path`.
    pub fn open_local(name: &str, path: &Path, config: Config, create: bool) -> CoreResult<Self> {
        let dir = DatabaseDir::open(path, create)?;
        let backend = FileBackend::open(&dir.segment_path())?;
        let database = Self::open_with_backend(name, StorageMode::Local, config, Box::new(backend))?;
        *database.dir.lock() = Some(dir);
        Ok(database)
    }

    /// Opens a database over an arbitrary backend, replaying its log.
    pub fn open_with_backend(
        name: &str,
        mode: StorageMode,
        config: Config,
        backend: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        let segments = Arc::new(SegmentManager::new(backend, config.sync_on_write));
        let log = segments.replay()?;
        let store = RecordStore::recover(&config, Arc::clone(&segments), &log)?;
        let dictionary = Dictionary::recover(Arc::clone(&segments), &log);
        info!(
            database = name,
            mode = %mode,
            replayed = log.len(),
            "database opened"
        );

        Ok(Self {
            name: name.to_string(),
            mode,
            config,
            segments,
            store,
            dictionary,
            dir: Mutex::new(None),
            listeners: RwLock::new(Vec::new()),
            is_open: RwLock::new(true),
        })
    }

    /// Database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage mode.
    #[must_use]
    pub const fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Returns database configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The record store.
    #[must_use]
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// The dictionary.
    #[must_use]
    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    /// Store statistics.
    #[must_use]
    pub fn stats(&self) -> &StoreStats {
        self.store.stats()
    }

    /// Applies a transaction batch; see [`CommitCoordinator::commit`].
    pub fn commit<I, E>(
        &self,
        client_tx_id: i32,
        entries: I,
    ) -> Result<CommitOutcome, CommitError<E>>
    where
        I: IntoIterator<Item = Result<TxEntry, E>>,
    {
        self.ensure_open()?;
        CommitCoordinator::new(&self.store).commit(client_tx_id, entries)
    }

    /// Registers a lifecycle listener.
    pub fn add_listener(&self, listener: Arc<dyn DatabaseListener>) {
        self.listeners.write().push(listener);
    }

    /// Delivers `event` to every listener, collecting failures.
    pub fn notify(&self, event: DatabaseEvent) -> Vec<LifecycleFailure> {
        let listeners = self.listeners.read().clone();
        listeners
            .iter()
            .filter_map(|listener| {
                let result = match event {
                    DatabaseEvent::Create => listener.on_create(self),
                    DatabaseEvent::Open => listener.on_open(self),
                    DatabaseEvent::Close => listener.on_close(self),
                };
                result.err().map(|err| {
                    LifecycleFailure::new(
                        format!(
                            "listener {} on {} ({})",
                            listener.name(),
                            self.name,
                            event.as_str()
                        ),
                        err.to_string(),
                    )
                })
            })
            .collect()
    }

    /// Closes the database: notifies listeners and syncs the log.
    ///
    /// Closing twice is a no-op. Failures are returned, never raised.
    pub fn close(&self) -> Vec<LifecycleFailure> {
        {
            let mut is_open = self.is_open.write();
            if !*is_open {
                return Vec::new();
            }
            *is_open = false;
        }

        let mut failures = self.notify(DatabaseEvent::Close);
        if let Err(err) = self.segments.flush().and_then(|()| self.segments.sync()) {
            failures.push(LifecycleFailure::new(
                format!("segment log of {}", self.name),
                err.to_string(),
            ));
        }
        // Another handle may open the directory from here on.
        self.dir.lock().take();

        info!(database = %self.name, "database closed");
        failures
    }

    /// Checks if the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    /// Ensures the database is open.
    pub fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
