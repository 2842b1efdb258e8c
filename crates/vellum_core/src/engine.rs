//! Storage engines and the registry of open databases.
//!
//! The [`EngineRegistry`] is an explicit context object: the server builds
//! one at start-up, hands it to every connection, and shuts it down on stop.

use crate::config::Config;
use crate::database::{Database, DatabaseEvent, DatabaseListener, LifecycleFailure, StorageMode};
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Creates and opens databases of one storage mode.
pub trait StorageEngine: Send + Sync {
    /// Mode name, as used by DB_CREATE.
    fn name(&self) -> &'static str;

    /// Creates a new, empty database.
    fn create(&self, name: &str, config: &Config) -> CoreResult<Database>;

    /// Opens an existing database; `None` when this engine has no such database.
    fn open(&self, name: &str, config: &Config) -> CoreResult<Option<Database>>;

    /// Whether this engine holds a database called `name`.
    fn exists(&self, name: &str) -> bool;
}

/// Engine for `memory` databases.
///
/// Memory databases only live while the registry holds them, so there is
/// nothing to open or find on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryEngine;

impl StorageEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        StorageMode::Memory.as_str()
    }

    fn create(&self, name: &str, config: &Config) -> CoreResult<Database> {
        Database::open_in_memory(name, config.clone())
    }

    fn open(&self, _name: &str, _config: &Config) -> CoreResult<Option<Database>> {
        Ok(None)
    }

    fn exists(&self, _name: &str) -> bool {
        false
    }
}

/// Engine for `local` databases: one directory per database under `root`.
#[derive(Debug, Clone)]
pub struct LocalEngine {
    root: PathBuf,
}

impl LocalEngine {
    /// Creates an engine storing databases under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl StorageEngine for LocalEngine {
    fn name(&self) -> &'static str {
        StorageMode::Local.as_str()
    }

    fn create(&self, name: &str, config: &Config) -> CoreResult<Database> {
        let path = self.path_of(name);
        if DatabaseDir::is_database(&path) {
            return Err(CoreError::DatabaseExists {
                name: name.to_string(),
            });
        }
        Database::open_local(name, &path, config.clone(), true)
    }

    fn open(&self, name: &str, config: &Config) -> CoreResult<Option<Database>> {
        let path = self.path_of(name);
        if !DatabaseDir::is_database(&path) {
            return Ok(None);
        }
        Database::open_local(name, &path, config.clone(), false).map(Some)
    }

    fn exists(&self, name: &str) -> bool {
        DatabaseDir::is_database(&self.path_of(name))
    }
}

/// Outcome of shutting the registry down.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Databases that were closed.
    pub closed: Vec<String>,
    /// Steps that failed; none of them stopped the shutdown.
    pub failures: Vec<LifecycleFailure>,
}

impl ShutdownReport {
    /// Whether every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Appends another report.
    pub fn merge(&mut self, other: Self) {
        self.closed.extend(other.closed);
        self.failures.extend(other.failures);
    }
}

/// Registered engines plus every database opened through them.
pub struct EngineRegistry {
    config: Config,
    engines: RwLock<BTreeMap<String, Arc<dyn StorageEngine>>>,
    databases: RwLock<HashMap<String, Arc<Database>>>,
    listeners: RwLock<Vec<Arc<dyn DatabaseListener>>>,
    failures: Mutex<Vec<LifecycleFailure>>,
}

impl EngineRegistry {
    /// Creates a registry without engines.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            engines: RwLock::new(BTreeMap::new()),
            databases: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Creates a registry with the `memory` engine and, when a storage root
    /// is given, the `local` engine.
    pub fn with_default_engines(config: Config, storage_root: Option<&Path>) -> Self {
        let registry = Self::new(config);
        registry.register_engine(Arc::new(MemoryEngine));
        if let Some(root) = storage_root {
            registry.register_engine(Arc::new(LocalEngine::new(root)));
        }
        registry
    }

    /// Registers (or replaces) the engine for its mode name.
    pub fn register_engine(&self, engine: Arc<dyn StorageEngine>) {
        debug!(engine = engine.name(), "storage engine registered");
        self.engines
            .write()
            .insert(engine.name().to_string(), engine);
    }

    /// Names of the registered engines.
    pub fn engine_names(&self) -> Vec<String> {
        self.engines.read().keys().cloned().collect()
    }

    /// Adds a listener attached to every database created or opened from now on.
    pub fn add_listener(&self, listener: Arc<dyn DatabaseListener>) {
        self.listeners.write().push(listener);
    }

    /// Database configuration used for new and opened databases.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Attaches the registry listeners and announces `event`. A failing
    /// listener leaves the database usable; its failure is kept for
    /// [`take_failures`](Self::take_failures) and the shutdown report.
    fn attach(&self, database: &Database, event: DatabaseEvent) {
        for listener in self.listeners.read().iter() {
            database.add_listener(Arc::clone(listener));
        }
        let failures = database.notify(event);
        if !failures.is_empty() {
            self.failures.lock().extend(failures);
        }
    }

    /// Listener failures from creating and opening databases since the last
    /// call.
    pub fn take_failures(&self) -> Vec<LifecycleFailure> {
        std::mem::take(&mut *self.failures.lock())
    }

    /// Creates a database with the engine named `mode`.
    pub fn create_database(&self, name: &str, mode: &str) -> CoreResult<Arc<Database>> {
        validate_name(name)?;
        let mode = mode.to_ascii_lowercase();
        let engine = self
            .engines
            .read()
            .get(&mode)
            .cloned()
            .ok_or_else(|| CoreError::UnsupportedStorage { mode: mode.clone() })?;

        let mut databases = self.databases.write();
        if databases.contains_key(name) || self.engines.read().values().any(|e| e.exists(name)) {
            return Err(CoreError::DatabaseExists {
                name: name.to_string(),
            });
        }

        let database = Arc::new(engine.create(name, &self.config)?);
        self.attach(&database, DatabaseEvent::Create);
        databases.insert(name.to_string(), Arc::clone(&database));
        info!(database = name, mode = %mode, "database created");
        Ok(database)
    }

    /// Returns the open database `name`, opening it from storage if needed.
    pub fn open_database(&self, name: &str) -> CoreResult<Arc<Database>> {
        validate_name(name)?;
        if let Some(database) = self.databases.read().get(name) {
            return Ok(Arc::clone(database));
        }

        let mut databases = self.databases.write();
        // Another connection may have opened it meanwhile.
        if let Some(database) = databases.get(name) {
            return Ok(Arc::clone(database));
        }

        let engines: Vec<_> = self.engines.read().values().cloned().collect();
        for engine in engines {
            if let Some(database) = engine.open(name, &self.config)? {
                let database = Arc::new(database);
                self.attach(&database, DatabaseEvent::Open);
                databases.insert(name.to_string(), Arc::clone(&database));
                return Ok(database);
            }
        }
        Err(CoreError::DatabaseNotFound {
            name: name.to_string(),
        })
    }

    /// An already open database.
    pub fn database(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.read().get(name).cloned()
    }

    /// Whether a database called `name` is open or stored by any engine.
    pub fn exists(&self, name: &str) -> bool {
        self.databases.read().contains_key(name)
            || self.engines.read().values().any(|engine| engine.exists(name))
    }

    /// Names of the open databases, sorted.
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.databases.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Closes every open database.
    ///
    /// Listener and flush failures are collected in the report, along with
    /// listener failures from earlier creates and opens not yet taken; each
    /// database is closed regardless of what happened to the others.
    pub fn shutdown(&self) -> ShutdownReport {
        let databases: Vec<_> = self.databases.write().drain().collect();
        let mut report = ShutdownReport {
            failures: self.take_failures(),
            ..ShutdownReport::default()
        };
        for (name, database) in databases {
            report.failures.extend(database.close());
            report.closed.push(name);
        }
        report.closed.sort();
        info!(
            closed = report.closed.len(),
            failures = report.failures.len(),
            "engine registry shut down"
        );
        report
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.engine_names())
            .field("databases", &self.database_names())
            .finish_non_exhaustive()
    }
}

fn validate_name(name: &str) -> CoreResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', ':', '\0']);
    if bad {
        return Err(CoreError::invalid_operation(format!(
            "invalid database name: {name:?}"
        )));
    }
    Ok(())
}
