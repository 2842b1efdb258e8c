//! Server configuration.

use crate::error::{ServerError, ServerResult};
use crate::security::{default_users, UserConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use vellum_core::Config;
use vellum_protocol::DEFAULT_MAX_LENGTH;

/// Default listening port of the binary protocol.
pub const DEFAULT_PORT: u16 = 2424;

/// Configuration for the server.
///
/// Deserializable from JSON; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections; extra ones are closed on accept.
    pub max_connections: usize,
    /// Idle read timeout in seconds; 0 disables it.
    pub read_timeout_secs: u64,
    /// Directory holding `local` databases; `None` disables the engine.
    pub storage_root: Option<PathBuf>,
    /// Largest accepted `bytes`/`string` operand.
    pub max_frame_length: usize,
    /// Whether databases keep a record cache.
    pub use_cache: bool,
    /// Record cache capacity per database.
    pub cache_capacity: usize,
    /// Whether every segment append is fsynced.
    pub sync_on_write: bool,
    /// Accounts allowed to connect.
    pub users: Vec<UserConfig>,
}

impl ServerConfig {
    /// Creates a configuration listening on `bind_addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 1000,
            read_timeout_secs: 300,
            storage_root: None,
            max_frame_length: DEFAULT_MAX_LENGTH,
            use_cache: true,
            cache_capacity: 10_000,
            sync_on_write: false,
            users: default_users(),
        }
    }

    /// Parses a JSON configuration.
    pub fn from_json(text: &str) -> ServerResult<Self> {
        serde_json::from_str(text).map_err(|err| ServerError::Config(err.to_string()))
    }

    /// Loads a JSON configuration file.
    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Sets the bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Sets the maximum concurrent connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the read timeout; zero disables it.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_secs = timeout.as_secs();
        self
    }

    /// Enables the `local` engine under `root`.
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    /// Sets the largest accepted operand length.
    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    /// Enables or disables the record cache.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.use_cache = enabled;
        self
    }

    /// Replaces the configured users.
    pub fn with_users(mut self, users: Vec<UserConfig>) -> Self {
        self.users = users;
        self
    }

    /// The read timeout, or `None` when disabled.
    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }

    /// Configuration for databases created or opened by this server.
    #[must_use]
    pub fn database_config(&self) -> Config {
        Config::new()
            .use_cache(self.use_cache)
            .cache_capacity(self.cache_capacity)
            .sync_on_write(self.sync_on_write)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))
    }
}
