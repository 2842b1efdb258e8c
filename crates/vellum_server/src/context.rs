//! State shared by every connection of a server.

use crate::config::ServerConfig;
use crate::connection::ConnectionRegistry;
use crate::error::ServerResult;
use crate::security::Security;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;
use vellum_core::{EngineRegistry, LifecycleFailure, ShutdownReport};

/// Observer run once when the server shuts down.
///
/// A failing listener is recorded in the [`ShutdownReport`]; it never stops
/// the shutdown.
pub trait ShutdownListener: Send + Sync {
    /// Name used in failure reports.
    fn name(&self) -> &str;

    /// Called after connections are closed and databases flushed.
    fn on_shutdown(&self) -> ServerResult<()>;
}

/// Configuration, engines, credentials, and live connections.
pub struct ServerContext {
    config: ServerConfig,
    engines: EngineRegistry,
    security: Security,
    connections: Arc<ConnectionRegistry>,
    shutdown_listeners: RwLock<Vec<Arc<dyn ShutdownListener>>>,
}

impl ServerContext {
    /// Builds the context; fails on unusable user entries.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let security = Security::new(&config.users)?;
        let engines =
            EngineRegistry::with_default_engines(config.database_config(), config.storage_root.as_deref());
        let connections = Arc::new(ConnectionRegistry::new(config.max_connections));
        Ok(Self {
            config,
            engines,
            security,
            connections,
            shutdown_listeners: RwLock::new(Vec::new()),
        })
    }

    /// Server configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Storage engines and open databases.
    #[must_use]
    pub const fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    /// Credential store.
    #[must_use]
    pub const fn security(&self) -> &Security {
        &self.security
    }

    /// Live connections.
    #[must_use]
    pub const fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Registers a shutdown observer.
    pub fn add_shutdown_listener(&self, listener: Arc<dyn ShutdownListener>) {
        self.shutdown_listeners.write().push(listener);
    }

    /// Closes connections, closes every database, then runs shutdown
    /// listeners. Every step runs whatever failed before it.
    pub fn shutdown(&self) -> ShutdownReport {
        let closed_connections = self.connections.close_all();
        let mut report = self.engines.shutdown();

        let listeners = self.shutdown_listeners.read().clone();
        for listener in listeners {
            if let Err(err) = listener.on_shutdown() {
                report.failures.push(LifecycleFailure::new(
                    format!("shutdown listener {}", listener.name()),
                    err.to_string(),
                ));
            }
        }

        info!(
            connections = closed_connections,
            databases = report.closed.len(),
            failures = report.failures.len(),
            "server context shut down"
        );
        report
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("bind_addr", &self.config.bind_addr)
            .field("engines", &self.engines.engine_names())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
