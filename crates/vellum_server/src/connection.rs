//! Per-connection session state and the registry of live connections.

use crate::error::{ServerError, ServerResult};
use crate::security::Principal;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;
use vellum_core::Database;

/// Request statistics of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Opcode of the most recent request.
    pub last_opcode: Option<u8>,
    /// Time spent on the most recent request.
    pub last_elapsed: Duration,
    /// Time spent on all requests.
    pub total_elapsed: Duration,
    /// Requests served, successful or not.
    pub requests: u64,
    /// Requests answered with an error envelope.
    pub failures: u64,
    /// Text of the most recent COMMAND request.
    pub last_command: Option<String>,
}

/// State of one client connection.
///
/// A session starts anonymous; CONNECT or DB_OPEN attaches a principal and
/// DB_OPEN binds a database.
#[derive(Debug)]
pub struct Session {
    id: String,
    peer: Option<SocketAddr>,
    principal: Option<Principal>,
    database: Option<Arc<Database>>,
    stats: SessionStats,
}

impl Session {
    /// Creates an anonymous session with a fresh id.
    pub fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            peer,
            principal: None,
            database: None,
            stats: SessionStats::default(),
        }
    }

    /// Session id handed to the client.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remote address, when the transport has one.
    #[must_use]
    pub const fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The authenticated user, if any.
    #[must_use]
    pub const fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Attaches an authenticated user.
    pub fn set_principal(&mut self, principal: Principal) {
        self.principal = Some(principal);
    }

    /// The authenticated user, or an authorization failure.
    pub fn require_principal(&self) -> ServerResult<&Principal> {
        self.principal
            .as_ref()
            .ok_or_else(|| ServerError::NotAuthorized("connection is not authenticated".into()))
    }

    /// The bound database, or a not-open failure.
    pub fn database(&self) -> ServerResult<&Arc<Database>> {
        match &self.database {
            Some(database) if database.is_open() => Ok(database),
            _ => Err(ServerError::DatabaseNotOpen),
        }
    }

    /// Binds a database.
    pub fn bind_database(&mut self, database: Arc<Database>) {
        self.database = Some(database);
    }

    /// Unbinds the database; returns whether one was bound.
    pub fn unbind_database(&mut self) -> bool {
        self.database.take().is_some()
    }

    /// Statistics so far.
    #[must_use]
    pub const fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Remembers the text of a COMMAND request.
    pub fn record_command(&mut self, text: &str) {
        self.stats.last_command = Some(text.to_string());
    }

    /// Accounts for one finished request.
    pub fn record_request(&mut self, opcode: u8, elapsed: Duration, failed: bool) {
        self.stats.last_opcode = Some(opcode);
        self.stats.last_elapsed = elapsed;
        self.stats.total_elapsed += elapsed;
        self.stats.requests += 1;
        if failed {
            self.stats.failures += 1;
        }
    }
}

struct ConnectionEntry {
    peer: SocketAddr,
    stream: TcpStream,
}

/// Live connections, bounded by the configured maximum.
pub struct ConnectionRegistry {
    max_connections: usize,
    next_id: AtomicU64,
    connections: RwLock<HashMap<u64, ConnectionEntry>>,
}

impl ConnectionRegistry {
    /// Creates a registry admitting at most `max_connections`.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            next_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Admits a connection; `None` when the registry is full.
    ///
    /// The registry keeps a clone of the stream so [`close_all`] can shut
    /// it down. The returned guard unregisters the connection on drop.
    ///
    /// [`close_all`]: Self::close_all
    pub fn register(
        self: &Arc<Self>,
        stream: &TcpStream,
        peer: SocketAddr,
    ) -> ServerResult<Option<ConnectionGuard>> {
        let handle = stream.try_clone()?;
        let mut connections = self.connections.write();
        if connections.len() >= self.max_connections {
            warn!(%peer, limit = self.max_connections, "connection limit reached");
            return Ok(None);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        connections.insert(id, ConnectionEntry { peer, stream: handle });
        debug!(connection = id, %peer, "connection registered");
        Ok(Some(ConnectionGuard {
            registry: Arc::clone(self),
            id,
        }))
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether no connection is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Shuts down every live connection's socket; returns how many.
    ///
    /// Connection threads observe the shutdown as a transport failure and
    /// unregister themselves.
    pub fn close_all(&self) -> usize {
        let connections = self.connections.read();
        for (id, entry) in connections.iter() {
            if let Err(err) = entry.stream.shutdown(Shutdown::Both) {
                debug!(connection = id, peer = %entry.peer, error = %err, "socket already closed");
            }
        }
        connections.len()
    }

    fn unregister(&self, id: u64) {
        if let Some(entry) = self.connections.write().remove(&id) {
            debug!(connection = id, peer = %entry.peer, "connection unregistered");
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("max_connections", &self.max_connections)
            .field("live", &self.len())
            .finish()
    }
}

/// Keeps a connection registered until dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    id: u64,
}

impl ConnectionGuard {
    /// Registry-assigned connection number.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
