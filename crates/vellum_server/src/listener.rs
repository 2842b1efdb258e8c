//! TCP listener: one thread per connection.

use crate::config::ServerConfig;
use crate::connection::{ConnectionGuard, Session};
use crate::context::ServerContext;
use crate::dispatcher::serve_channel;
use crate::error::ServerResult;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use vellum_core::ShutdownReport;
use vellum_protocol::WireChannel;

/// A bound, not yet serving, server.
pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
    stopping: Arc<AtomicBool>,
}

impl Server {
    /// Binds the configured address.
    pub fn bind(config: ServerConfig) -> ServerResult<Self> {
        let listener = TcpListener::bind(config.bind_addr)?;
        let context = Arc::new(ServerContext::new(config)?);
        info!(addr = %listener.local_addr()?, "server bound");
        Ok(Self {
            listener,
            context,
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared server state.
    #[must_use]
    pub const fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// A handle that can stop the server from another thread.
    pub fn handle(&self) -> ServerResult<ServerHandle> {
        Ok(ServerHandle {
            addr: self.local_addr()?,
            context: Arc::clone(&self.context),
            stopping: Arc::clone(&self.stopping),
        })
    }

    /// Accepts connections until [`ServerHandle::shutdown`] is called.
    pub fn serve(self) -> ServerResult<()> {
        for stream in self.listener.incoming() {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };
            let peer = match stream.peer_addr() {
                Ok(peer) => peer,
                Err(err) => {
                    debug!(error = %err, "peer vanished before it was served");
                    continue;
                }
            };

            // A full registry drops the stream right here, closing it.
            let guard = match self.context.connections().register(&stream, peer) {
                Ok(Some(guard)) => guard,
                Ok(None) => continue,
                Err(err) => {
                    warn!(%peer, error = %err, "could not register connection");
                    continue;
                }
            };
            let context = Arc::clone(&self.context);
            let spawned = thread::Builder::new()
                .name(format!("vellum-conn-{}", guard.id()))
                .spawn(move || {
                    if let Err(err) = serve_connection(&context, stream, peer, guard) {
                        warn!(%peer, error = %err, "connection setup failed");
                    }
                });
            if let Err(err) = spawned {
                error!(%peer, error = %err, "could not spawn connection thread");
            }
        }
        info!("accept loop stopped");
        Ok(())
    }

    /// Serves on a background thread.
    pub fn spawn(self) -> ServerResult<(ServerHandle, JoinHandle<ServerResult<()>>)> {
        let handle = self.handle()?;
        let thread = thread::Builder::new()
            .name("vellum-accept".into())
            .spawn(move || self.serve())?;
        Ok((handle, thread))
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.listener.local_addr().ok())
            .field("context", &self.context)
            .finish()
    }
}

fn serve_connection(
    context: &ServerContext,
    stream: TcpStream,
    peer: SocketAddr,
    _guard: ConnectionGuard,
) -> ServerResult<()> {
    stream.set_read_timeout(context.config().read_timeout())?;
    stream.set_nodelay(true)?;
    let reader = stream.try_clone()?;
    let mut channel =
        WireChannel::new(reader, stream).with_max_length(context.config().max_frame_length);
    let mut session = Session::new(Some(peer));
    info!(%peer, session = %session.id(), "client connected");

    serve_channel(context, &mut session, &mut channel);

    let stats = session.stats();
    info!(
        %peer,
        session = %session.id(),
        requests = stats.requests,
        failures = stats.failures,
        elapsed_ms = stats.total_elapsed.as_millis() as u64,
        last_command = stats.last_command.as_deref().unwrap_or("-"),
        "client disconnected"
    );
    Ok(())
}

/// Stops a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    addr: SocketAddr,
    context: Arc<ServerContext>,
    stopping: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Address the server listens on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared server state.
    #[must_use]
    pub const fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Stops accepting, closes every connection and database, and runs the
    /// shutdown listeners. A second call only repeats the context shutdown,
    /// which finds nothing left to close.
    pub fn shutdown(&self) -> ShutdownReport {
        self.stopping.store(true, Ordering::SeqCst);
        // Wake the blocking accept so it observes the flag.
        if let Err(err) = TcpStream::connect(wake_addr(self.addr)) {
            debug!(error = %err, "accept loop already stopped");
        }
        self.context.shutdown()
    }
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port())
        }
        _ => addr,
    }
}
