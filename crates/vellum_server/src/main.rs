//! Vellum server binary.
//!
//! Loads the configuration (JSON file plus command-line overrides), binds
//! the listener, serves until interrupted, then shuts down gracefully.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vellum_server::{Server, ServerConfig};

/// Vellum binary protocol server.
#[derive(Parser)]
#[command(name = "vellum-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Directory for `local` databases
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Idle read timeout in seconds (0 disables)
    #[arg(long)]
    read_timeout: Option<u64>,

    /// Disable the record cache
    #[arg(long)]
    no_cache: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(addr) = self.bind {
            config = config.with_bind_addr(addr);
        }
        if let Some(root) = &self.storage {
            config = config.with_storage_root(root);
        }
        if let Some(max) = self.max_connections {
            config = config.with_max_connections(max);
        }
        if let Some(secs) = self.read_timeout {
            config = config.with_read_timeout(Duration::from_secs(secs));
        }
        if self.no_cache {
            config = config.with_cache(false);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --verbose.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.server_config()?;
    let server = Server::bind(config)?;
    let handle = server.handle()?;
    info!(addr = %handle.addr(), "vellum server listening");

    let mut serving = tokio::task::spawn_blocking(move || server.serve());
    let stopped_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupt received, shutting down");
            false
        }
        joined = &mut serving => {
            joined??;
            warn!("accept loop ended unexpectedly");
            true
        }
    };

    let report = handle.shutdown();
    if !stopped_early {
        serving.await??;
    }

    if report.is_clean() {
        info!(databases = report.closed.len(), "shutdown complete");
    } else {
        warn!(
            databases = report.closed.len(),
            failures = report.failures.len(),
            "shutdown completed with failures"
        );
    }
    Ok(())
}
