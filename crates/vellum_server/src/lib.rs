//! # Vellum Server
//!
//! Binary protocol server for Vellum databases.
//!
//! This crate provides:
//! - A thread-per-connection TCP listener with a connection limit
//! - The opcode dispatcher and its request handlers
//! - User authentication (HMAC-SHA256 password digests) and role checks
//! - A small command language over the record store
//!
//! # Architecture
//!
//! ```text
//! TcpListener ─ accept ─▶ connection thread ─▶ WireChannel ─▶ dispatcher
//!                                                   │
//!                              ServerContext ◀──────┘
//!                       (engines, security, connections)
//! ```
//!
//! Every connection owns a [`Session`]; all sessions share one
//! [`ServerContext`]. Databases are opened through the context's
//! engine registry and shared between the sessions that bind them.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod command;
mod config;
mod connection;
mod context;
pub mod dispatcher;
mod error;
mod listener;
pub mod security;

pub use command::CommandOutput;
pub use config::{ServerConfig, DEFAULT_PORT};
pub use connection::{ConnectionGuard, ConnectionRegistry, Session, SessionStats};
pub use context::{ServerContext, ShutdownListener};
pub use dispatcher::{run_cycle, serve_channel, CycleOutcome, OpcodeSpec, OPCODES};
pub use error::{ServerError, ServerResult};
pub use listener::{Server, ServerHandle};
pub use security::{Principal, Role, Security, UserConfig};
