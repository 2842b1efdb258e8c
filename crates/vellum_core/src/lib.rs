//! # Vellum Core
//!
//! Record storage engine for Vellum.
//!
//! This crate provides:
//! - Record identities, versions, and type tags
//! - Physical and logical clusters
//! - The record store with its read-through cache
//! - The optimistic commit coordinator for transaction batches
//! - Databases, the per-database dictionary, and the engine registry
//! - The CRC-checked segment log that persists every mutation

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod cluster;
mod commit;
mod config;
mod database;
mod dictionary;
mod dir;
mod engine;
mod error;
mod segment;
mod stats;
mod store;
mod types;

pub use cache::RecordCache;
pub use cluster::{ClusterInfo, ClusterKind};
pub use commit::{CommitCoordinator, CommitError, CommitOutcome, TxEntry, TxStatus};
pub use config::{Config, DEFAULT_CLUSTERS};
pub use database::{Database, DatabaseEvent, DatabaseListener, LifecycleFailure, StorageMode};
pub use dictionary::Dictionary;
pub use dir::DatabaseDir;
pub use engine::{EngineRegistry, LocalEngine, MemoryEngine, ShutdownReport, StorageEngine};
pub use error::{CoreError, CoreResult};
pub use segment::{SegmentManager, SegmentRecord};
pub use stats::{StatsSnapshot, StoreStats};
pub use store::RecordStore;
pub use types::{ClusterId, Record, RecordId, RecordType};
