//! # Vellum Storage
//!
//! Byte-store backends underneath a Vellum database.
//!
//! A backend knows nothing about clusters or records. It holds the append-only
//! segment log that `vellum_core` writes record mutations into, and hands the
//! bytes back verbatim when a database is reopened.
//!
//! ## Backends
//!
//! - [`InMemoryBackend`] - used by `memory` databases and tests
//! - [`FileBackend`] - used by `local` databases, one file per database
//!
//! ## Example
//!
//! ```rust
//! use vellum_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut log = InMemoryBackend::new();
//! let offset = log.append(b"cluster:default").unwrap();
//! assert_eq!(log.read_at(offset, 7).unwrap(), b"cluster");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
