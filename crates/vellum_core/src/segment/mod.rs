//! Append-only segment log.
//!
//! Every mutation of a database is appended to its segment log before the
//! in-memory state changes. Opening a database replays the log from the
//! start; the last record for an identity wins.
//!
//! ## Record Format
//!
//! ```text
//! | record_len (4) | kind (1) | body (N) | checksum (4) |
//! ```
//!
//! All integers are little-endian. `record_len` counts the whole record,
//! itself included. The checksum is CRC32 (IEEE) over everything before it.
//!
//! Kinds:
//! - `1` = cluster added
//! - `2` = record put
//! - `3` = record removed
//! - `4` = dictionary put
//! - `5` = dictionary removed

mod record;
mod store;

pub use record::SegmentRecord;
pub use store::SegmentManager;
