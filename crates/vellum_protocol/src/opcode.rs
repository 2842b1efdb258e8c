//! Request opcodes and wire constants.

/// Response status: the request succeeded and its payload follows.
pub const STATUS_OK: u8 = 0;
/// Response status: an error envelope follows.
pub const STATUS_ERROR: u8 = 1;

/// Authenticates a server-level session.
pub const CONNECT: u8 = 1;
/// Opens a database and binds it to the session.
pub const DB_OPEN: u8 = 5;
/// Creates a database.
pub const DB_CREATE: u8 = 6;
/// Unbinds the session's database.
pub const DB_CLOSE: u8 = 7;
/// Asks whether the session's database exists.
pub const DB_EXIST: u8 = 8;
/// Adds a physical cluster.
pub const CLUSTER_PHYSICAL_ADD: u8 = 10;
/// Adds a logical cluster inside a container cluster.
pub const CLUSTER_LOGICAL_ADD: u8 = 11;
/// Counts records over a set of clusters.
pub const CLUSTER_COUNT: u8 = 12;
/// Loads one record.
pub const RECORD_LOAD: u8 = 30;
/// Creates one record.
pub const RECORD_CREATE: u8 = 31;
/// Updates one record.
pub const RECORD_UPDATE: u8 = 32;
/// Deletes one record.
pub const RECORD_DELETE: u8 = 33;
/// Counts the records of a named cluster.
pub const COUNT: u8 = 40;
/// Executes a command.
pub const COMMAND: u8 = 41;
/// Looks up a dictionary key.
pub const DICTIONARY_LOOKUP: u8 = 50;
/// Binds a dictionary key.
pub const DICTIONARY_PUT: u8 = 51;
/// Unbinds a dictionary key.
pub const DICTIONARY_REMOVE: u8 = 52;
/// Number of dictionary keys.
pub const DICTIONARY_SIZE: u8 = 53;
/// All dictionary keys.
pub const DICTIONARY_KEYS: u8 = 54;
/// Commits a transaction batch.
pub const TX_COMMIT: u8 = 60;

/// Class id of a record frame that carries no record.
pub const RECORD_NULL: i16 = -2;
/// Class id of a record without a schema class.
pub const CLASS_NONE: i16 = -1;

/// Command mode byte for streamed results.
pub const COMMAND_ASYNC: u8 = b'a';
/// Command mode byte for a single synchronous result.
pub const COMMAND_SYNC: u8 = b's';

/// Every opcode with its name, in code order.
pub const ALL: &[(u8, &str)] = &[
    (CONNECT, "CONNECT"),
    (DB_OPEN, "DB_OPEN"),
    (DB_CREATE, "DB_CREATE"),
    (DB_CLOSE, "DB_CLOSE"),
    (DB_EXIST, "DB_EXIST"),
    (CLUSTER_PHYSICAL_ADD, "CLUSTER_PHYSICAL_ADD"),
    (CLUSTER_LOGICAL_ADD, "CLUSTER_LOGICAL_ADD"),
    (CLUSTER_COUNT, "CLUSTER_COUNT"),
    (RECORD_LOAD, "RECORD_LOAD"),
    (RECORD_CREATE, "RECORD_CREATE"),
    (RECORD_UPDATE, "RECORD_UPDATE"),
    (RECORD_DELETE, "RECORD_DELETE"),
    (COUNT, "COUNT"),
    (COMMAND, "COMMAND"),
    (DICTIONARY_LOOKUP, "DICTIONARY_LOOKUP"),
    (DICTIONARY_PUT, "DICTIONARY_PUT"),
    (DICTIONARY_REMOVE, "DICTIONARY_REMOVE"),
    (DICTIONARY_SIZE, "DICTIONARY_SIZE"),
    (DICTIONARY_KEYS, "DICTIONARY_KEYS"),
    (TX_COMMIT, "TX_COMMIT"),
];

/// Name of an opcode, if it is known.
#[must_use]
pub fn name(code: u8) -> Option<&'static str> {
    ALL.iter()
        .find(|(candidate, _)| *candidate == code)
        .map(|(_, name)| *name)
}
