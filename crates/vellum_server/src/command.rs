//! Command executor.
//!
//! Supported commands (keywords are case-insensitive):
//!
//! - `SELECT FROM [cluster:]<name>`: records of a cluster, by position
//! - `SELECT COUNT(*) FROM [cluster:]<name>`: number of records
//! - `LOAD <rid>`: one record, or nothing
//! - `LIST CLUSTERS`: cluster names, by id

use crate::error::{ServerError, ServerResult};
use vellum_core::{Database, Record, RecordId};
use vellum_protocol::{CommandRequest, CommandValue};

/// Result of executing a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    /// No value.
    Null,
    /// A single record.
    Record(Record),
    /// A scalar or list.
    Value(CommandValue),
    /// A sequence of records.
    Records(Vec<Record>),
}

impl CommandOutput {
    /// The records of the output, for streaming.
    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        match self {
            Self::Record(record) => vec![record],
            Self::Records(records) => records,
            Self::Null | Self::Value(_) => Vec::new(),
        }
    }

    /// The value sent for a synchronous `Records` result: their identities.
    #[must_use]
    pub fn rid_list(records: &[Record]) -> CommandValue {
        CommandValue::List(
            records
                .iter()
                .map(|record| CommandValue::Rid(record.id.to_string()))
                .collect(),
        )
    }
}

/// Parses and runs `request` against `database`.
pub fn execute(database: &Database, request: &CommandRequest) -> ServerResult<CommandOutput> {
    let words: Vec<&str> = request.text.split_whitespace().collect();
    let keyword = |index: usize, expected: &str| {
        words
            .get(index)
            .is_some_and(|word| word.eq_ignore_ascii_case(expected))
    };

    match words.len() {
        3 if keyword(0, "select") && keyword(1, "from") => {
            let mut records = database.store().scan(cluster_of(database, words[2])?)?;
            if let Some(limit) = request.max_results() {
                records.truncate(limit);
            }
            Ok(CommandOutput::Records(records))
        }
        4 if keyword(0, "select") && keyword(1, "count(*)") && keyword(2, "from") => {
            let id = cluster_of(database, words[3])?;
            let count = database.store().count_cluster_elements(&[id])?;
            Ok(CommandOutput::Value(CommandValue::Integer(count)))
        }
        2 if keyword(0, "load") => {
            let id: RecordId = words[1]
                .parse()
                .map_err(|_| ServerError::Command(format!("invalid record id '{}'", words[1])))?;
            Ok(database
                .store()
                .read(id)?
                .map_or(CommandOutput::Null, CommandOutput::Record))
        }
        2 if keyword(0, "list") && keyword(1, "clusters") => {
            let names = database
                .store()
                .clusters()
                .into_iter()
                .map(|info| CommandValue::Text(info.name))
                .collect();
            Ok(CommandOutput::Value(CommandValue::List(names)))
        }
        _ => Err(ServerError::Command(format!(
            "unsupported command '{}'",
            request.text
        ))),
    }
}

fn cluster_of(database: &Database, target: &str) -> ServerResult<i16> {
    let name = target
        .get(..8)
        .filter(|prefix| prefix.eq_ignore_ascii_case("cluster:"))
        .map_or(target, |_| &target[8..]);
    database
        .store()
        .cluster_id_by_name(name)
        .ok_or_else(|| vellum_core::CoreError::cluster_name_not_found(name).into())
}
