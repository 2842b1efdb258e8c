//! Opcode dispatch.
//!
//! Each request cycle reads one opcode byte, runs the handler registered
//! for it in [`OPCODES`], and answers with `OK` plus payload or with an
//! error envelope (`ERROR`, category, message). After an envelope the
//! unread remainder of the request is discarded: operands the opcode's
//! layout still names are read and dropped, then whatever else is pending.
//! Output is flushed at the end of every cycle. A transport failure ends
//! the connection without an envelope.

use crate::command::{self, CommandOutput};
use crate::connection::Session;
use crate::context::ServerContext;
use crate::error::{ServerError, ServerResult};
use crate::security::{Operation, Resource};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, debug_span, error, warn};
use vellum_core::{CoreError, Database, Record, RecordId};
use vellum_protocol::command::{
    CommandMode, RESULT_NULL, RESULT_RECORD, RESULT_VALUE, STREAM_END, STREAM_RECORD,
};
use vellum_protocol::frame::{read_record_type, write_record};
use vellum_protocol::opcode::{self, STATUS_ERROR, STATUS_OK};
use vellum_protocol::{Channel, CommandRequest, ProtocolError, TransactionProxy};

/// Request handler: reads its operands, performs the work, writes `OK`
/// and the payload.
///
/// A handler writes nothing before it has succeeded, so a returned error
/// can still be answered with an envelope.
pub type Handler = fn(&ServerContext, &mut Session, &mut dyn Channel) -> ServerResult<()>;

/// Descriptor of one opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeSpec {
    /// Wire code.
    pub code: u8,
    /// Name used in logs.
    pub name: &'static str,
    /// Operand layout as `name:kind` pairs; fixed kinds (`byte`, `short`,
    /// `int`, `long`, `string`, `bytes`) can be skipped after a failure.
    pub operands: &'static str,
    /// Handler.
    pub handler: Handler,
}

/// Every opcode the server understands.
pub static OPCODES: &[OpcodeSpec] = &[
    OpcodeSpec {
        code: opcode::CONNECT,
        name: "CONNECT",
        operands: "user:string pass:string",
        handler: connect,
    },
    OpcodeSpec {
        code: opcode::DB_OPEN,
        name: "DB_OPEN",
        operands: "url:string user:string pass:string",
        handler: db_open,
    },
    OpcodeSpec {
        code: opcode::DB_CREATE,
        name: "DB_CREATE",
        operands: "name:string mode:string",
        handler: db_create,
    },
    OpcodeSpec {
        code: opcode::DB_CLOSE,
        name: "DB_CLOSE",
        operands: "",
        handler: db_close,
    },
    OpcodeSpec {
        code: opcode::DB_EXIST,
        name: "DB_EXIST",
        operands: "",
        handler: db_exist,
    },
    OpcodeSpec {
        code: opcode::CLUSTER_PHYSICAL_ADD,
        name: "CLUSTER_PHYSICAL_ADD",
        operands: "name:string fileName:string startSize:int",
        handler: cluster_physical_add,
    },
    OpcodeSpec {
        code: opcode::CLUSTER_LOGICAL_ADD,
        name: "CLUSTER_LOGICAL_ADD",
        operands: "name:string containerId:int",
        handler: cluster_logical_add,
    },
    OpcodeSpec {
        code: opcode::CLUSTER_COUNT,
        name: "CLUSTER_COUNT",
        operands: "count:short ids:short[]",
        handler: cluster_count,
    },
    OpcodeSpec {
        code: opcode::RECORD_LOAD,
        name: "RECORD_LOAD",
        operands: "cluster:short position:long",
        handler: record_load,
    },
    OpcodeSpec {
        code: opcode::RECORD_CREATE,
        name: "RECORD_CREATE",
        operands: "cluster:short content:bytes type:byte",
        handler: record_create,
    },
    OpcodeSpec {
        code: opcode::RECORD_UPDATE,
        name: "RECORD_UPDATE",
        operands: "cluster:short position:long content:bytes version:int type:byte",
        handler: record_update,
    },
    OpcodeSpec {
        code: opcode::RECORD_DELETE,
        name: "RECORD_DELETE",
        operands: "cluster:short position:long version:int",
        handler: record_delete,
    },
    OpcodeSpec {
        code: opcode::COUNT,
        name: "COUNT",
        operands: "cluster:string",
        handler: count,
    },
    OpcodeSpec {
        code: opcode::COMMAND,
        name: "COMMAND",
        operands: "mode:byte request:bytes",
        handler: command,
    },
    OpcodeSpec {
        code: opcode::DICTIONARY_LOOKUP,
        name: "DICTIONARY_LOOKUP",
        operands: "key:string",
        handler: dictionary_lookup,
    },
    OpcodeSpec {
        code: opcode::DICTIONARY_PUT,
        name: "DICTIONARY_PUT",
        operands: "key:string type:byte rid:string",
        handler: dictionary_put,
    },
    OpcodeSpec {
        code: opcode::DICTIONARY_REMOVE,
        name: "DICTIONARY_REMOVE",
        operands: "key:string",
        handler: dictionary_remove,
    },
    OpcodeSpec {
        code: opcode::DICTIONARY_SIZE,
        name: "DICTIONARY_SIZE",
        operands: "",
        handler: dictionary_size,
    },
    OpcodeSpec {
        code: opcode::DICTIONARY_KEYS,
        name: "DICTIONARY_KEYS",
        operands: "",
        handler: dictionary_keys,
    },
    OpcodeSpec {
        code: opcode::TX_COMMIT,
        name: "TX_COMMIT",
        operands: "txId:int count:int entries",
        handler: tx_commit,
    },
];

/// Descriptor registered for `code`.
#[must_use]
pub fn lookup(code: u8) -> Option<&'static OpcodeSpec> {
    OPCODES.iter().find(|spec| spec.code == code)
}

/// What the connection does after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Wait for the next request.
    Continue,
    /// The transport is gone; stop serving.
    Closed,
}

/// Serves requests until the transport fails.
pub fn serve_channel(context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) {
    while run_cycle(context, session, channel) == CycleOutcome::Continue {}
    debug!(
        session = %session.id(),
        requests = session.stats().requests,
        "connection finished"
    );
}

/// Reads and answers one request.
pub fn run_cycle(
    context: &ServerContext,
    session: &mut Session,
    channel: &mut dyn Channel,
) -> CycleOutcome {
    let code = match channel.read_byte() {
        Ok(code) => code,
        Err(err) => {
            debug!(session = %session.id(), error = %err, "transport closed");
            return CycleOutcome::Closed;
        }
    };
    let started = Instant::now();
    channel.begin_request();

    let Some(spec) = lookup(code) else {
        warn!(session = %session.id(), opcode = code, "unknown opcode");
        let answered = answer_unknown(channel);
        session.record_request(code, started.elapsed(), true);
        return if answered.is_ok() {
            CycleOutcome::Continue
        } else {
            CycleOutcome::Closed
        };
    };

    let span = debug_span!("request", session = %session.id(), opcode = spec.name);
    let _entered = span.enter();

    let result = (spec.handler)(context, session, channel);
    let failed = result.is_err();
    let outcome = match result {
        Ok(()) => channel.flush().map_err(ServerError::from),
        Err(err) if err.is_transport() => Err(err),
        Err(err) => {
            if err.is_internal() {
                error!(error = %err, "request failed");
            } else {
                debug!(category = err.category(), error = %err, "request rejected");
            }
            answer_error(channel, spec, &err)
        }
    };
    session.record_request(code, started.elapsed(), failed);

    match outcome {
        Ok(()) => CycleOutcome::Continue,
        Err(err) => {
            debug!(error = %err, "transport closed");
            CycleOutcome::Closed
        }
    }
}

fn write_envelope(
    channel: &mut dyn Channel,
    category: Option<&str>,
    message: Option<&str>,
) -> Result<(), ProtocolError> {
    channel.write_byte(STATUS_ERROR)?;
    channel.write_string(category)?;
    channel.write_string(message)
}

fn answer_unknown(channel: &mut dyn Channel) -> Result<(), ProtocolError> {
    channel.discard_input()?;
    write_envelope(channel, None, None)?;
    channel.flush()
}

/// Writes the envelope, drops the rest of the request, then flushes so the
/// client cannot have sent its next request before the discard.
fn answer_error(channel: &mut dyn Channel, spec: &OpcodeSpec, err: &ServerError) -> ServerResult<()> {
    write_envelope(channel, Some(err.category()), Some(&err.to_string()))?;
    let rejected = channel.skip_rejected()?;
    if rejected > 0 {
        debug!(bytes = rejected, "skipped oversize operand");
    }
    if let Some(read) = channel.operands_read() {
        skip_unread_operands(channel, spec.operands, read)?;
    }
    let dropped = channel.discard_input()?;
    if dropped > 0 {
        debug!(bytes = dropped, "discarded unread request bytes");
    }
    channel.flush()?;
    Ok(())
}

/// Reads and drops the operands of `layout` after the first `read`,
/// stopping at the first kind without a fixed encoding.
fn skip_unread_operands(
    channel: &mut dyn Channel,
    layout: &str,
    read: usize,
) -> Result<(), ProtocolError> {
    for operand in layout.split_whitespace().skip(read) {
        match operand.rsplit(':').next() {
            Some("byte") => {
                channel.read_byte()?;
            }
            Some("short") => {
                channel.read_short()?;
            }
            Some("int") => {
                channel.read_int()?;
            }
            Some("long") => {
                channel.read_long()?;
            }
            Some("string" | "bytes") => channel.skip_bytes()?,
            _ => break,
        }
    }
    Ok(())
}

fn ok(channel: &mut dyn Channel) -> ServerResult<()> {
    channel.write_byte(STATUS_OK)?;
    Ok(())
}

fn authorize(session: &Session, resource: Resource, operation: Operation) -> ServerResult<()> {
    session.require_principal()?.check(resource, operation)
}

/// The bound database, after checking the session may perform the access.
fn open_database(
    session: &Session,
    resource: Resource,
    operation: Operation,
) -> ServerResult<Arc<Database>> {
    let database = Arc::clone(session.database()?);
    authorize(session, resource, operation)?;
    Ok(database)
}

/// Record a dictionary entry points at; `None` when the record or its
/// cluster is gone.
fn read_bound(database: &Database, id: RecordId) -> ServerResult<Option<Record>> {
    match database.store().read(id) {
        Err(CoreError::ClusterNotFound { .. }) => Ok(None),
        other => Ok(other?),
    }
}

/// Database name of a `<engine>:<location>` url: the text after the last
/// `/`, or after the last `:` when there is no `/`.
pub fn database_name_from_url(url: &str) -> &str {
    match url.rfind('/') {
        Some(slash) => &url[slash + 1..],
        None => url.rfind(':').map_or(url, |colon| &url[colon + 1..]),
    }
}

fn connect(context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let user = channel.read_required_string("user")?;
    let password = channel.read_required_string("password")?;
    let principal = context.security().authenticate(&user, &password)?;
    debug!(user = %principal.name, "authenticated");
    session.set_principal(principal);

    ok(channel)?;
    channel.write_string(Some(session.id()))?;
    Ok(())
}

fn db_open(context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let url = channel.read_required_string("database url")?;
    let user = channel.read_required_string("user")?;
    let password = channel.read_required_string("password")?;

    let principal = context.security().authenticate(&user, &password)?;
    principal.check(Resource::Database, Operation::Read)?;
    let database = context.engines().open_database(database_name_from_url(&url))?;
    let clusters = database.store().clusters();
    debug!(database = %database.name(), user = %principal.name, "database opened");
    session.set_principal(principal);
    session.bind_database(database);

    ok(channel)?;
    channel.write_string(Some(session.id()))?;
    channel.write_int(i32::try_from(clusters.len()).unwrap_or(i32::MAX))?;
    for cluster in &clusters {
        channel.write_string(Some(&cluster.name))?;
        channel.write_int(i32::from(cluster.id))?;
    }
    Ok(())
}

fn db_create(context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let name = channel.read_required_string("database name")?;
    let mode = channel.read_required_string("storage mode")?;
    authorize(session, Resource::Server, Operation::Create)?;

    let database = context.engines().create_database(&name, &mode)?;
    session.bind_database(database);
    ok(channel)
}

fn db_close(_context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    if session.unbind_database() {
        debug!("database unbound");
    }
    ok(channel)
}

fn db_exist(context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let database = open_database(session, Resource::Database, Operation::Read)?;
    let exists = context.engines().exists(database.name());

    ok(channel)?;
    channel.write_byte(u8::from(exists))?;
    Ok(())
}

fn cluster_physical_add(
    _context: &ServerContext,
    session: &mut Session,
    channel: &mut dyn Channel,
) -> ServerResult<()> {
    let name = channel.read_required_string("cluster name")?;
    let file_name = channel.read_string()?;
    let start_size = channel.read_int()?;
    let database = open_database(session, Resource::Database, Operation::Update)?;

    let id = database.store().add_physical_cluster(&name, file_name, start_size)?;
    ok(channel)?;
    channel.write_short(id)?;
    Ok(())
}

fn cluster_logical_add(
    _context: &ServerContext,
    session: &mut Session,
    channel: &mut dyn Channel,
) -> ServerResult<()> {
    let name = channel.read_required_string("cluster name")?;
    let container_id = channel.read_int()?;
    let database = open_database(session, Resource::Database, Operation::Update)?;

    let (id, descriptor) = database.store().add_logical_cluster(&name, container_id)?;
    ok(channel)?;
    channel.write_short(id)?;
    channel.write_string(Some(&descriptor.to_string()))?;
    Ok(())
}

fn cluster_count(_context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let count = channel.read_short()?;
    let count = usize::try_from(count).map_err(|_| ProtocolError::InvalidLength {
        len: i32::from(count),
    })?;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(channel.read_short()?);
    }
    let database = open_database(session, Resource::Cluster, Operation::Read)?;

    let total = database.store().count_cluster_elements(&ids)?;
    ok(channel)?;
    channel.write_long(total)?;
    Ok(())
}

fn read_record_id(channel: &mut dyn Channel) -> ServerResult<RecordId> {
    let cluster_id = channel.read_short()?;
    let position = channel.read_long()?;
    Ok(RecordId::new(cluster_id, position))
}

fn record_load(_context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let id = read_record_id(channel)?;
    let database = open_database(session, Resource::Record, Operation::Read)?;

    let record = database.store().read(id)?;
    ok(channel)?;
    match record {
        Some(record) => {
            channel.write_byte(1)?;
            channel.write_bytes(Some(&record.content[..]))?;
            channel.write_int(record.version)?;
            channel.write_byte(record.record_type.as_byte())?;
        }
        None => channel.write_byte(0)?,
    }
    Ok(())
}

fn record_create(_context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let cluster_id = channel.read_short()?;
    let content = channel.read_required_bytes("record content")?;
    let record_type = read_record_type(channel)?;
    let database = open_database(session, Resource::Record, Operation::Create)?;

    let record = database.store().create(cluster_id, content, record_type)?;
    ok(channel)?;
    channel.write_long(record.id.position)?;
    Ok(())
}

fn record_update(_context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let id = read_record_id(channel)?;
    let content = channel.read_required_bytes("record content")?;
    let expected_version = channel.read_int()?;
    let record_type = read_record_type(channel)?;
    let database = open_database(session, Resource::Record, Operation::Update)?;

    let version = database
        .store()
        .update(id, content, expected_version, record_type)?;
    ok(channel)?;
    channel.write_int(version)?;
    Ok(())
}

fn record_delete(_context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let id = read_record_id(channel)?;
    let expected_version = channel.read_int()?;
    let database = open_database(session, Resource::Record, Operation::Delete)?;

    database.store().delete(id, expected_version)?;
    ok(channel)
}

fn count(_context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let name = channel.read_required_string("cluster name")?;
    let database = open_database(session, Resource::Cluster, Operation::Read)?;

    let total = database.store().count_by_name(&name)?;
    ok(channel)?;
    channel.write_long(total)?;
    Ok(())
}

/// Results are computed in full before `OK` is written, so a failing
/// command is still answered with an envelope. Once an asynchronous stream
/// has started only transport failures can interrupt it.
fn command(_context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let mode = CommandMode::from_byte(channel.read_byte()?);
    let payload = channel.read_required_bytes("command")?;
    let request = CommandRequest::decode(&payload)?;
    let database = open_database(session, Resource::Command, Operation::Read)?;

    debug!(command = %request.text, ?mode, "executing command");
    session.record_command(&request.text);
    let output = command::execute(&database, &request)?;

    ok(channel)?;
    match mode {
        CommandMode::Async => {
            let limit = request.max_results().unwrap_or(usize::MAX);
            for record in output.into_records().iter().take(limit) {
                channel.write_byte(STREAM_RECORD)?;
                write_record(channel, Some(record))?;
            }
            channel.write_byte(STREAM_END)?;
        }
        CommandMode::Sync => match output {
            CommandOutput::Null => {
                channel.write_byte(RESULT_NULL)?;
                channel.write_bytes(None)?;
            }
            CommandOutput::Record(record) => {
                channel.write_byte(RESULT_RECORD)?;
                write_record(channel, Some(&record))?;
            }
            CommandOutput::Value(value) => {
                channel.write_byte(RESULT_VALUE)?;
                channel.write_bytes(Some(&value.encode()?))?;
            }
            CommandOutput::Records(records) => {
                channel.write_byte(RESULT_VALUE)?;
                channel.write_bytes(Some(&CommandOutput::rid_list(&records).encode()?))?;
            }
        },
    }
    Ok(())
}

fn dictionary_lookup(
    _context: &ServerContext,
    session: &mut Session,
    channel: &mut dyn Channel,
) -> ServerResult<()> {
    let key = channel.read_required_string("dictionary key")?;
    let database = open_database(session, Resource::Dictionary, Operation::Read)?;

    let record = match database.dictionary().get(&key) {
        Some(id) => read_bound(&database, id)?,
        None => None,
    };
    ok(channel)?;
    write_record(channel, record.as_ref())?;
    Ok(())
}

fn dictionary_put(_context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let key = channel.read_required_string("dictionary key")?;
    // The type tag describes the bound record; the store already knows it.
    read_record_type(channel)?;
    let rid = channel.read_required_string("record id")?;
    let id: RecordId = rid.parse()?;
    let database = open_database(session, Resource::Dictionary, Operation::Update)?;

    let previous = match database.dictionary().put(&key, id)? {
        Some(previous) => read_bound(&database, previous)?,
        None => None,
    };
    ok(channel)?;
    write_record(channel, previous.as_ref())?;
    Ok(())
}

fn dictionary_remove(
    _context: &ServerContext,
    session: &mut Session,
    channel: &mut dyn Channel,
) -> ServerResult<()> {
    let key = channel.read_required_string("dictionary key")?;
    let database = open_database(session, Resource::Dictionary, Operation::Delete)?;

    let removed = match database.dictionary().remove(&key)? {
        Some(id) => read_bound(&database, id)?,
        None => None,
    };
    ok(channel)?;
    write_record(channel, removed.as_ref())?;
    Ok(())
}

fn dictionary_size(_context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let database = open_database(session, Resource::Dictionary, Operation::Read)?;
    let size = database.dictionary().len();
    ok(channel)?;
    channel.write_int(i32::try_from(size).unwrap_or(i32::MAX))?;
    Ok(())
}

fn dictionary_keys(_context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let database = open_database(session, Resource::Dictionary, Operation::Read)?;
    let keys = database.dictionary().keys();
    ok(channel)?;
    channel.write_string_collection(&keys)?;
    Ok(())
}

/// Entries are decoded while the commit runs. On failure the batch has been
/// rolled back; its unread entries are drained so the envelope answers the
/// whole request.
fn tx_commit(_context: &ServerContext, session: &mut Session, channel: &mut dyn Channel) -> ServerResult<()> {
    let database = open_database(session, Resource::Record, Operation::Update);
    let outcome = {
        let mut entries = TransactionProxy::begin(channel)?.entries();
        let client_tx_id = entries.client_tx_id();
        let result = match database {
            Ok(database) => database
                .commit(client_tx_id, entries.by_ref())
                .map_err(ServerError::from),
            Err(err) => Err(err),
        };
        if result.is_err() {
            if let Err(err) = entries.skip_remaining() {
                debug!(error = %err, "could not drain rejected transaction");
            }
        }
        result?
    };

    debug!(
        tx = outcome.client_tx_id,
        created = outcome.created.len(),
        updated = outcome.updated.len(),
        deleted = outcome.deleted,
        "transaction committed"
    );
    ok(channel)?;
    channel.write_int(i32::try_from(outcome.created.len()).unwrap_or(i32::MAX))?;
    for (temporary, assigned) in &outcome.created {
        channel.write_short(temporary.cluster_id)?;
        channel.write_long(temporary.position)?;
        channel.write_short(assigned.cluster_id)?;
        channel.write_long(assigned.position)?;
    }
    channel.write_int(i32::try_from(outcome.updated.len()).unwrap_or(i32::MAX))?;
    for (id, version) in &outcome.updated {
        channel.write_short(id.cluster_id)?;
        channel.write_long(id.position)?;
        channel.write_int(*version)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::io::Cursor;
    use vellum_core::TxEntry;
    use vellum_protocol::{write_transaction, CommandValue, WireChannel};

    type Reader = WireChannel<Cursor<Vec<u8>>, Vec<u8>>;

    fn context() -> ServerContext {
        ServerContext::new(ServerConfig::default()).unwrap()
    }

    /// Runs one cycle over `request` and returns a reader over the response.
    fn call(
        context: &ServerContext,
        session: &mut Session,
        request: impl FnOnce(&mut dyn Channel),
    ) -> Reader {
        let mut writer = WireChannel::new(&[][..], Vec::new());
        request(&mut writer);
        let bytes = writer.into_writer().unwrap();

        let mut channel = WireChannel::new(Cursor::new(bytes), Vec::new());
        assert_eq!(run_cycle(context, session, &mut channel), CycleOutcome::Continue);
        WireChannel::new(Cursor::new(channel.into_writer().unwrap()), Vec::new())
    }

    fn expect_ok(response: &mut Reader) {
        let status = response.read_byte().unwrap();
        if status != STATUS_OK {
            let category = response.read_string().unwrap();
            let message = response.read_string().unwrap();
            unreachable!("expected OK, got {category:?}: {message:?}");
        }
    }

    fn expect_error(response: &mut Reader) -> (Option<String>, Option<String>) {
        assert_eq!(response.read_byte().unwrap(), STATUS_ERROR);
        (response.read_string().unwrap(), response.read_string().unwrap())
    }

    /// An admin session bound to a fresh memory database.
    fn admin_session(context: &ServerContext, name: &str) -> Session {
        let mut session = Session::new(None);
        let mut response = call(context, &mut session, |c| {
            c.write_byte(opcode::CONNECT).unwrap();
            c.write_string(Some("admin")).unwrap();
            c.write_string(Some("admin")).unwrap();
        });
        expect_ok(&mut response);
        assert_eq!(response.read_string().unwrap().as_deref(), Some(session.id()));

        let mut response = call(context, &mut session, |c| {
            c.write_byte(opcode::DB_CREATE).unwrap();
            c.write_string(Some(name)).unwrap();
            c.write_string(Some("memory")).unwrap();
        });
        expect_ok(&mut response);
        session
    }

    fn create(context: &ServerContext, session: &mut Session, cluster: i16, content: &[u8]) -> i64 {
        let mut response = call(context, session, |c| {
            c.write_byte(opcode::RECORD_CREATE).unwrap();
            c.write_short(cluster).unwrap();
            c.write_bytes(Some(content)).unwrap();
            c.write_byte(b'd').unwrap();
        });
        expect_ok(&mut response);
        response.read_long().unwrap()
    }

    fn load(context: &ServerContext, session: &mut Session, cluster: i16, position: i64) -> Option<(Vec<u8>, i32)> {
        let mut response = call(context, session, |c| {
            c.write_byte(opcode::RECORD_LOAD).unwrap();
            c.write_short(cluster).unwrap();
            c.write_long(position).unwrap();
        });
        expect_ok(&mut response);
        if response.read_byte().unwrap() == 0 {
            return None;
        }
        let content = response.read_bytes().unwrap().unwrap();
        let version = response.read_int().unwrap();
        assert_eq!(response.read_byte().unwrap(), b'd');
        Some((content, version))
    }

    #[test]
    fn table_matches_protocol_opcodes() {
        assert_eq!(OPCODES.len(), opcode::ALL.len());
        for (code, name) in opcode::ALL {
            assert_eq!(lookup(*code).map(|spec| spec.name), Some(*name));
        }
        assert!(lookup(99).is_none());
    }

    #[test]
    fn url_names() {
        assert_eq!(database_name_from_url("memory:demo"), "demo");
        assert_eq!(database_name_from_url("local:/var/db/demo"), "demo");
        assert_eq!(database_name_from_url("remote:host:2424/demo"), "demo");
        assert_eq!(database_name_from_url("demo"), "demo");
    }

    #[test]
    fn unknown_opcode_gets_null_envelope() {
        let context = context();
        let mut session = Session::new(None);
        let mut response = call(&context, &mut session, |c| {
            c.write_byte(200).unwrap();
            c.write_int(42).unwrap();
        });
        assert_eq!(expect_error(&mut response), (None, None));
        assert_eq!(session.stats().requests, 1);
        assert_eq!(session.stats().failures, 1);
    }

    #[test]
    fn empty_input_closes() {
        let context = context();
        let mut session = Session::new(None);
        let mut channel = WireChannel::new(Cursor::new(Vec::new()), Vec::new());
        assert_eq!(run_cycle(&context, &mut session, &mut channel), CycleOutcome::Closed);
        assert!(channel.into_writer().unwrap().is_empty());
    }

    #[test]
    fn truncated_request_closes_without_envelope() {
        let context = context();
        let mut session = admin_session(&context, "trunc");
        let mut channel = WireChannel::new(Cursor::new(vec![opcode::RECORD_LOAD, 0]), Vec::new());
        assert_eq!(run_cycle(&context, &mut session, &mut channel), CycleOutcome::Closed);
        assert!(channel.into_writer().unwrap().is_empty());
    }

    #[test]
    fn bad_credentials() {
        let context = context();
        let mut session = Session::new(None);
        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::CONNECT).unwrap();
            c.write_string(Some("admin")).unwrap();
            c.write_string(Some("wrong")).unwrap();
        });
        let (category, _) = expect_error(&mut response);
        assert_eq!(category.as_deref(), Some("authentication"));
        assert!(session.principal().is_none());
    }

    #[test]
    fn record_ops_need_a_database() {
        let context = context();
        let mut session = Session::new(None);
        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::RECORD_LOAD).unwrap();
            c.write_short(3).unwrap();
            c.write_long(0).unwrap();
        });
        let (category, _) = expect_error(&mut response);
        assert_eq!(category.as_deref(), Some("not-open"));
    }

    #[test]
    fn record_lifecycle() {
        let context = context();
        let mut session = admin_session(&context, "life");

        assert_eq!(create(&context, &mut session, 3, b"hello"), 0);
        assert_eq!(load(&context, &mut session, 3, 0), Some((b"hello".to_vec(), 0)));

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::RECORD_UPDATE).unwrap();
            c.write_short(3).unwrap();
            c.write_long(0).unwrap();
            c.write_bytes(Some(&b"world"[..])).unwrap();
            c.write_int(0).unwrap();
            c.write_byte(b'd').unwrap();
        });
        expect_ok(&mut response);
        assert_eq!(response.read_int().unwrap(), 1);

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::RECORD_UPDATE).unwrap();
            c.write_short(3).unwrap();
            c.write_long(0).unwrap();
            c.write_bytes(Some(&b"stale"[..])).unwrap();
            c.write_int(0).unwrap();
            c.write_byte(b'd').unwrap();
        });
        let (category, message) = expect_error(&mut response);
        assert_eq!(category.as_deref(), Some("version-conflict"));
        assert!(message.unwrap().contains("#3:0"));
        assert_eq!(load(&context, &mut session, 3, 0), Some((b"world".to_vec(), 1)));

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::RECORD_DELETE).unwrap();
            c.write_short(3).unwrap();
            c.write_long(0).unwrap();
            c.write_int(1).unwrap();
        });
        expect_ok(&mut response);
        assert_eq!(load(&context, &mut session, 3, 0), None);
    }

    #[test]
    fn unknown_record_type_is_a_decode_error() {
        let context = context();
        let mut session = admin_session(&context, "tags");
        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::RECORD_CREATE).unwrap();
            c.write_short(3).unwrap();
            c.write_bytes(Some(&b"x"[..])).unwrap();
            c.write_byte(b'q').unwrap();
            // Trailing garbage is discarded with the failed request.
            c.write_long(-1).unwrap();
        });
        let (category, _) = expect_error(&mut response);
        assert_eq!(category.as_deref(), Some("decode"));
        assert!(response.read_byte().is_err());

        // The session keeps working.
        assert_eq!(create(&context, &mut session, 3, b"ok"), 0);
    }

    #[test]
    fn reader_cannot_write() {
        let context = context();
        admin_session(&context, "shared");

        let mut session = Session::new(None);
        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::DB_OPEN).unwrap();
            c.write_string(Some("memory:shared")).unwrap();
            c.write_string(Some("reader")).unwrap();
            c.write_string(Some("reader")).unwrap();
        });
        expect_ok(&mut response);
        response.read_string().unwrap();
        assert!(response.read_int().unwrap() >= 6);

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::RECORD_CREATE).unwrap();
            c.write_short(3).unwrap();
            c.write_bytes(Some(&b"x"[..])).unwrap();
            c.write_byte(b'd').unwrap();
        });
        let (category, _) = expect_error(&mut response);
        assert_eq!(category.as_deref(), Some("authorization"));
        assert_eq!(load(&context, &mut session, 3, 0), None);
    }

    #[test]
    fn clusters_and_counts() {
        let context = context();
        let mut session = admin_session(&context, "clusters");

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::CLUSTER_PHYSICAL_ADD).unwrap();
            c.write_string(Some("people")).unwrap();
            c.write_string(None).unwrap();
            c.write_int(-1).unwrap();
        });
        expect_ok(&mut response);
        let people = response.read_short().unwrap();

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::CLUSTER_LOGICAL_ADD).unwrap();
            c.write_string(Some("vip")).unwrap();
            c.write_int(i32::from(people)).unwrap();
        });
        expect_ok(&mut response);
        let vip = response.read_short().unwrap();
        let descriptor = response.read_string().unwrap().unwrap();
        assert_eq!(descriptor, format!("#{people}:0"));

        create(&context, &mut session, vip, b"a");
        create(&context, &mut session, vip, b"b");
        create(&context, &mut session, people, b"c");

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::CLUSTER_COUNT).unwrap();
            c.write_short(2).unwrap();
            c.write_short(people).unwrap();
            c.write_short(vip).unwrap();
        });
        expect_ok(&mut response);
        // Descriptor plus "c" in people, two in vip.
        assert_eq!(response.read_long().unwrap(), 4);

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::COUNT).unwrap();
            c.write_string(Some("vip")).unwrap();
        });
        expect_ok(&mut response);
        assert_eq!(response.read_long().unwrap(), 2);

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::CLUSTER_COUNT).unwrap();
            c.write_short(1).unwrap();
            c.write_short(999).unwrap();
        });
        let (category, _) = expect_error(&mut response);
        assert_eq!(category.as_deref(), Some("not-found"));
    }

    #[test]
    fn dictionary() {
        let context = context();
        let mut session = admin_session(&context, "dict");
        let position = create(&context, &mut session, 3, b"target");

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::DICTIONARY_PUT).unwrap();
            c.write_string(Some("home")).unwrap();
            c.write_byte(b'd').unwrap();
            c.write_string(Some(format!("#3:{position}").as_str())).unwrap();
        });
        expect_ok(&mut response);
        assert_eq!(response.read_short().unwrap(), opcode::RECORD_NULL);

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::DICTIONARY_LOOKUP).unwrap();
            c.write_string(Some("home")).unwrap();
        });
        expect_ok(&mut response);
        let record = vellum_protocol::frame::read_record(&mut response).unwrap().unwrap();
        assert_eq!(&record.content[..], b"target");

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::DICTIONARY_KEYS).unwrap();
        });
        expect_ok(&mut response);
        assert_eq!(response.read_int().unwrap(), 1);
        assert_eq!(response.read_string().unwrap().as_deref(), Some("home"));

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::DICTIONARY_REMOVE).unwrap();
            c.write_string(Some("home")).unwrap();
        });
        expect_ok(&mut response);
        assert!(vellum_protocol::frame::read_record(&mut response).unwrap().is_some());

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::DICTIONARY_SIZE).unwrap();
        });
        expect_ok(&mut response);
        assert_eq!(response.read_int().unwrap(), 0);
    }

    #[test]
    fn entry_in_unknown_cluster_reads_as_null() {
        let context = context();
        let mut session = admin_session(&context, "stale");

        for key in ["gone", "gone"] {
            let mut response = call(&context, &mut session, |c| {
                c.write_byte(opcode::DICTIONARY_PUT).unwrap();
                c.write_string(Some(key)).unwrap();
                c.write_byte(b'd').unwrap();
                c.write_string(Some("#999:0")).unwrap();
            });
            expect_ok(&mut response);
            assert!(vellum_protocol::frame::read_record(&mut response).unwrap().is_none());
        }

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::DICTIONARY_LOOKUP).unwrap();
            c.write_string(Some("gone")).unwrap();
        });
        expect_ok(&mut response);
        assert!(vellum_protocol::frame::read_record(&mut response).unwrap().is_none());

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::DICTIONARY_REMOVE).unwrap();
            c.write_string(Some("gone")).unwrap();
        });
        expect_ok(&mut response);
        assert!(vellum_protocol::frame::read_record(&mut response).unwrap().is_none());

        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::DICTIONARY_SIZE).unwrap();
        });
        expect_ok(&mut response);
        assert_eq!(response.read_int().unwrap(), 0);
    }

    #[test]
    fn layout_skips_fixed_operands_only() {
        let mut writer = WireChannel::new(&[][..], Vec::new());
        writer.write_short(3).unwrap();
        writer.write_bytes(Some(&[0u8; 40][..])).unwrap();
        writer.write_byte(b'd').unwrap();
        writer.write_byte(opcode::DB_EXIST).unwrap();
        let bytes = writer.into_writer().unwrap();

        let mut channel = WireChannel::new(Cursor::new(bytes), Vec::new()).with_max_length(16);
        skip_unread_operands(&mut channel, "cluster:short content:bytes type:byte", 0).unwrap();
        assert_eq!(channel.read_byte().unwrap(), opcode::DB_EXIST);

        let mut channel = WireChannel::new(Cursor::new(vec![7u8]), Vec::new());
        skip_unread_operands(&mut channel, "count:short ids:short[]", 1).unwrap();
        assert_eq!(channel.read_byte().unwrap(), 7);
    }

    #[test]
    fn sync_and_async_commands() {
        let context = context();
        let mut session = admin_session(&context, "commands");
        for content in [b"a", b"b", b"c"] {
            create(&context, &mut session, 3, content);
        }

        let payload = CommandRequest::new("SELECT COUNT(*) FROM cluster:users")
            .encode()
            .unwrap();
        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::COMMAND).unwrap();
            c.write_byte(b's').unwrap();
            c.write_bytes(Some(payload.as_slice())).unwrap();
        });
        expect_ok(&mut response);
        assert_eq!(response.read_byte().unwrap(), RESULT_VALUE);
        let value = CommandValue::decode(&response.read_bytes().unwrap().unwrap()).unwrap();
        assert_eq!(value, CommandValue::Integer(3));

        let payload = CommandRequest::new("SELECT FROM cluster:users")
            .with_limit(2)
            .encode()
            .unwrap();
        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::COMMAND).unwrap();
            c.write_byte(b'a').unwrap();
            c.write_bytes(Some(payload.as_slice())).unwrap();
        });
        expect_ok(&mut response);
        let mut streamed = 0;
        while response.read_byte().unwrap() == STREAM_RECORD {
            vellum_protocol::frame::read_record(&mut response).unwrap().unwrap();
            streamed += 1;
        }
        assert_eq!(streamed, 2);

        let payload = CommandRequest::new("TRUNCATE users").encode().unwrap();
        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::COMMAND).unwrap();
            c.write_byte(b'a').unwrap();
            c.write_bytes(Some(payload.as_slice())).unwrap();
        });
        let (category, _) = expect_error(&mut response);
        assert_eq!(category.as_deref(), Some("command"));
        assert_eq!(session.stats().last_command.as_deref(), Some("TRUNCATE users"));
    }

    #[test]
    fn transaction_commit_and_rollback() {
        let context = context();
        let mut session = admin_session(&context, "tx");
        let existing = create(&context, &mut session, 3, b"v0");

        let entries = vec![
            TxEntry::created(3, None, b"new".to_vec()),
            TxEntry::updated(RecordId::new(3, existing), 0, b"v1".to_vec()),
        ];
        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::TX_COMMIT).unwrap();
            write_transaction(c, 7, &entries).unwrap();
        });
        expect_ok(&mut response);
        assert_eq!(response.read_int().unwrap(), 1);
        assert_eq!(response.read_short().unwrap(), 3);
        assert_eq!(response.read_long().unwrap(), -2);
        assert_eq!(response.read_short().unwrap(), 3);
        let created = response.read_long().unwrap();
        assert_eq!(response.read_int().unwrap(), 1);
        assert_eq!(response.read_short().unwrap(), 3);
        assert_eq!(response.read_long().unwrap(), existing);
        assert_eq!(response.read_int().unwrap(), 1);

        // Second batch: a create, then a stale update. Nothing sticks.
        let entries = vec![
            TxEntry::created(3, None, b"ghost".to_vec()),
            TxEntry::updated(RecordId::new(3, existing), 0, b"lost".to_vec()),
            TxEntry::deleted(RecordId::new(3, created), 0),
        ];
        let mut response = call(&context, &mut session, |c| {
            c.write_byte(opcode::TX_COMMIT).unwrap();
            write_transaction(c, 8, &entries).unwrap();
        });
        let (category, _) = expect_error(&mut response);
        assert_eq!(category.as_deref(), Some("version-conflict"));

        assert_eq!(load(&context, &mut session, 3, existing), Some((b"v1".to_vec(), 1)));
        assert_eq!(load(&context, &mut session, 3, created), Some((b"new".to_vec(), 0)));
        assert_eq!(load(&context, &mut session, 3, created + 1), None);
    }

    #[test]
    fn db_exist_and_close() {
        let context = context();
        let mut session = admin_session(&context, "exists");

        let mut response = call(&context, &mut session, |c| c.write_byte(opcode::DB_EXIST).unwrap());
        expect_ok(&mut response);
        assert_eq!(response.read_byte().unwrap(), 1);

        let mut response = call(&context, &mut session, |c| c.write_byte(opcode::DB_CLOSE).unwrap());
        expect_ok(&mut response);

        let mut response = call(&context, &mut session, |c| c.write_byte(opcode::DB_EXIST).unwrap());
        let (category, _) = expect_error(&mut response);
        assert_eq!(category.as_deref(), Some("not-open"));
    }
}
