//! End-to-end tests: a real listener driven by `RemoteClient` over TCP.

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use vellum_core::{RecordId, RecordType, TxEntry};
use vellum_protocol::opcode;
use vellum_protocol::{
    CommandRequest, CommandResult, CommandValue, ProtocolError, RemoteClient, WireChannel,
};
use vellum_server::{Server, ServerConfig, ServerHandle, ServerResult};

type Client = RemoteClient<TcpStream, TcpStream>;

struct Running {
    handle: ServerHandle,
    thread: Option<JoinHandle<ServerResult<()>>>,
}

impl Running {
    fn start(config: ServerConfig) -> Self {
        let config = config.with_bind_addr(SocketAddr::from(([127, 0, 0, 1], 0)));
        let (handle, thread) = Server::bind(config).unwrap().spawn().unwrap();
        Self {
            handle,
            thread: Some(thread),
        }
    }

    fn client(&self) -> Client {
        let mut client = RemoteClient::connect_tcp(self.handle.addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        client
    }

    /// A client logged in as admin with a fresh memory database bound.
    fn admin(&self, database: &str) -> Client {
        let mut client = self.client();
        client.connect("admin", "admin").unwrap();
        client.db_create(database, "memory").unwrap();
        client
    }

    fn stop(mut self) {
        let report = self.handle.shutdown();
        assert!(report.is_clean(), "{:?}", report.failures);
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap().unwrap();
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.handle.shutdown();
        }
    }
}

fn category(err: &ProtocolError) -> Option<&str> {
    err.remote_category()
}

#[test]
fn record_lifecycle_over_tcp() {
    let server = Running::start(ServerConfig::default());
    let mut client = server.client();

    let session = client.connect("admin", "admin").unwrap();
    assert!(!session.is_empty());
    client.db_create("demo", "memory").unwrap();
    assert!(client.db_exist().unwrap());

    let position = client
        .record_create(3, b"hello", RecordType::Document)
        .unwrap();
    assert_eq!(position, 0);
    let id = RecordId::new(3, position);

    let record = client.record_load(id).unwrap().unwrap();
    assert_eq!(&record.content[..], b"hello");
    assert_eq!(record.version, 0);

    let version = client
        .record_update(id, b"world", 0, RecordType::Document)
        .unwrap();
    assert_eq!(version, 1);

    let err = client
        .record_update(id, b"stale", 0, RecordType::Document)
        .unwrap_err();
    assert_eq!(category(&err), Some("version-conflict"));

    // The connection survives the rejected request.
    let record = client.record_load(id).unwrap().unwrap();
    assert_eq!(&record.content[..], b"world");
    assert_eq!(record.version, 1);

    client.record_delete(id, 1).unwrap();
    assert!(client.record_load(id).unwrap().is_none());

    let err = client.record_delete(id, 1).unwrap_err();
    assert_eq!(category(&err), Some("not-found"));

    server.stop();
}

#[test]
fn unknown_opcode_and_anonymous_requests() {
    let server = Running::start(ServerConfig::default());
    let mut client = server.client();

    match client.raw_request(&[0xEE, 1, 2, 3]).unwrap_err() {
        ProtocolError::Remote { category, message } => {
            assert!(category.is_none());
            assert!(message.is_none());
        }
        other => unreachable!("unexpected error {other}"),
    }

    let err = client.record_load(RecordId::new(3, 0)).unwrap_err();
    assert_eq!(category(&err), Some("not-open"));

    let err = client.connect("admin", "nope").unwrap_err();
    assert_eq!(category(&err), Some("authentication"));

    // Still usable afterwards.
    client.connect("admin", "admin").unwrap();
    server.stop();
}

#[test]
fn db_open_shares_the_database_between_sessions() {
    let server = Running::start(ServerConfig::default());
    let mut admin = server.admin("shared");
    let position = admin.record_create(3, b"alice", RecordType::Document).unwrap();

    let mut reader = server.client();
    let (_, clusters) = reader.db_open("memory:shared", "reader", "reader").unwrap();
    assert!(clusters.contains(&("users".to_string(), 3)));
    assert!(clusters.contains(&("dictionary".to_string(), 5)));

    let record = reader.record_load(RecordId::new(3, position)).unwrap().unwrap();
    assert_eq!(&record.content[..], b"alice");

    let err = reader
        .record_create(3, b"bob", RecordType::Document)
        .unwrap_err();
    assert_eq!(category(&err), Some("authorization"));

    let err = reader.db_open("memory:missing", "reader", "reader").unwrap_err();
    assert_eq!(category(&err), Some("not-found"));

    server.stop();
}

#[test]
fn transaction_maps_temporary_ids() {
    let server = Running::start(ServerConfig::default());
    let mut client = server.admin("tx");
    let existing = RecordId::new(3, client.record_create(3, b"v0", RecordType::Document).unwrap());

    let entries = vec![
        TxEntry::created(3, None, b"first".to_vec()),
        TxEntry::created(2, None, b"second".to_vec()),
        TxEntry::updated(RecordId::temporary(3, 0), 0, b"first'".to_vec()),
        TxEntry::updated(existing, 0, b"v1".to_vec()),
    ];
    let outcome = client.tx_commit(1, &entries).unwrap();

    assert_eq!(outcome.created.len(), 2);
    assert_eq!(outcome.created[0].0, RecordId::new(3, -2));
    assert_eq!(outcome.created[1].0, RecordId::new(2, -3));
    let first = outcome.created[0].1;
    assert_eq!(first.cluster_id, 3);

    let record = client.record_load(first).unwrap().unwrap();
    assert_eq!(&record.content[..], b"first'");
    assert_eq!(record.version, 1);
    assert_eq!(client.record_load(existing).unwrap().unwrap().version, 1);

    server.stop();
}

#[test]
fn failed_transaction_leaves_no_trace() {
    let server = Running::start(ServerConfig::default());
    let mut client = server.admin("rollback");
    let existing = RecordId::new(3, client.record_create(3, b"v0", RecordType::Document).unwrap());
    let before = client.count("users").unwrap();

    let entries = vec![
        TxEntry::created(3, None, b"ghost".to_vec()),
        TxEntry::updated(existing, 0, b"v1".to_vec()),
        TxEntry::updated(existing, 7, b"v2".to_vec()),
        TxEntry::deleted(existing, 2),
    ];
    let err = client.tx_commit(9, &entries).unwrap_err();
    assert_eq!(category(&err), Some("version-conflict"));

    assert_eq!(client.count("users").unwrap(), before);
    let record = client.record_load(existing).unwrap().unwrap();
    assert_eq!(&record.content[..], b"v0");
    assert_eq!(record.version, 0);

    server.stop();
}

#[test]
fn commands_sync_and_async() {
    let server = Running::start(ServerConfig::default());
    let mut client = server.admin("commands");
    for content in [b"a", b"b", b"c"] {
        client.record_create(3, content, RecordType::Document).unwrap();
    }

    let result = client
        .command(&CommandRequest::new("select count(*) from users"))
        .unwrap();
    assert!(matches!(result, CommandResult::Value(CommandValue::Integer(3))));

    match client.command(&CommandRequest::new("LOAD #3:1")).unwrap() {
        CommandResult::Record(record) => assert_eq!(&record.content[..], b"b"),
        other => unreachable!("unexpected result {other:?}"),
    }
    assert!(matches!(
        client.command(&CommandRequest::new("LOAD #3:99")).unwrap(),
        CommandResult::Null
    ));

    match client.command(&CommandRequest::new("SELECT FROM users")).unwrap() {
        CommandResult::Value(CommandValue::List(rids)) => assert_eq!(rids.len(), 3),
        other => unreachable!("unexpected result {other:?}"),
    }

    let streamed = client
        .command_async(&CommandRequest::new("SELECT FROM cluster:users").with_limit(2))
        .unwrap();
    assert_eq!(streamed.len(), 2);
    assert_eq!(&streamed[0].content[..], b"a");

    let err = client
        .command_async(&CommandRequest::new("DROP CLUSTER users"))
        .unwrap_err();
    assert_eq!(category(&err), Some("command"));

    server.stop();
}

#[test]
fn clusters_and_dictionary() {
    let server = Running::start(ServerConfig::default());
    let mut client = server.admin("clusters");

    let people = client.cluster_physical_add("people", None, -1).unwrap();
    let (vip, descriptor) = client
        .cluster_logical_add("vip", i32::from(people))
        .unwrap();
    assert_eq!(descriptor.cluster_id, people);

    let position = client.record_create(vip, b"carol", RecordType::Document).unwrap();
    assert_eq!(client.count("vip").unwrap(), 1);
    assert_eq!(client.cluster_count(&[people, vip]).unwrap(), 2);

    let err = client.cluster_physical_add("people", None, -1).unwrap_err();
    assert_eq!(category(&err), Some("invalid-request"));

    let id = RecordId::new(vip, position);
    assert!(client
        .dictionary_put("star", RecordType::Document, id)
        .unwrap()
        .is_none());
    let previous = client
        .dictionary_put("star", RecordType::Document, id)
        .unwrap()
        .unwrap();
    assert_eq!(&previous.content[..], b"carol");

    let found = client.dictionary_lookup("star").unwrap().unwrap();
    assert_eq!(found.id, id);
    assert!(client.dictionary_lookup("missing").unwrap().is_none());
    assert_eq!(client.dictionary_keys().unwrap(), vec!["star".to_string()]);
    assert_eq!(client.dictionary_size().unwrap(), 1);

    assert!(client.dictionary_remove("star").unwrap().is_some());
    assert_eq!(client.dictionary_size().unwrap(), 0);

    server.stop();
}

fn local_config(root: &Path) -> ServerConfig {
    ServerConfig::default().with_storage_root(root)
}

#[test]
fn local_databases_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let server = Running::start(local_config(dir.path()));
    let mut client = server.client();
    client.connect("admin", "admin").unwrap();
    client.db_create("durable", "local").unwrap();
    let position = client.record_create(3, b"kept", RecordType::Document).unwrap();
    let id = RecordId::new(3, position);
    client.record_update(id, b"kept twice", 0, RecordType::Document).unwrap();
    client.dictionary_put("pin", RecordType::Document, id).unwrap();
    client.close().unwrap();
    server.stop();

    let server = Running::start(local_config(dir.path()));
    let mut client = server.client();
    let url = format!("local:{}/durable", dir.path().display());
    client.db_open(&url, "admin", "admin").unwrap();

    let record = client.record_load(id).unwrap().unwrap();
    assert_eq!(&record.content[..], b"kept twice");
    assert_eq!(record.version, 1);
    assert_eq!(client.dictionary_lookup("pin").unwrap().unwrap().id, id);
    server.stop();
}

#[test]
fn closing_the_database_unbinds_the_session() {
    let server = Running::start(ServerConfig::default());
    let mut client = server.admin("closing");
    client.db_close().unwrap();

    let err = client.db_exist().unwrap_err();
    assert_eq!(category(&err), Some("not-open"));

    // Closing again is harmless.
    client.db_close().unwrap();
    server.stop();
}

/// A client plus a second handle on its socket for hand-built writes.
fn split_client(server: &Running) -> (Client, TcpStream) {
    let stream = TcpStream::connect(server.handle.addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let raw = stream.try_clone().unwrap();
    let client = RemoteClient::new(WireChannel::new(stream.try_clone().unwrap(), stream));
    (client, raw)
}

/// Sends `head`, pauses so the server sees a partial request, then sends `tail`.
fn send_in_two_writes(raw: &mut TcpStream, head: &[u8], tail: &[u8]) {
    raw.write_all(head).unwrap();
    raw.flush().unwrap();
    thread::sleep(Duration::from_millis(300));
    raw.write_all(tail).unwrap();
    raw.flush().unwrap();
}

fn read_envelope(client: &mut Client) -> (Option<String>, Option<String>) {
    let channel = client.channel();
    assert_eq!(channel.read_byte().unwrap(), opcode::STATUS_ERROR);
    (channel.read_string().unwrap(), channel.read_string().unwrap())
}

#[test]
fn oversize_operand_arriving_late_is_skipped() {
    let server = Running::start(ServerConfig::default().with_max_frame_length(16));
    let (mut client, mut raw) = split_client(&server);

    // RECORD_CREATE: cluster 3, 64 content bytes, type byte.
    let mut head = vec![opcode::RECORD_CREATE];
    head.extend_from_slice(&3i16.to_be_bytes());
    head.extend_from_slice(&64i32.to_be_bytes());
    head.extend_from_slice(&[0x5A; 10]);
    let mut tail = vec![0x5A; 54];
    tail.push(b'd');
    send_in_two_writes(&mut raw, &head, &tail);

    let (category, message) = read_envelope(&mut client);
    assert_eq!(category.as_deref(), Some("decode"));
    assert!(message.is_some());

    client.connect("admin", "admin").unwrap();
    client.db_create("split", "memory").unwrap();
    let position = client.record_create(3, b"small", RecordType::Document).unwrap();
    let record = client.record_load(RecordId::new(3, position)).unwrap().unwrap();
    assert_eq!(&record.content[..], b"small");

    server.stop();
}

#[test]
fn operands_after_a_rejected_key_are_skipped() {
    let server = Running::start(ServerConfig::default().with_max_frame_length(16));
    let (mut client, mut raw) = split_client(&server);
    client.connect("admin", "admin").unwrap();
    client.db_create("keys", "memory").unwrap();

    // DICTIONARY_PUT: oversize key, type byte, rid string.
    let mut head = vec![opcode::DICTIONARY_PUT];
    head.extend_from_slice(&32i32.to_be_bytes());
    head.extend_from_slice(&[b'k'; 8]);
    let mut tail = vec![b'k'; 24];
    tail.push(b'd');
    tail.extend_from_slice(&4i32.to_be_bytes());
    tail.extend_from_slice(b"#3:0");
    send_in_two_writes(&mut raw, &head, &tail);

    let (category, _) = read_envelope(&mut client);
    assert_eq!(category.as_deref(), Some("decode"));

    assert_eq!(client.dictionary_size().unwrap(), 0);
    assert!(client.db_exist().unwrap());

    server.stop();
}
