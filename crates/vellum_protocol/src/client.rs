//! Blocking client for the binary protocol.
//!
//! One request is in flight at a time; every call writes its request,
//! flushes, and reads the full response before returning.

use crate::channel::{Channel, InputSource, WireChannel};
use crate::command::{
    CommandMode, CommandRequest, CommandValue, RESULT_NULL, RESULT_RECORD, RESULT_VALUE,
    STREAM_END, STREAM_RECORD,
};
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::{read_record, read_record_type};
use crate::opcode;
use crate::transaction::write_transaction;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use vellum_core::{
    ClusterId, CommitOutcome, Record, RecordId, RecordType, TxEntry, TxStatus,
};

/// Synchronous result of a COMMAND request.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// No value.
    Null,
    /// A single record.
    Record(Record),
    /// A scalar or list value.
    Value(CommandValue),
}

/// Client side of one connection.
pub struct RemoteClient<R: InputSource, W: Write> {
    channel: WireChannel<R, W>,
}

impl RemoteClient<TcpStream, TcpStream> {
    /// Connects over TCP.
    ///
    /// # Errors
    ///
    /// Connection failures.
    pub fn connect_tcp(addr: impl ToSocketAddrs) -> ProtocolResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        Ok(Self::new(WireChannel::new(reader, stream)))
    }

    /// Sets the read timeout of the underlying socket.
    ///
    /// # Errors
    ///
    /// Socket option failures.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> ProtocolResult<()> {
        self.channel.get_ref().set_read_timeout(timeout)?;
        Ok(())
    }
}

impl<R: InputSource, W: Write> RemoteClient<R, W> {
    /// Wraps an established channel.
    pub const fn new(channel: WireChannel<R, W>) -> Self {
        Self { channel }
    }

    /// Releases the channel.
    pub fn into_channel(self) -> WireChannel<R, W> {
        self.channel
    }

    /// Flushes anything pending and hangs up.
    pub fn close(self) -> ProtocolResult<()> {
        self.channel.close()
    }

    /// Authenticates; returns the session id.
    pub fn connect(&mut self, user: &str, password: &str) -> ProtocolResult<String> {
        self.begin(opcode::CONNECT)?;
        self.channel.write_string(Some(user))?;
        self.channel.write_string(Some(password))?;
        self.finish()?;
        self.channel.read_required_string("session id")
    }

    /// Opens a database; returns the session id and `(name, id)` per cluster.
    pub fn db_open(
        &mut self,
        url: &str,
        user: &str,
        password: &str,
    ) -> ProtocolResult<(String, Vec<(String, i32)>)> {
        self.begin(opcode::DB_OPEN)?;
        self.channel.write_string(Some(url))?;
        self.channel.write_string(Some(user))?;
        self.channel.write_string(Some(password))?;
        self.finish()?;
        let session_id = self.channel.read_required_string("session id")?;
        let count = self.channel.read_int()?;
        let mut clusters = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
        for _ in 0..count {
            let name = self.channel.read_required_string("cluster name")?;
            let id = self.channel.read_int()?;
            clusters.push((name, id));
        }
        Ok((session_id, clusters))
    }

    /// Creates a database with the given storage mode.
    pub fn db_create(&mut self, name: &str, storage_mode: &str) -> ProtocolResult<()> {
        self.begin(opcode::DB_CREATE)?;
        self.channel.write_string(Some(name))?;
        self.channel.write_string(Some(storage_mode))?;
        self.finish()
    }

    /// Unbinds the session's database.
    pub fn db_close(&mut self) -> ProtocolResult<()> {
        self.begin(opcode::DB_CLOSE)?;
        self.finish()
    }

    /// Whether the session's database exists.
    pub fn db_exist(&mut self) -> ProtocolResult<bool> {
        self.begin(opcode::DB_EXIST)?;
        self.finish()?;
        Ok(self.channel.read_byte()? != 0)
    }

    /// Adds a physical cluster; returns its id.
    pub fn cluster_physical_add(
        &mut self,
        name: &str,
        file_name: Option<&str>,
        start_size: i32,
    ) -> ProtocolResult<ClusterId> {
        self.begin(opcode::CLUSTER_PHYSICAL_ADD)?;
        self.channel.write_string(Some(name))?;
        self.channel.write_string(file_name)?;
        self.channel.write_int(start_size)?;
        self.finish()?;
        self.channel.read_short()
    }

    /// Adds a logical cluster; returns its id and the descriptor record id.
    pub fn cluster_logical_add(
        &mut self,
        name: &str,
        container_id: i32,
    ) -> ProtocolResult<(ClusterId, RecordId)> {
        self.begin(opcode::CLUSTER_LOGICAL_ADD)?;
        self.channel.write_string(Some(name))?;
        self.channel.write_int(container_id)?;
        self.finish()?;
        let id = self.channel.read_short()?;
        let rid = self.channel.read_required_string("container rid")?;
        let rid = rid.parse().map_err(|_| ProtocolError::InvalidRecordId(rid))?;
        Ok((id, rid))
    }

    /// Number of records over the given clusters.
    pub fn cluster_count(&mut self, ids: &[ClusterId]) -> ProtocolResult<i64> {
        let count = i16::try_from(ids.len())
            .map_err(|_| ProtocolError::InvalidLength { len: i32::MAX })?;
        self.begin(opcode::CLUSTER_COUNT)?;
        self.channel.write_short(count)?;
        for id in ids {
            self.channel.write_short(*id)?;
        }
        self.finish()?;
        self.channel.read_long()
    }

    /// Loads a record; `None` when it does not exist.
    pub fn record_load(&mut self, id: RecordId) -> ProtocolResult<Option<Record>> {
        self.begin(opcode::RECORD_LOAD)?;
        self.channel.write_short(id.cluster_id)?;
        self.channel.write_long(id.position)?;
        self.finish()?;
        if self.channel.read_byte()? == 0 {
            return Ok(None);
        }
        let content = self.channel.read_bytes()?.unwrap_or_default();
        let version = self.channel.read_int()?;
        let record_type = read_record_type(&mut self.channel)?;
        Ok(Some(Record::new(id, version, record_type, content)))
    }

    /// Creates a record; returns its position.
    pub fn record_create(
        &mut self,
        cluster_id: ClusterId,
        content: &[u8],
        record_type: RecordType,
    ) -> ProtocolResult<i64> {
        self.begin(opcode::RECORD_CREATE)?;
        self.channel.write_short(cluster_id)?;
        self.channel.write_bytes(Some(content))?;
        self.channel.write_byte(record_type.as_byte())?;
        self.finish()?;
        self.channel.read_long()
    }

    /// Updates a record; returns its new version.
    pub fn record_update(
        &mut self,
        id: RecordId,
        content: &[u8],
        expected_version: i32,
        record_type: RecordType,
    ) -> ProtocolResult<i32> {
        self.begin(opcode::RECORD_UPDATE)?;
        self.channel.write_short(id.cluster_id)?;
        self.channel.write_long(id.position)?;
        self.channel.write_bytes(Some(content))?;
        self.channel.write_int(expected_version)?;
        self.channel.write_byte(record_type.as_byte())?;
        self.finish()?;
        self.channel.read_int()
    }

    /// Deletes a record.
    pub fn record_delete(&mut self, id: RecordId, expected_version: i32) -> ProtocolResult<()> {
        self.begin(opcode::RECORD_DELETE)?;
        self.channel.write_short(id.cluster_id)?;
        self.channel.write_long(id.position)?;
        self.channel.write_int(expected_version)?;
        self.finish()
    }

    /// Number of records in a named cluster.
    pub fn count(&mut self, cluster_name: &str) -> ProtocolResult<i64> {
        self.begin(opcode::COUNT)?;
        self.channel.write_string(Some(cluster_name))?;
        self.finish()?;
        self.channel.read_long()
    }

    /// Runs a command and reads its single result.
    pub fn command(&mut self, request: &CommandRequest) -> ProtocolResult<CommandResult> {
        self.send_command(CommandMode::Sync, request)?;
        match self.channel.read_byte()? {
            RESULT_NULL => {
                self.channel.read_bytes()?;
                Ok(CommandResult::Null)
            }
            RESULT_RECORD => Ok(read_record(&mut self.channel)?
                .map_or(CommandResult::Null, CommandResult::Record)),
            RESULT_VALUE => {
                let bytes = self.channel.read_required_bytes("command value")?;
                Ok(CommandResult::Value(CommandValue::decode(&bytes)?))
            }
            other => Err(ProtocolError::UnexpectedStatus(other)),
        }
    }

    /// Runs a command and collects its streamed records.
    pub fn command_async(&mut self, request: &CommandRequest) -> ProtocolResult<Vec<Record>> {
        self.send_command(CommandMode::Async, request)?;
        let mut records = Vec::new();
        loop {
            match self.channel.read_byte()? {
                STREAM_END => return Ok(records),
                STREAM_RECORD => {
                    if let Some(record) = read_record(&mut self.channel)? {
                        records.push(record);
                    }
                }
                other => return Err(ProtocolError::UnexpectedStatus(other)),
            }
        }
    }

    /// Record bound to a dictionary key.
    pub fn dictionary_lookup(&mut self, key: &str) -> ProtocolResult<Option<Record>> {
        self.begin(opcode::DICTIONARY_LOOKUP)?;
        self.channel.write_string(Some(key))?;
        self.finish()?;
        read_record(&mut self.channel)
    }

    /// Binds a key to a record; returns the record previously bound.
    pub fn dictionary_put(
        &mut self,
        key: &str,
        record_type: RecordType,
        id: RecordId,
    ) -> ProtocolResult<Option<Record>> {
        self.begin(opcode::DICTIONARY_PUT)?;
        self.channel.write_string(Some(key))?;
        self.channel.write_byte(record_type.as_byte())?;
        self.channel.write_string(Some(&id.to_string()))?;
        self.finish()?;
        read_record(&mut self.channel)
    }

    /// Unbinds a key; returns the record it was bound to.
    pub fn dictionary_remove(&mut self, key: &str) -> ProtocolResult<Option<Record>> {
        self.begin(opcode::DICTIONARY_REMOVE)?;
        self.channel.write_string(Some(key))?;
        self.finish()?;
        read_record(&mut self.channel)
    }

    /// Number of dictionary keys.
    pub fn dictionary_size(&mut self) -> ProtocolResult<i32> {
        self.begin(opcode::DICTIONARY_SIZE)?;
        self.finish()?;
        self.channel.read_int()
    }

    /// All dictionary keys.
    pub fn dictionary_keys(&mut self) -> ProtocolResult<Vec<String>> {
        self.begin(opcode::DICTIONARY_KEYS)?;
        self.finish()?;
        let count = self.channel.read_int()?;
        let mut keys = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
        for _ in 0..count {
            keys.push(self.channel.read_required_string("dictionary key")?);
        }
        Ok(keys)
    }

    /// Commits a batch.
    pub fn tx_commit(
        &mut self,
        client_tx_id: i32,
        entries: &[TxEntry],
    ) -> ProtocolResult<CommitOutcome> {
        self.begin(opcode::TX_COMMIT)?;
        write_transaction(&mut self.channel, client_tx_id, entries)?;
        self.finish()?;

        let created_count = self.channel.read_int()?;
        let mut created = Vec::new();
        for _ in 0..created_count {
            let temporary = self.read_rid()?;
            let assigned = self.read_rid()?;
            created.push((temporary, assigned));
        }
        let updated_count = self.channel.read_int()?;
        let mut updated = Vec::new();
        for _ in 0..updated_count {
            let id = self.read_rid()?;
            updated.push((id, self.channel.read_int()?));
        }
        Ok(CommitOutcome {
            client_tx_id,
            created,
            updated,
            deleted: entries
                .iter()
                .filter(|entry| entry.status == TxStatus::Deleted)
                .count(),
        })
    }

    /// Sends raw bytes as a request and reads the status; used to exercise
    /// server behaviour with hand-built requests.
    pub fn raw_request(&mut self, bytes: &[u8]) -> ProtocolResult<()> {
        for byte in bytes {
            self.channel.write_byte(*byte)?;
        }
        self.finish()
    }

    /// The underlying channel.
    pub fn channel(&mut self) -> &mut dyn Channel {
        &mut self.channel
    }

    fn send_command(&mut self, mode: CommandMode, request: &CommandRequest) -> ProtocolResult<()> {
        let payload = request.encode()?;
        self.begin(opcode::COMMAND)?;
        self.channel.write_byte(mode.as_byte())?;
        self.channel.write_bytes(Some(&payload))?;
        self.finish()
    }

    fn read_rid(&mut self) -> ProtocolResult<RecordId> {
        let cluster_id = self.channel.read_short()?;
        let position = self.channel.read_long()?;
        Ok(RecordId::new(cluster_id, position))
    }

    fn begin(&mut self, code: u8) -> ProtocolResult<()> {
        self.channel.write_byte(code)
    }

    /// Flushes the request and reads the status byte, turning an error
    /// envelope into [`ProtocolError::Remote`].
    fn finish(&mut self) -> ProtocolResult<()> {
        self.channel.flush()?;
        match self.channel.read_byte()? {
            opcode::STATUS_OK => Ok(()),
            opcode::STATUS_ERROR => {
                let category = self.channel.read_string()?;
                let message = self.channel.read_string()?;
                Err(ProtocolError::Remote { category, message })
            }
            other => Err(ProtocolError::UnexpectedStatus(other)),
        }
    }
}

impl<R: InputSource, W: Write> std::fmt::Debug for RemoteClient<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("channel", &self.channel)
            .finish()
    }
}
