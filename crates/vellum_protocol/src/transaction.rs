//! Streaming decoder for TX_COMMIT batches.
//!
//! ```text
//! clientTxId:i32 | entryCount:i32 | entry*
//! entry   := status:u8 | clusterId:i16 | body
//! CREATED := targetClusterName:string | content:bytes
//! UPDATED := position:i64 | expectedVersion:i32 | content:bytes
//! DELETED := position:i64 | expectedVersion:i32
//! ```
//!
//! Entries are decoded one at a time while the commit runs, so a batch is
//! never materialized in memory. The entry iterator owns the proxy and is
//! single-pass: once it has ended, or failed, it yields nothing more.

use crate::channel::Channel;
use crate::error::{ProtocolError, ProtocolResult};
use std::iter::FusedIterator;
use vellum_core::{RecordId, TxEntry, TxStatus};

/// A transaction whose header has been read from the channel.
pub struct TransactionProxy<'c> {
    channel: &'c mut dyn Channel,
    client_tx_id: i32,
    entry_count: usize,
}

impl<'c> TransactionProxy<'c> {
    /// Reads the batch header.
    ///
    /// # Errors
    ///
    /// A negative entry count, or a transport failure.
    pub fn begin(channel: &'c mut dyn Channel) -> ProtocolResult<Self> {
        let client_tx_id = channel.read_int()?;
        let count = channel.read_int()?;
        let entry_count = usize::try_from(count).map_err(|_| ProtocolError::NegativeEntryCount(count))?;
        Ok(Self {
            channel,
            client_tx_id,
            entry_count,
        })
    }

    /// Transaction id chosen by the client.
    #[must_use]
    pub const fn client_tx_id(&self) -> i32 {
        self.client_tx_id
    }

    /// Number of entries announced by the header.
    #[must_use]
    pub const fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Turns the proxy into its entry sequence.
    #[must_use]
    pub fn entries(self) -> TransactionEntries<'c> {
        TransactionEntries {
            proxy: self,
            consumed: 0,
            finished: false,
        }
    }
}

impl std::fmt::Debug for TransactionProxy<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionProxy")
            .field("client_tx_id", &self.client_tx_id)
            .field("entry_count", &self.entry_count)
            .finish_non_exhaustive()
    }
}

/// Lazy, forward-only sequence of the entries of one batch.
pub struct TransactionEntries<'c> {
    proxy: TransactionProxy<'c>,
    consumed: usize,
    finished: bool,
}

impl TransactionEntries<'_> {
    /// Transaction id chosen by the client.
    #[must_use]
    pub const fn client_tx_id(&self) -> i32 {
        self.proxy.client_tx_id
    }

    /// Entries decoded so far.
    #[must_use]
    pub const fn consumed(&self) -> usize {
        self.consumed
    }

    /// Entries announced but not decoded yet; 0 once the sequence has ended.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        if self.finished {
            0
        } else {
            self.proxy.entry_count - self.consumed
        }
    }

    /// Decodes and drops every unread entry, leaving the channel at the
    /// next request. Returns how many entries were skipped.
    ///
    /// # Errors
    ///
    /// The first decode or transport failure.
    pub fn skip_remaining(&mut self) -> ProtocolResult<usize> {
        let mut skipped = 0;
        while let Some(entry) = self.next() {
            entry?;
            skipped += 1;
        }
        Ok(skipped)
    }

    fn read_entry(&mut self) -> ProtocolResult<TxEntry> {
        let channel = &mut *self.proxy.channel;
        let tag = channel.read_byte()?;
        let status = TxStatus::from_byte(tag).ok_or(ProtocolError::UnknownTxStatus(tag))?;
        let cluster_id = channel.read_short()?;
        match status {
            TxStatus::Created => {
                let cluster_name = channel.read_string()?;
                let content = channel.read_required_bytes("record content")?;
                Ok(TxEntry::created(cluster_id, cluster_name, content))
            }
            TxStatus::Updated => {
                let position = channel.read_long()?;
                let expected_version = channel.read_int()?;
                let content = channel.read_required_bytes("record content")?;
                Ok(TxEntry::updated(
                    RecordId::new(cluster_id, position),
                    expected_version,
                    content,
                ))
            }
            TxStatus::Deleted => {
                let position = channel.read_long()?;
                let expected_version = channel.read_int()?;
                Ok(TxEntry::deleted(
                    RecordId::new(cluster_id, position),
                    expected_version,
                ))
            }
        }
    }
}

impl Iterator for TransactionEntries<'_> {
    type Item = ProtocolResult<TxEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.consumed == self.proxy.entry_count {
            self.finished = true;
            return None;
        }
        let entry = self.read_entry();
        match entry {
            Ok(_) => self.consumed += 1,
            Err(_) => self.finished = true,
        }
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining()))
    }
}

impl FusedIterator for TransactionEntries<'_> {}

impl std::fmt::Debug for TransactionEntries<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionEntries")
            .field("client_tx_id", &self.proxy.client_tx_id)
            .field("consumed", &self.consumed)
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Encodes a batch in the layout [`TransactionProxy`] reads.
///
/// # Errors
///
/// Transport failures, or a batch with more than `i32::MAX` entries.
pub fn write_transaction(
    channel: &mut dyn Channel,
    client_tx_id: i32,
    entries: &[TxEntry],
) -> ProtocolResult<()> {
    let count = i32::try_from(entries.len())
        .map_err(|_| ProtocolError::NegativeEntryCount(i32::MAX))?;
    channel.write_int(client_tx_id)?;
    channel.write_int(count)?;
    for entry in entries {
        channel.write_byte(entry.status.as_byte())?;
        channel.write_short(entry.id.cluster_id)?;
        match entry.status {
            TxStatus::Created => {
                channel.write_string(entry.cluster_name.as_deref())?;
                channel.write_bytes(Some(content_of(entry)))?;
            }
            TxStatus::Updated => {
                channel.write_long(entry.id.position)?;
                channel.write_int(entry.expected_version)?;
                channel.write_bytes(Some(content_of(entry)))?;
            }
            TxStatus::Deleted => {
                channel.write_long(entry.id.position)?;
                channel.write_int(entry.expected_version)?;
            }
        }
    }
    Ok(())
}

fn content_of(entry: &TxEntry) -> &[u8] {
    entry.content.as_deref().unwrap_or_default()
}
