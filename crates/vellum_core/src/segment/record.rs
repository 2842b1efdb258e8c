//! Segment record types.

use crate::cluster::ClusterKind;
use crate::error::{CoreError, CoreResult};
use crate::types::{ClusterId, RecordId, RecordType};
use bytes::Bytes;

const KIND_CLUSTER_ADDED: u8 = 1;
const KIND_RECORD_PUT: u8 = 2;
const KIND_RECORD_REMOVED: u8 = 3;
const KIND_DICTIONARY_PUT: u8 = 4;
const KIND_DICTIONARY_REMOVED: u8 = 5;

const CLUSTER_PHYSICAL: u8 = 0;
const CLUSTER_LOGICAL: u8 = 1;

const NO_STRING: u32 = u32::MAX;

/// One entry of the segment log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentRecord {
    /// A cluster was added to the directory.
    ClusterAdded {
        /// Assigned id.
        id: ClusterId,
        /// Cluster name.
        name: String,
        /// Storage kind.
        kind: ClusterKind,
    },
    /// A record was written at a physical position.
    RecordPut {
        /// Physical cluster and position.
        slot: RecordId,
        /// Cluster the record is addressed through.
        owner: ClusterId,
        /// Version after the write.
        version: i32,
        /// Content tag.
        record_type: RecordType,
        /// Content.
        content: Bytes,
    },
    /// The record at a physical position was removed.
    RecordRemoved {
        /// Physical cluster and position.
        slot: RecordId,
    },
    /// A dictionary key was bound.
    DictionaryPut {
        /// Key.
        key: String,
        /// Bound record.
        id: RecordId,
    },
    /// A dictionary key was dropped.
    DictionaryRemoved {
        /// Key.
        key: String,
    },
}

impl SegmentRecord {
    /// record_len (4) + kind (1)
    const HEADER_SIZE: usize = 5;
    /// CRC size.
    const CRC_SIZE: usize = 4;

    /// Encodes the record to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0; 4]);

        match self {
            Self::ClusterAdded { id, name, kind } => {
                buf.push(KIND_CLUSTER_ADDED);
                buf.extend_from_slice(&id.to_le_bytes());
                put_string(&mut buf, Some(name));
                match kind {
                    ClusterKind::Physical {
                        file_name,
                        start_size,
                    } => {
                        buf.push(CLUSTER_PHYSICAL);
                        put_string(&mut buf, file_name.as_deref());
                        buf.extend_from_slice(&start_size.to_le_bytes());
                    }
                    ClusterKind::Logical {
                        container_id,
                        descriptor,
                    } => {
                        buf.push(CLUSTER_LOGICAL);
                        buf.extend_from_slice(&container_id.to_le_bytes());
                        put_record_id(&mut buf, *descriptor);
                    }
                }
            }
            Self::RecordPut {
                slot,
                owner,
                version,
                record_type,
                content,
            } => {
                buf.push(KIND_RECORD_PUT);
                put_record_id(&mut buf, *slot);
                buf.extend_from_slice(&owner.to_le_bytes());
                buf.extend_from_slice(&version.to_le_bytes());
                buf.push(record_type.as_byte());
                buf.extend_from_slice(&(content.len() as u32).to_le_bytes());
                buf.extend_from_slice(content);
            }
            Self::RecordRemoved { slot } => {
                buf.push(KIND_RECORD_REMOVED);
                put_record_id(&mut buf, *slot);
            }
            Self::DictionaryPut { key, id } => {
                buf.push(KIND_DICTIONARY_PUT);
                put_string(&mut buf, Some(key));
                put_record_id(&mut buf, *id);
            }
            Self::DictionaryRemoved { key } => {
                buf.push(KIND_DICTIONARY_REMOVED);
                put_string(&mut buf, Some(key));
            }
        }

        let record_len = (buf.len() + Self::CRC_SIZE) as u32;
        buf[..4].copy_from_slice(&record_len.to_le_bytes());

        // CRC32 (over everything before it)
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        buf
    }

    /// Decodes one complete record.
    ///
    /// `data` must hold exactly the bytes of the record, length prefix
    /// and checksum included.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < Self::HEADER_SIZE + Self::CRC_SIZE {
            return Err(CoreError::segment_corruption("record too short"));
        }

        let record_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if record_len != data.len() {
            return Err(CoreError::segment_corruption(format!(
                "record length {record_len} does not match {} available bytes",
                data.len()
            )));
        }

        let body_end = record_len - Self::CRC_SIZE;
        let stored_crc = u32::from_le_bytes([
            data[body_end],
            data[body_end + 1],
            data[body_end + 2],
            data[body_end + 3],
        ]);
        let computed_crc = compute_crc32(&data[..body_end]);
        if stored_crc != computed_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let mut body = BodyReader::new(&data[Self::HEADER_SIZE..body_end]);
        let record = match data[4] {
            KIND_CLUSTER_ADDED => {
                let id = body.i16()?;
                let name = body
                    .string()?
                    .ok_or_else(|| CoreError::segment_corruption("cluster without a name"))?;
                let kind = match body.u8()? {
                    CLUSTER_PHYSICAL => ClusterKind::Physical {
                        file_name: body.string()?,
                        start_size: body.i32()?,
                    },
                    CLUSTER_LOGICAL => ClusterKind::Logical {
                        container_id: body.i16()?,
                        descriptor: body.record_id()?,
                    },
                    other => {
                        return Err(CoreError::segment_corruption(format!(
                            "unknown cluster kind {other}"
                        )))
                    }
                };
                Self::ClusterAdded { id, name, kind }
            }
            KIND_RECORD_PUT => {
                let slot = body.record_id()?;
                let owner = body.i16()?;
                let version = body.i32()?;
                let tag = body.u8()?;
                let record_type = RecordType::from_byte(tag).ok_or_else(|| {
                    CoreError::segment_corruption(format!("unknown record type {tag:#04x}"))
                })?;
                let len = body.u32()? as usize;
                let content = Bytes::copy_from_slice(body.take(len)?);
                Self::RecordPut {
                    slot,
                    owner,
                    version,
                    record_type,
                    content,
                }
            }
            KIND_RECORD_REMOVED => Self::RecordRemoved {
                slot: body.record_id()?,
            },
            KIND_DICTIONARY_PUT => {
                let key = body
                    .string()?
                    .ok_or_else(|| CoreError::segment_corruption("dictionary entry without key"))?;
                Self::DictionaryPut {
                    key,
                    id: body.record_id()?,
                }
            }
            KIND_DICTIONARY_REMOVED => Self::DictionaryRemoved {
                key: body
                    .string()?
                    .ok_or_else(|| CoreError::segment_corruption("dictionary entry without key"))?,
            },
            other => {
                return Err(CoreError::segment_corruption(format!(
                    "unknown record kind {other}"
                )))
            }
        };

        if !body.is_empty() {
            return Err(CoreError::segment_corruption("trailing bytes in record"));
        }
        Ok(record)
    }
}

fn put_string(buf: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(text) => {
            buf.extend_from_slice(&(text.len() as u32).to_le_bytes());
            buf.extend_from_slice(text.as_bytes());
        }
        None => buf.extend_from_slice(&NO_STRING.to_le_bytes()),
    }
}

fn put_record_id(buf: &mut Vec<u8>, id: RecordId) {
    buf.extend_from_slice(&id.cluster_id.to_le_bytes());
    buf.extend_from_slice(&id.position.to_le_bytes());
}

struct BodyReader<'a> {
    data: &'a [u8],
}

impl<'a> BodyReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        if self.data.len() < len {
            return Err(CoreError::segment_corruption("record body truncated"));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn i16(&mut self) -> CoreResult<i16> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> CoreResult<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> CoreResult<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn record_id(&mut self) -> CoreResult<RecordId> {
        let cluster_id = self.i16()?;
        let position = self.i64()?;
        Ok(RecordId::new(cluster_id, position))
    }

    fn string(&mut self) -> CoreResult<Option<String>> {
        let len = self.u32()?;
        if len == NO_STRING {
            return Ok(None);
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| CoreError::segment_corruption("string is not UTF-8"))
    }
}

/// Computes CRC32 checksum.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // Simple CRC32 implementation (IEEE polynomial)
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
