//! Record frame.
//!
//! ```text
//! classId:i16 | recordType:u8 | clusterId:i16 | position:i64 | version:i32 | content:bytes
//! ```
//!
//! A class id of [`RECORD_NULL`] stands for "no record" and ends the frame.

use crate::channel::Channel;
use crate::error::{ProtocolError, ProtocolResult};
use crate::opcode::{CLASS_NONE, RECORD_NULL};
use vellum_core::{Record, RecordId, RecordType};

/// Writes a record frame, or the null frame for `None`.
pub fn write_record(channel: &mut dyn Channel, record: Option<&Record>) -> ProtocolResult<()> {
    let Some(record) = record else {
        return channel.write_short(RECORD_NULL);
    };
    channel.write_short(CLASS_NONE)?;
    channel.write_byte(record.record_type.as_byte())?;
    channel.write_short(record.id.cluster_id)?;
    channel.write_long(record.id.position)?;
    channel.write_int(record.version)?;
    channel.write_bytes(Some(&record.content[..]))
}

/// Reads a record frame; `None` for the null frame.
pub fn read_record(channel: &mut dyn Channel) -> ProtocolResult<Option<Record>> {
    let class_id = channel.read_short()?;
    if class_id == RECORD_NULL {
        return Ok(None);
    }
    let tag = channel.read_byte()?;
    let record_type = RecordType::from_byte(tag).ok_or(ProtocolError::UnknownRecordType(tag))?;
    let cluster_id = channel.read_short()?;
    let position = channel.read_long()?;
    let version = channel.read_int()?;
    let content = channel.read_bytes()?.unwrap_or_default();
    Ok(Some(Record::new(
        RecordId::new(cluster_id, position),
        version,
        record_type,
        content,
    )))
}

/// Reads a record type tag.
pub fn read_record_type(channel: &mut dyn Channel) -> ProtocolResult<RecordType> {
    let tag = channel.read_byte()?;
    RecordType::from_byte(tag).ok_or(ProtocolError::UnknownRecordType(tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::WireChannel;
    use std::io::Cursor;

    #[test]
    fn frame_layout() {
        let record = Record::new(RecordId::new(3, 7), 2, RecordType::Bytes, b"xy".to_vec());
        let mut channel = WireChannel::new(&[][..], Vec::new());
        write_record(&mut channel, Some(&record)).unwrap();
        let bytes = channel.into_writer().unwrap();

        let mut expected = vec![0xFF, 0xFF, b'b', 0, 3];
        expected.extend_from_slice(&7i64.to_be_bytes());
        expected.extend_from_slice(&2i32.to_be_bytes());
        expected.extend_from_slice(&2i32.to_be_bytes());
        expected.extend_from_slice(b"xy");
        assert_eq!(bytes, expected);

        let mut channel = WireChannel::new(Cursor::new(bytes), Vec::new());
        assert_eq!(read_record(&mut channel).unwrap(), Some(record));
    }

    #[test]
    fn null_frame_is_two_bytes() {
        let mut channel = WireChannel::new(&[][..], Vec::new());
        write_record(&mut channel, None).unwrap();
        let bytes = channel.into_writer().unwrap();
        assert_eq!(bytes, vec![0xFF, 0xFE]);

        let mut channel = WireChannel::new(Cursor::new(bytes), Vec::new());
        assert_eq!(read_record(&mut channel).unwrap(), None);
    }

    #[test]
    fn unknown_type_tag() {
        let mut channel = WireChannel::new(Cursor::new(vec![b'z']), Vec::new());
        assert!(matches!(
            read_record_type(&mut channel),
            Err(ProtocolError::UnknownRecordType(b'z'))
        ));
    }
}
