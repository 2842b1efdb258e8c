//! Buffered wire channel.
//!
//! ## Encoding
//!
//! - integers are big-endian: `byte`, `short` (i16), `int` (i32), `long` (i64)
//! - `bytes` is an `int` length followed by that many bytes; `-1` means no
//!   value and `0` an empty one
//! - `string` is `bytes` holding UTF-8
//!
//! A length is checked against the channel limit before anything is
//! allocated for it. The body of a rejected operand is owed to the stream
//! and dropped by [`Channel::skip_rejected`].

use crate::error::{ProtocolError, ProtocolResult};
use std::io::{self, BufRead, BufReader, BufWriter, Cursor, Read, Write};
use std::net::TcpStream;

/// Default upper bound for a single `bytes`/`string` operand (64 MiB).
pub const DEFAULT_MAX_LENGTH: usize = 64 * 1024 * 1024;

/// A byte source that can drop whatever is readable without blocking.
///
/// Used after a failed request so the next request starts at a clean
/// boundary.
pub trait InputSource: Read {
    /// Discards bytes available right now; returns how many were dropped.
    fn drain_pending(&mut self) -> io::Result<u64>;
}

impl InputSource for TcpStream {
    fn drain_pending(&mut self) -> io::Result<u64> {
        self.set_nonblocking(true)?;
        let mut scratch = [0u8; 4096];
        let mut total = 0u64;
        let result = loop {
            match self.read(&mut scratch) {
                Ok(0) => break Ok(total),
                Ok(n) => total += n as u64,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(total),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => break Err(err),
            }
        };
        self.set_nonblocking(false)?;
        result
    }
}

impl<T: AsRef<[u8]>> InputSource for Cursor<T> {
    fn drain_pending(&mut self) -> io::Result<u64> {
        let len = self.get_ref().as_ref().len() as u64;
        let position = self.position().min(len);
        self.set_position(len);
        Ok(len - position)
    }
}

impl InputSource for &[u8] {
    fn drain_pending(&mut self) -> io::Result<u64> {
        let len = self.len();
        *self = &self[len..];
        Ok(len as u64)
    }
}

/// Primitive reads and writes of the wire encoding.
///
/// Object safe, so request handlers can work on `&mut dyn Channel`.
pub trait Channel {
    /// Reads one byte.
    fn read_byte(&mut self) -> ProtocolResult<u8>;
    /// Reads an `i16`.
    fn read_short(&mut self) -> ProtocolResult<i16>;
    /// Reads an `i32`.
    fn read_int(&mut self) -> ProtocolResult<i32>;
    /// Reads an `i64`.
    fn read_long(&mut self) -> ProtocolResult<i64>;
    /// Reads a length-prefixed byte array; `None` for the null marker.
    fn read_bytes(&mut self) -> ProtocolResult<Option<Vec<u8>>>;
    /// Reads a length-prefixed UTF-8 string; `None` for the null marker.
    fn read_string(&mut self) -> ProtocolResult<Option<String>>;

    /// Writes one byte.
    fn write_byte(&mut self, value: u8) -> ProtocolResult<()>;
    /// Writes an `i16`.
    fn write_short(&mut self, value: i16) -> ProtocolResult<()>;
    /// Writes an `i32`.
    fn write_int(&mut self, value: i32) -> ProtocolResult<()>;
    /// Writes an `i64`.
    fn write_long(&mut self, value: i64) -> ProtocolResult<()>;
    /// Writes a length-prefixed byte array, or the null marker.
    fn write_bytes(&mut self, value: Option<&[u8]>) -> ProtocolResult<()>;
    /// Writes a length-prefixed string, or the null marker.
    fn write_string(&mut self, value: Option<&str>) -> ProtocolResult<()>;

    /// Pushes buffered output to the transport.
    fn flush(&mut self) -> ProtocolResult<()>;

    /// Starts counting operands for a new request.
    fn begin_request(&mut self);

    /// Operands consumed since [`begin_request`](Self::begin_request), a
    /// rejected oversize operand included; `None` once a malformed length
    /// has left the position inside the request unknown.
    fn operands_read(&self) -> Option<usize>;

    /// Reads a `bytes`/`string` operand and drops its body, whatever its
    /// length.
    fn skip_bytes(&mut self) -> ProtocolResult<()>;

    /// Drops the body of an operand rejected for its length, blocking until
    /// all of it has arrived; returns the number of bytes dropped.
    fn skip_rejected(&mut self) -> ProtocolResult<u64>;

    /// Drops buffered input and whatever the transport can deliver without
    /// blocking; returns the number of bytes dropped.
    fn discard_input(&mut self) -> ProtocolResult<u64>;

    /// Reads a string that must not be null.
    fn read_required_string(&mut self, what: &'static str) -> ProtocolResult<String> {
        self.read_string()?.ok_or(ProtocolError::MissingValue(what))
    }

    /// Reads a byte array that must not be null.
    fn read_required_bytes(&mut self, what: &'static str) -> ProtocolResult<Vec<u8>> {
        self.read_bytes()?.ok_or(ProtocolError::MissingValue(what))
    }

    /// Writes an `int` count followed by each string.
    fn write_string_collection(&mut self, values: &[String]) -> ProtocolResult<()> {
        let count = i32::try_from(values.len()).map_err(|_| ProtocolError::LengthTooLarge {
            len: i32::MAX,
            max: values.len(),
        })?;
        self.write_int(count)?;
        for value in values {
            self.write_string(Some(value))?;
        }
        Ok(())
    }
}

/// [`Channel`] over a buffered reader/writer pair.
pub struct WireChannel<R: Read, W: Write> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
    max_length: usize,
    operands: Option<usize>,
    owed: u64,
}

impl<R: Read, W: Write> WireChannel<R, W> {
    /// Creates a channel with the default length limit.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            max_length: DEFAULT_MAX_LENGTH,
            operands: Some(0),
            owed: 0,
        }
    }

    /// Sets the largest accepted `bytes`/`string` length.
    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Largest accepted `bytes`/`string` length.
    #[must_use]
    pub const fn max_length(&self) -> usize {
        self.max_length
    }

    /// The underlying reader.
    pub fn get_ref(&self) -> &R {
        self.reader.get_ref()
    }

    /// Flushes and returns the writer.
    pub fn into_writer(self) -> ProtocolResult<W> {
        self.writer
            .into_inner()
            .map_err(|err| ProtocolError::Io(err.into_error()))
    }

    /// Flushes pending output and releases the channel.
    pub fn close(mut self) -> ProtocolResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> ProtocolResult<[u8; N]> {
        let mut buf = [0u8; N];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_operand<const N: usize>(&mut self) -> ProtocolResult<[u8; N]> {
        let buf = self.read_array()?;
        self.count_operand();
        Ok(buf)
    }

    fn count_operand(&mut self) {
        if let Some(count) = &mut self.operands {
            *count += 1;
        }
    }

    /// Reads a length prefix; `Ok(None)` is the null marker.
    fn read_prefix(&mut self) -> ProtocolResult<Option<usize>> {
        let len = i32::from_be_bytes(self.read_array()?);
        match len {
            -1 => Ok(None),
            len if len < -1 => {
                self.operands = None;
                Err(ProtocolError::InvalidLength { len })
            }
            len => Ok(Some(len as usize)),
        }
    }

    fn read_length(&mut self) -> ProtocolResult<Option<usize>> {
        let Some(size) = self.read_prefix()? else {
            return Ok(None);
        };
        if size > self.max_length {
            self.owed = size as u64;
            self.count_operand();
            return Err(ProtocolError::LengthTooLarge {
                len: i32::try_from(size).unwrap_or(i32::MAX),
                max: self.max_length,
            });
        }
        Ok(Some(size))
    }

    fn drop_exact(&mut self, len: u64) -> ProtocolResult<()> {
        let dropped = io::copy(&mut (&mut self.reader).take(len), &mut io::sink())?;
        if dropped < len {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }

    fn write_length(&mut self, len: usize) -> ProtocolResult<()> {
        let len = i32::try_from(len).map_err(|_| ProtocolError::LengthTooLarge {
            len: i32::MAX,
            max: self.max_length,
        })?;
        self.writer.write_all(&len.to_be_bytes())?;
        Ok(())
    }
}

impl<R: InputSource, W: Write> Channel for WireChannel<R, W> {
    fn read_byte(&mut self) -> ProtocolResult<u8> {
        Ok(self.read_operand::<1>()?[0])
    }

    fn read_short(&mut self) -> ProtocolResult<i16> {
        Ok(i16::from_be_bytes(self.read_operand()?))
    }

    fn read_int(&mut self) -> ProtocolResult<i32> {
        Ok(i32::from_be_bytes(self.read_operand()?))
    }

    fn read_long(&mut self) -> ProtocolResult<i64> {
        Ok(i64::from_be_bytes(self.read_operand()?))
    }

    fn read_bytes(&mut self) -> ProtocolResult<Option<Vec<u8>>> {
        let Some(len) = self.read_length()? else {
            self.count_operand();
            return Ok(None);
        };
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        self.count_operand();
        Ok(Some(buf))
    }

    fn read_string(&mut self) -> ProtocolResult<Option<String>> {
        match self.read_bytes()? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| ProtocolError::InvalidUtf8),
        }
    }

    fn write_byte(&mut self, value: u8) -> ProtocolResult<()> {
        self.writer.write_all(&[value])?;
        Ok(())
    }

    fn write_short(&mut self, value: i16) -> ProtocolResult<()> {
        self.writer.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    fn write_int(&mut self, value: i32) -> ProtocolResult<()> {
        self.writer.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    fn write_long(&mut self, value: i64) -> ProtocolResult<()> {
        self.writer.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, value: Option<&[u8]>) -> ProtocolResult<()> {
        match value {
            None => self.write_int(-1),
            Some(bytes) => {
                self.write_length(bytes.len())?;
                self.writer.write_all(bytes)?;
                Ok(())
            }
        }
    }

    fn write_string(&mut self, value: Option<&str>) -> ProtocolResult<()> {
        self.write_bytes(value.map(str::as_bytes))
    }

    fn flush(&mut self) -> ProtocolResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn begin_request(&mut self) {
        self.operands = Some(0);
        self.owed = 0;
    }

    fn operands_read(&self) -> Option<usize> {
        self.operands
    }

    fn skip_bytes(&mut self) -> ProtocolResult<()> {
        if let Some(len) = self.read_prefix()? {
            self.drop_exact(len as u64)?;
        }
        self.count_operand();
        Ok(())
    }

    fn skip_rejected(&mut self) -> ProtocolResult<u64> {
        let owed = std::mem::take(&mut self.owed);
        self.drop_exact(owed)?;
        Ok(owed)
    }

    fn discard_input(&mut self) -> ProtocolResult<u64> {
        let buffered = self.reader.buffer().len();
        self.reader.consume(buffered);
        let drained = self.reader.get_mut().drain_pending()?;
        Ok(buffered as u64 + drained)
    }
}

impl<R: Read, W: Write> std::fmt::Debug for WireChannel<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireChannel")
            .field("buffered_input", &self.reader.buffer().len())
            .field("buffered_output", &self.writer.buffer().len())
            .field("max_length", &self.max_length)
            .field("operands", &self.operands)
            .finish()
    }
}
