//! Read side: random access over a [`ByteSource`].

use crate::crc::UnitDigest;
use crate::cursor::Cursor;
use crate::error::{FormatError, Result};
use crate::source::ByteSource;
use crate::varint;

/// Container reader. All traversal state lives in [`Cursor`]s; the reader
/// itself only provides positioned reads and range checksums.
#[derive(Debug)]
pub struct Reader<S: ByteSource> {
    source: S,
}

impl<S: ByteSource> Reader<S> {
    pub fn new(source: S) -> Reader<S> {
        Reader { source }
    }

    pub fn into_inner(self) -> S {
        self.source
    }

    pub fn len(&mut self) -> Result<u64> {
        self.source.len()
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        self.source.is_empty()
    }

    /// Read up to `buf.len()` bytes at `offset`; short only at the end of
    /// the source.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.source.read_at(offset, buf)
    }

    /// Read exactly `len` bytes at `offset`.
    pub fn read_exact_vec(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.read(offset, &mut buf)?;
        if n != len {
            return Err(FormatError::UnexpectedEof.into());
        }
        Ok(buf)
    }

    /// Decode a LEB128 integer at `offset`, returning the value and its
    /// encoded length.
    pub fn read_int(&mut self, offset: u64) -> Result<(u64, usize)> {
        let mut buf = [0u8; varint::MAX_LEN];
        let n = self.read(offset, &mut buf)?;
        Ok(varint::decode(&buf[..n])?)
    }

    /// CRC-32 over the byte range `[start, end)`, clamped to the source.
    pub fn crc(&mut self, start: u64, end: u64) -> Result<u32> {
        let mut digest = UnitDigest::new();
        if start >= end {
            return Ok(digest.value());
        }
        let mut buf = [0u8; 4096];
        let mut pos = start;
        while pos < end {
            let want = ((end - pos) as usize).min(buf.len());
            let n = self.read(pos, &mut buf[..want])?;
            if n == 0 {
                break;
            }
            digest.update(&buf[..n]);
            pos += n as u64;
        }
        Ok(digest.value())
    }

    /// Construct a cursor positioned at the start of the source.
    pub fn cursor(&mut self) -> Cursor<'_, S> {
        Cursor::new(self)
    }
}
