//! Random-access byte sources for the reader.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Error, Result};

/// A random-access view of container bytes.
///
/// Reads may return fewer bytes than requested only at the end of the
/// source; a zero return means `offset` is at or past the end.
pub trait ByteSource {
    /// Current length in bytes.
    fn len(&mut self) -> Result<u64>;

    fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read up to `buf.len()` bytes at `offset`, returning how many were
    /// available.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

impl<T: ByteSource + ?Sized> ByteSource for &mut T {
    fn len(&mut self) -> Result<u64> {
        (**self).len()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        (**self).read_at(offset, buf)
    }
}

/// In-memory source, used by tests and tooling.
#[derive(Debug, Clone, Default)]
pub struct MemSource {
    data: Vec<u8>,
}

impl MemSource {
    pub fn new(data: Vec<u8>) -> MemSource {
        MemSource { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemSource {
    fn from(data: Vec<u8>) -> MemSource {
        MemSource::new(data)
    }
}

impl From<&[u8]> for MemSource {
    fn from(data: &[u8]) -> MemSource {
        MemSource::new(data.to_vec())
    }
}

impl ByteSource for MemSource {
    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}

/// File-backed source.
#[derive(Debug)]
pub struct FileSource {
    file: File,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<FileSource> {
        Ok(FileSource {
            file: File::open(path)?,
        })
    }

    pub fn from_file(file: File) -> FileSource {
        FileSource { file }
    }
}

impl ByteSource for FileSource {
    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|_| Error::Seek(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_source_short_reads_at_end() {
        let mut src = MemSource::from(&b"hello"[..]);
        let mut buf = [0u8; 8];
        assert_eq!(src.read_at(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(src.read_at(3, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(src.read_at(5, &mut buf).unwrap(), 0);
        assert_eq!(src.read_at(u64::MAX, &mut buf).unwrap(), 0);
    }
}
