//! Byte sinks for the writer.
//!
//! The writer never touches a file or socket itself; it hands every span of
//! encoded bytes to a [`FrameSink`] together with [`WriteFlags`] describing
//! the delivery (container start/stop, unit opening, flush requests). Any
//! error from the sink aborts the write and leaves the container in an
//! undefined state — callers are advised to stop and start over.

use std::io::Write;

use crate::error::Result;
use crate::format::WriteFlags;

/// Synchronous receiver of encoded container bytes.
pub trait FrameSink {
    fn write(&mut self, buf: &[u8], flags: WriteFlags) -> Result<()>;
}

impl<T: FrameSink + ?Sized> FrameSink for &mut T {
    fn write(&mut self, buf: &[u8], flags: WriteFlags) -> Result<()> {
        (**self).write(buf, flags)
    }
}

/// In-memory sink, used by tests and tooling.
#[derive(Debug, Clone, Default)]
pub struct VecSink {
    bytes: Vec<u8>,
}

impl VecSink {
    pub fn new() -> VecSink {
        VecSink::default()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl FrameSink for VecSink {
    fn write(&mut self, buf: &[u8], _flags: WriteFlags) -> Result<()> {
        self.bytes.extend_from_slice(buf);
        Ok(())
    }
}

/// Adapter over any [`std::io::Write`]; honors [`WriteFlags::FLUSH`].
#[derive(Debug)]
pub struct IoSink<W: Write> {
    inner: W,
}

impl<W: Write> IoSink<W> {
    pub fn new(inner: W) -> IoSink<W> {
        IoSink { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> FrameSink for IoSink<W> {
    fn write(&mut self, buf: &[u8], flags: WriteFlags) -> Result<()> {
        self.inner.write_all(buf)?;
        if flags.contains(WriteFlags::FLUSH) {
            self.inner.flush()?;
        }
        Ok(())
    }
}
