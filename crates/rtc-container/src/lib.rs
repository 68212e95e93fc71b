#![forbid(unsafe_code)]

//! Ruler Trace Container: a self-describing, append-only binary container
//! for heterogeneous time-series streams.
//!
//! Data is laid out in two levels of aligned regions. A *unit* (1 MiB by
//! default) opens with a Marker frame — 1024 bytes of a single repeated
//! byte, recognizable from any file position — followed by an Index frame
//! (per-stream occurrence table), a Meta frame (the stream registry as a
//! relaxed-JSON document), and a Platform frame (byte-order probe), and
//! closes with a Crc frame covering the unit body. *Subunits* (128 KiB by
//! default) nest inside, each announced by a lowercase `index` frame
//! carrying occurrence deltas.
//!
//! This layout gives three properties:
//!
//! - any prefix of a container is readable, even with the trailer missing;
//! - a corrupted range is skipped by scanning to the next Marker;
//! - frames of one stream are found by id without scanning the whole file.
//!
//! The write side ([`Writer`]) emits through a caller-supplied
//! [`FrameSink`]; the read side ([`Reader`], [`Cursor`]) pulls from a
//! random-access [`ByteSource`]. Neither owns a thread or suspends.
//!
//! ```
//! use rtc_container::{MemSource, Params, Reader, StreamConfig, VecSink, Writer};
//!
//! # fn main() -> rtc_container::Result<()> {
//! let mut writer = Writer::start(VecSink::new(), Params::default())?;
//! let stdin = writer.create(StreamConfig::variable("stdin").with_cont())?;
//! writer.write(stdin, b"hello", false)?;
//! let bytes = writer.stop()?.into_bytes();
//!
//! let mut reader = Reader::new(MemSource::new(bytes));
//! let mut cursor = reader.cursor();
//! let frame = cursor.next_frame_of(stdin)?.expect("stream data");
//! assert_eq!(cursor.read_payload(&frame)?, b"hello");
//! # Ok(())
//! # }
//! ```

mod crc;
mod cursor;
mod error;
mod format;
mod meta;
mod reader;
mod sink;
mod source;
mod varint;
mod writer;

pub use crate::crc::{crc32, UnitDigest};
pub use crate::cursor::{Cursor, Frame, StreamDesc};
pub use crate::error::{Error, FormatError, Result};
pub use crate::format::{
    ByteOrder, FrameLength, StreamConfig, StreamId, WriteFlags, CRC_FRAME_SIZE, DEFAULT_SUBUNIT,
    DEFAULT_UNIT, MARKER_BLOCK, MARKER_BYTE, MARKER_FRAME_SIZE, MAX_PAYLOAD, MIN_UNIT_SIZE,
    PLATFORM_PROBE,
};
pub use crate::meta::{parse_document, MetaDocument, MetaEntry};
pub use crate::reader::Reader;
pub use crate::sink::{FrameSink, IoSink, VecSink};
pub use crate::source::{ByteSource, FileSource, MemSource};
pub use crate::writer::{Params, Writer};
