//! Wire-format constants and shared descriptor types.
//!
//! A container is a sequence of *units*: aligned regions that begin with a
//! Marker frame and end with a Crc frame. Inside a unit, *subunits* provide
//! a finer alignment, each announced by a lowercase `index` frame. All
//! integers on the wire are LEB128; multi-byte primitive payloads are in the
//! writer's native byte order, discoverable from the Platform frame.

use crate::varint;

/// Byte value repeated throughout a Marker payload (superscript 1 in
/// ISO-8859-1).
pub const MARKER_BYTE: u8 = 0xB9;

/// Length of a Marker payload. No other frame may carry a payload longer
/// than this, which is what makes Marker resync unambiguous.
pub const MARKER_BLOCK: usize = 1024;

/// Maximum payload of any frame.
pub const MAX_PAYLOAD: usize = MARKER_BLOCK;

/// Total size of a Marker frame: a one-byte header followed by the payload.
pub const MARKER_FRAME_SIZE: u64 = 1 + MARKER_BLOCK as u64;

/// Worst-case encoded frame header (tag plus optional length).
pub const MAX_HEADER_SIZE: usize = varint::MAX_LEN + 2;

/// Total size of a Crc frame: a one-byte header and a four-byte payload.
pub const CRC_FRAME_SIZE: u64 = 5;

/// Smallest permitted unit or subunit size.
pub const MIN_UNIT_SIZE: u64 = 64;

/// Default unit size (1 MiB).
pub const DEFAULT_UNIT: u64 = 1 << 20;

/// Default subunit size (128 KiB).
pub const DEFAULT_SUBUNIT: u64 = 1 << 17;

/// Value carried by the Platform frame, written in the host's byte order.
pub const PLATFORM_PROBE: u32 = 0x0102_0304;

/// Largest assignable stream id; the tag `(id << 1) | more` must stay
/// representable.
pub const MAX_STREAM_ID: u32 = u32::MAX >> 1;

/// Identity of a logical channel within a container.
///
/// Ids 0 through 8 are reserved for the built-in streams; user streams
/// start at [`StreamId::FIRST_USER`]. Once assigned, an id is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u32);

impl StreamId {
    pub const NOP: StreamId = StreamId(0);
    pub const PADDING: StreamId = StreamId(1);
    pub const MARKER: StreamId = StreamId(2);
    /// `"Index"`: the per-unit occurrence table.
    pub const INDEX: StreamId = StreamId(3);
    /// `"index"`: the per-subunit occurrence delta table.
    pub const SUBINDEX: StreamId = StreamId(4);
    /// `"Meta"`: the per-unit stream registry document.
    pub const META: StreamId = StreamId(5);
    /// `"meta"`: incremental registry additions, emitted mid-unit.
    pub const SUBMETA: StreamId = StreamId(6);
    pub const PLATFORM: StreamId = StreamId(7);
    pub const CRC: StreamId = StreamId(8);
    pub const FIRST_USER: StreamId = StreamId(9);

    pub fn is_builtin(self) -> bool {
        self.0 < Self::FIRST_USER.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Frame payload sizing for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLength {
    /// Every frame of the stream carries exactly this many payload bytes;
    /// the length field is omitted from the frame header.
    Fixed(u64),
    /// Each frame header carries an explicit payload length.
    Variable,
}

impl FrameLength {
    pub fn is_variable(self) -> bool {
        matches!(self, FrameLength::Variable)
    }

    pub fn fixed(self) -> Option<u64> {
        match self {
            FrameLength::Fixed(n) => Some(n),
            FrameLength::Variable => None,
        }
    }
}

/// Configuration of a stream, as supplied to `Writer::create` and as
/// recovered from Meta documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Unique name within the container.
    pub name: String,
    pub frame_length: FrameLength,
    /// Payload spans may be re-joined across frames (`more` chains cross
    /// frame and alignment boundaries).
    pub cont: bool,
    /// Free-form content descriptor (format/encoding), e.g. `"utf-8"`.
    pub content: Option<String>,
    /// Excluded from Meta listings.
    pub hidden: bool,
}

impl StreamConfig {
    pub fn variable(name: impl Into<String>) -> Self {
        StreamConfig {
            name: name.into(),
            frame_length: FrameLength::Variable,
            cont: false,
            content: None,
            hidden: false,
        }
    }

    pub fn fixed(name: impl Into<String>, length: u64) -> Self {
        StreamConfig {
            frame_length: FrameLength::Fixed(length),
            ..StreamConfig::variable(name)
        }
    }

    pub fn with_cont(mut self) -> Self {
        self.cont = true;
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// Descriptor table for the nine built-in streams, indexed by id.
pub fn builtin_streams() -> [StreamConfig; 9] {
    fn hidden(mut cfg: StreamConfig) -> StreamConfig {
        cfg.hidden = true;
        cfg
    }

    [
        hidden(StreamConfig::fixed("nop", 0)),
        hidden(StreamConfig::variable("padding")),
        hidden(StreamConfig::fixed("Marker", MARKER_BLOCK as u64)),
        StreamConfig::variable("Index").with_content("index"),
        StreamConfig::variable("index").with_content("index"),
        StreamConfig::variable("Meta").with_content("json"),
        hidden(StreamConfig::variable("meta").with_content("json")),
        StreamConfig::fixed("Platform", 4),
        StreamConfig::fixed("Crc", 4),
    ]
}

/// Flag bits passed to a [`FrameSink`](crate::FrameSink) alongside each
/// chunk of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteFlags(u8);

impl WriteFlags {
    pub const NONE: WriteFlags = WriteFlags(0);
    /// First delivery of the container.
    pub const START: WriteFlags = WriteFlags(1);
    /// Last delivery; always paired with an empty buffer.
    pub const STOP: WriteFlags = WriteFlags(2);
    /// This delivery opens a new unit.
    pub const NEW_UNIT: WriteFlags = WriteFlags(4);
    /// Buffered bytes should reach the medium.
    pub const FLUSH: WriteFlags = WriteFlags(8);

    pub fn contains(self, other: WriteFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitOr for WriteFlags {
    type Output = WriteFlags;

    fn bitor(self, rhs: WriteFlags) -> WriteFlags {
        WriteFlags(self.0 | rhs.0)
    }
}

/// Writer byte order discovered from a Platform frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> ByteOrder {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// Interpret a Platform payload.
    pub fn from_probe(bytes: [u8; 4]) -> Option<ByteOrder> {
        match bytes {
            [0x04, 0x03, 0x02, 0x01] => Some(ByteOrder::Little),
            [0x01, 0x02, 0x03, 0x04] => Some(ByteOrder::Big),
            _ => None,
        }
    }

    pub fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }
}
