use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    #[error("stream name already exists: {0:?}")]
    Exists(String),

    #[error("no stream named {0:?}")]
    NotFound(String),

    #[error("stream id space exhausted")]
    NoMem,

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("byte source rejected seek to offset {0}")]
    Seek(u64),

    #[error("io error: {0}")]
    Io(String),

    #[error(
        "crc mismatch over unit at {unit_start}: stored {stored:#010x}, computed {computed:#010x}"
    )]
    CrcMismatch {
        unit_start: u64,
        stored: u32,
        computed: u32,
    },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// Malformed bytes encountered while decoding container structures.
///
/// The cursor catches most of these internally to drive resync; they surface
/// to callers only when no recovery is possible.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("varint truncated")]
    IntTruncated,

    #[error("varint exceeds 64 bits")]
    IntOverflow,

    #[error("frame length {0} exceeds the maximum payload")]
    OversizedLength(u64),

    #[error("unknown stream id {0}")]
    UnknownStream(u32),

    #[error("expected {expected} frame, found stream id {found}")]
    UnexpectedStream { expected: &'static str, found: u32 },

    #[error("unit ordinal went backwards: {previous} then {current}")]
    NonMonotonicUnit { previous: u64, current: u64 },

    #[error("malformed meta document: {0}")]
    Meta(&'static str),

    #[error("malformed index frame: {0}")]
    Index(&'static str),

    #[error("unexpected end of container")]
    UnexpectedEof,

    #[error("platform probe {0:02x?} is not a known byte order")]
    BadPlatformProbe([u8; 4]),
}
