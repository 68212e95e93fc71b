//! Unit checksums.
//!
//! CRC-32 with polynomial 0x04C11DB7 (reflected), initial value 0xFFFFFFFF
//! and final XOR 0xFFFFFFFF — the parameters `crc32fast` implements. A unit
//! digest covers every byte from just after the Marker payload up to, but
//! excluding, the Crc frame's own payload.

/// One-shot CRC over a byte slice.
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Running digest for the unit currently being written or verified.
#[derive(Debug, Clone, Default)]
pub struct UnitDigest {
    hasher: crc32fast::Hasher,
}

impl UnitDigest {
    pub fn new() -> UnitDigest {
        UnitDigest::default()
    }

    pub fn reset(&mut self) {
        self.hasher = crc32fast::Hasher::new();
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Current value; the digest can keep accumulating afterwards.
    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}
