//! LEB128 variable-length unsigned integers.
//!
//! Each byte carries seven value bits in its low bits; the high bit is set
//! iff more bytes follow. Stream tags, frame lengths, and index entries are
//! all encoded this way.

use crate::error::FormatError;

/// Longest encoding of a 64-bit value.
pub const MAX_LEN: usize = 10;

/// Encode `value` into `buf`, returning the number of bytes written.
///
/// `buf` must be at least [`MAX_LEN`] bytes.
pub fn encode(mut value: u64, buf: &mut [u8]) -> usize {
    let mut len = 0;
    loop {
        let mut b = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            b |= 0x80;
        }
        buf[len] = b;
        len += 1;
        if value == 0 {
            return len;
        }
    }
}

/// Append the encoding of `value` to `out`.
pub fn encode_vec(value: u64, out: &mut Vec<u8>) {
    let mut buf = [0u8; MAX_LEN];
    let len = encode(value, &mut buf);
    out.extend_from_slice(&buf[..len]);
}

/// Number of bytes [`encode`] produces for `value`.
pub fn encoded_len(value: u64) -> usize {
    let bits = (64 - value.leading_zeros()) as usize;
    bits.div_ceil(7).max(1)
}

/// Decode a value from the front of `buf`, returning it and the number of
/// bytes consumed.
///
/// Fails with [`FormatError::IntTruncated`] if `buf` ends before a
/// terminating byte and [`FormatError::IntOverflow`] if the magnitude does
/// not fit in 64 bits (which is always the case once a tenth continuation
/// byte is seen).
pub fn decode(buf: &[u8]) -> Result<(u64, usize), FormatError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().take(MAX_LEN).enumerate() {
        let low = (b & 0x7f) as u64;
        if shift == 63 && low > 1 {
            return Err(FormatError::IntOverflow);
        }
        value |= low << shift;
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    if buf.len() >= MAX_LEN {
        Err(FormatError::IntOverflow)
    } else {
        Err(FormatError::IntTruncated)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn small_values_are_single_bytes() {
        let mut buf = [0u8; MAX_LEN];
        for v in 0..0x80u64 {
            assert_eq!(encode(v, &mut buf), 1);
            assert_eq!(buf[0] as u64, v);
        }
    }

    #[test]
    fn known_encodings() {
        let mut buf = [0u8; MAX_LEN];
        let len = encode(300, &mut buf);
        assert_eq!(&buf[..len], &[0xAC, 0x02]);

        let len = encode(u64::MAX, &mut buf);
        assert_eq!(len, MAX_LEN);
        assert_eq!(buf[MAX_LEN - 1], 0x01);
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert_eq!(decode(&[]), Err(FormatError::IntTruncated));
        assert_eq!(decode(&[0x80]), Err(FormatError::IntTruncated));
        assert_eq!(decode(&[0xFF, 0xFF]), Err(FormatError::IntTruncated));
    }

    #[test]
    fn overflow_is_rejected() {
        // Ten continuation bytes can never terminate a 64-bit value.
        assert_eq!(decode(&[0x80; 12]), Err(FormatError::IntOverflow));
        // A tenth byte may only contribute the single remaining bit.
        let mut buf = [0xFFu8; MAX_LEN];
        buf[MAX_LEN - 1] = 0x02;
        assert_eq!(decode(&buf), Err(FormatError::IntOverflow));
        buf[MAX_LEN - 1] = 0x01;
        assert_eq!(decode(&buf), Ok((u64::MAX, MAX_LEN)));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        assert_eq!(decode(&[0x05, 0xAA, 0xBB]), Ok((5, 1)));
    }

    proptest! {
        #[test]
        fn round_trip(value in any::<u64>()) {
            let mut buf = [0u8; MAX_LEN];
            let len = encode(value, &mut buf);
            prop_assert_eq!(len, encoded_len(value));
            prop_assert_eq!(decode(&buf[..len]), Ok((value, len)));
        }

        #[test]
        fn decode_is_total_on_long_inputs(bytes in prop::collection::vec(any::<u8>(), MAX_LEN..32)) {
            // Either a value within MAX_LEN bytes or an overflow; never a
            // truncation once MAX_LEN bytes are available.
            match decode(&bytes) {
                Ok((_, len)) => prop_assert!(len <= MAX_LEN),
                Err(e) => prop_assert_eq!(e, FormatError::IntOverflow),
            }
        }
    }
}
