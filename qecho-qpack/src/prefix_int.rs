//! Prefix integer encoding per RFC 7541 Section 5.1.
//!
//! QPACK reuses HPACK's prefixed integers for indices, lengths, and counts.

use crate::error::{QpackError, Result};
use bytes::BytesMut;

/// Decode a prefix integer.
///
/// `prefix_bits` is the number of low bits of the first byte that belong to
/// the integer (1-8). Returns the value and the number of bytes consumed.
pub fn decode(data: &[u8], prefix_bits: u8) -> Result<(u64, usize)> {
    debug_assert!(prefix_bits >= 1 && prefix_bits <= 8);

    let first = *data.first().ok_or(QpackError::UnexpectedEof)?;
    let mask = if prefix_bits == 8 {
        0xff
    } else {
        (1u8 << prefix_bits) - 1
    };

    let mut value = u64::from(first & mask);
    if value < u64::from(mask) {
        return Ok((value, 1));
    }

    let mut shift = 0u32;
    let mut offset = 1;
    loop {
        let byte = *data.get(offset).ok_or(QpackError::UnexpectedEof)?;
        offset += 1;

        if shift >= 56 {
            return Err(QpackError::IntegerOverflow);
        }
        value = value
            .checked_add(u64::from(byte & 0x7f) << shift)
            .ok_or(QpackError::IntegerOverflow)?;
        shift += 7;

        if byte & 0x80 == 0 {
            return Ok((value, offset));
        }
    }
}

/// Encode a prefix integer into `buf`.
///
/// `flags` carries the instruction/pattern bits above the prefix and is OR-ed
/// into the first byte.
pub fn encode(value: u64, prefix_bits: u8, flags: u8, buf: &mut BytesMut) {
    debug_assert!(prefix_bits >= 1 && prefix_bits <= 8);

    let max_prefix = (1u64 << prefix_bits) - 1;
    if value < max_prefix {
        buf.extend_from_slice(&[flags | value as u8]);
        return;
    }

    buf.extend_from_slice(&[flags | max_prefix as u8]);
    let mut rest = value - max_prefix;
    while rest >= 128 {
        buf.extend_from_slice(&[0x80 | (rest & 0x7f) as u8]);
        rest >>= 7;
    }
    buf.extend_from_slice(&[rest as u8]);
}
