// packages/engine/src/wire/varint.rs
//! Variable-length unsigned integers
//!
//! Seven payload bits per byte, least significant group first; the high bit
//! marks continuation. Lengths never exceed 2^63 - 1, so at most nine bytes
//! are valid.

use bytes::BufMut;

/// Longest valid encoding in bytes
pub const MAX_VARINT_LEN: usize = 9;

/// Outcome of reading a varint from a possibly incomplete buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintRead {
    /// Decoded value and number of bytes consumed
    Value(u64, usize),
    /// Buffer ended inside the varint
    Incomplete,
    /// More than [`MAX_VARINT_LEN`] bytes
    Overlong,
}

pub fn write_varint<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn read_varint(bytes: &[u8]) -> VarintRead {
    let mut value: u64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return VarintRead::Overlong;
        }
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return VarintRead::Value(value, i + 1);
        }
    }
    if bytes.len() >= MAX_VARINT_LEN {
        VarintRead::Overlong
    } else {
        VarintRead::Incomplete
    }
}
