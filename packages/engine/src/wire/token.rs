// packages/engine/src/wire/token.rs
//! Wire tokens of the binary exchange format

/// Uncompressed format header: version 8, separator `:`
pub const HEADER: &[u8] = b"8:";

/// Version byte
pub const VERSION: u8 = b'8';

/// Marks a zlib-compressed body (`8C:`)
pub const COMPRESSED: u8 = b'C';

pub const SEPARATOR: u8 = b':';

pub const FUNCTION: u8 = b'f';
pub const SYMBOL: u8 = b's';
pub const STRING: u8 = b'S';
pub const BINARY_STRING: u8 = b'B';
pub const INTEGER8: u8 = b'C';
pub const INTEGER16: u8 = b'j';
pub const INTEGER32: u8 = b'i';
pub const INTEGER64: u8 = b'L';
pub const REAL64: u8 = b'r';
pub const BIG_INTEGER: u8 = b'I';
pub const BIG_REAL: u8 = b'R';
pub const ASSOCIATION: u8 = b'A';
pub const RULE: u8 = b'-';
pub const RULE_DELAYED: u8 = b':';
pub const PACKED_ARRAY: u8 = 0xC1;
pub const NUMERIC_ARRAY: u8 = 0xC2;

/// Deepest nesting accepted in either direction
pub const MAX_DEPTH: usize = 1024;
