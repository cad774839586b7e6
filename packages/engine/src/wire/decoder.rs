// packages/engine/src/wire/decoder.rs
//! Bytes → expression, and frame boundary detection
//!
//! The format is self-delimiting: every compound carries an element count
//! and every atom either has a fixed width or a length prefix. The same
//! reader therefore serves two callers:
//!
//! - [`deserialize`] builds the value from one complete message
//! - [`frame_length`] walks a possibly partial buffer without allocating and
//!   reports where the first message ends
//!
//! When the buffer is too short, [`scan_frame`] also reports a lower bound
//! on the message length, so a stream reader can skip rescanning until at
//! least that many bytes have arrived.

use crate::utils::errors::{EngineError, Result};
use crate::wire::expr::{ArrayKind, Expr, Function, NumericArray, Rule};
use crate::wire::token;
use crate::wire::varint::{read_varint, VarintRead};
use bytes::Bytes;

/// Smallest encoding of any element: a tag plus one byte
const MIN_ELEMENT_LEN: usize = 2;

/// Smallest encoding of an association entry: rule token, key, value
const MIN_RULE_LEN: usize = 1 + 2 * MIN_ELEMENT_LEN;

/// Why reading stopped
#[derive(Debug)]
enum ReadError {
    /// The buffer ends before the message does; the message is at least
    /// this many bytes long
    Incomplete(usize),
    /// The bytes can never form a valid message
    Malformed(String),
}

impl ReadError {
    /// Add what the enclosing structure still needs after the failed part
    fn needing(self, extra: usize) -> Self {
        match self {
            ReadError::Incomplete(min) => ReadError::Incomplete(min.saturating_add(extra)),
            other => other,
        }
    }
}

type ReadResult<T> = std::result::Result<T, ReadError>;

fn malformed<T>(message: impl Into<String>) -> ReadResult<T> {
    Err(ReadError::Malformed(message.into()))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> ReadResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(ReadError::Incomplete(self.pos.saturating_add(len)));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn byte(&mut self) -> ReadResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> ReadResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn length(&mut self) -> ReadResult<usize> {
        match read_varint(&self.buf[self.pos..]) {
            VarintRead::Value(value, used) => {
                self.pos += used;
                usize::try_from(value).or_else(|_| malformed(format!("length {} too large", value)))
            }
            VarintRead::Incomplete => Err(ReadError::Incomplete(self.buf.len() + 1)),
            VarintRead::Overlong => malformed("varint longer than 9 bytes"),
        }
    }

    fn header(&mut self) -> ReadResult<()> {
        let version = self.byte()?;
        if version != token::VERSION {
            return malformed(format!("unrecognized header byte 0x{:02x}", version));
        }
        match self.byte()? {
            token::SEPARATOR => Ok(()),
            token::COMPRESSED => malformed("compressed messages are not supported"),
            other => malformed(format!("unrecognized header byte 0x{:02x}", other)),
        }
    }

    fn text(&mut self) -> ReadResult<String> {
        let len = self.length()?;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).or_else(|e| malformed(format!("invalid UTF-8: {}", e)))
    }

    fn array_header(&mut self, tag: u8) -> ReadResult<(ArrayKind, Vec<usize>, usize)> {
        let code = self.byte()?;
        let kind = match ArrayKind::from_code(code) {
            Some(kind) => kind,
            None => return malformed(format!("unknown array element type {}", code)),
        };
        if tag == token::PACKED_ARRAY && !kind.allowed_in_packed_array() {
            return malformed(format!("packed array cannot hold {}", kind.name()));
        }

        let rank = self.length()?;
        if rank == 0 {
            return malformed("array rank 0");
        }
        // every dimension takes at least one byte
        if rank > self.remaining() {
            return if rank > token::MAX_DEPTH * 64 {
                malformed(format!("array rank {} too large", rank))
            } else {
                Err(ReadError::Incomplete(self.pos + rank))
            };
        }

        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            dims.push(self.length()?);
        }
        let byte_len = dims
            .iter()
            .try_fold(kind.width(), |acc, &d| acc.checked_mul(d));
        match byte_len {
            Some(len) => Ok((kind, dims, len)),
            None => malformed(format!("array dimensions {:?} overflow", dims)),
        }
    }

    fn check_depth(depth: usize) -> ReadResult<()> {
        if depth > token::MAX_DEPTH {
            return malformed(format!("nesting deeper than {} levels", token::MAX_DEPTH));
        }
        Ok(())
    }

    fn expr(&mut self, depth: usize) -> ReadResult<Expr> {
        Self::check_depth(depth)?;

        let tag = self.byte()?;
        let expr = match tag {
            token::INTEGER8 => Expr::Integer(i8::from_le_bytes(self.array()?) as i64),
            token::INTEGER16 => Expr::Integer(i16::from_le_bytes(self.array()?) as i64),
            token::INTEGER32 => Expr::Integer(i32::from_le_bytes(self.array()?) as i64),
            token::INTEGER64 => Expr::Integer(i64::from_le_bytes(self.array()?)),
            token::REAL64 => Expr::Real(f64::from_le_bytes(self.array()?)),
            token::BIG_INTEGER => Expr::BigInteger(self.text()?),
            token::BIG_REAL => Expr::BigReal(self.text()?),
            token::STRING => Expr::String(self.text()?),
            token::SYMBOL => Expr::Symbol(self.text()?),
            token::BINARY_STRING => {
                let len = self.length()?;
                Expr::Binary(Bytes::copy_from_slice(self.take(len)?))
            }
            token::FUNCTION => {
                let argc = self.length()?;
                let head = self.expr(depth + 1)?;
                let mut args = Vec::with_capacity(argc.min(self.remaining()));
                for _ in 0..argc {
                    args.push(self.expr(depth + 1)?);
                }
                Expr::Function(Function {
                    head: Box::new(head),
                    args,
                })
            }
            token::ASSOCIATION => {
                let count = self.length()?;
                let mut rules = Vec::with_capacity(count.min(self.remaining()));
                for _ in 0..count {
                    let delayed = match self.byte()? {
                        token::RULE => false,
                        token::RULE_DELAYED => true,
                        other => {
                            return malformed(format!(
                                "expected rule token, found 0x{:02x}",
                                other
                            ))
                        }
                    };
                    let key = self.expr(depth + 1)?;
                    let value = self.expr(depth + 1)?;
                    rules.push(Rule { key, value, delayed });
                }
                Expr::Association(rules)
            }
            token::PACKED_ARRAY | token::NUMERIC_ARRAY => {
                let (kind, dims, len) = self.array_header(tag)?;
                let array = NumericArray::new(kind, dims, Bytes::copy_from_slice(self.take(len)?));
                if tag == token::PACKED_ARRAY {
                    Expr::PackedArray(array)
                } else {
                    Expr::NumericArray(array)
                }
            }
            other => return malformed(format!("unknown type tag 0x{:02x}", other)),
        };
        Ok(expr)
    }

    fn skip_expr(&mut self, depth: usize) -> ReadResult<()> {
        Self::check_depth(depth)?;

        let tag = self.byte()?;
        match tag {
            token::INTEGER8 => self.take(1).map(drop),
            token::INTEGER16 => self.take(2).map(drop),
            token::INTEGER32 => self.take(4).map(drop),
            token::INTEGER64 | token::REAL64 => self.take(8).map(drop),
            token::BIG_INTEGER
            | token::BIG_REAL
            | token::STRING
            | token::SYMBOL
            | token::BINARY_STRING => {
                let len = self.length()?;
                self.take(len).map(drop)
            }
            token::FUNCTION => {
                let argc = self.length()?;
                self.skip_expr(depth + 1)
                    .map_err(|e| e.needing(argc.saturating_mul(MIN_ELEMENT_LEN)))?;
                for i in 0..argc {
                    let rest = argc - i - 1;
                    self.skip_expr(depth + 1)
                        .map_err(|e| e.needing(rest.saturating_mul(MIN_ELEMENT_LEN)))?;
                }
                Ok(())
            }
            token::ASSOCIATION => {
                let count = self.length()?;
                for i in 0..count {
                    let rest = (count - i - 1).saturating_mul(MIN_RULE_LEN);
                    match self
                        .byte()
                        .map_err(|e| e.needing(rest.saturating_add(2 * MIN_ELEMENT_LEN)))?
                    {
                        token::RULE | token::RULE_DELAYED => {}
                        other => {
                            return malformed(format!(
                                "expected rule token, found 0x{:02x}",
                                other
                            ))
                        }
                    }
                    self.skip_expr(depth + 1)
                        .map_err(|e| e.needing(rest.saturating_add(MIN_ELEMENT_LEN)))?;
                    self.skip_expr(depth + 1).map_err(|e| e.needing(rest))?;
                }
                Ok(())
            }
            token::PACKED_ARRAY | token::NUMERIC_ARRAY => {
                let (_, _, len) = self.array_header(tag)?;
                self.take(len).map(drop)
            }
            other => malformed(format!("unknown type tag 0x{:02x}", other)),
        }
    }
}

/// Decode one complete wire message
pub fn deserialize(bytes: &[u8]) -> Result<Expr> {
    let mut reader = Reader::new(bytes);
    let parsed = reader.header().and_then(|_| reader.expr(0));
    let expr = match parsed {
        Ok(expr) => expr,
        Err(ReadError::Incomplete(_)) => {
            return Err(EngineError::MalformedPayload(format!(
                "truncated message ({} bytes)",
                bytes.len()
            )))
        }
        Err(ReadError::Malformed(message)) => return Err(EngineError::MalformedPayload(message)),
    };

    if reader.remaining() != 0 {
        return Err(EngineError::MalformedPayload(format!(
            "{} trailing bytes after message",
            reader.remaining()
        )));
    }
    Ok(expr)
}

/// Outcome of scanning a buffer for the first message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameScan {
    /// The first message is this many bytes long
    Complete(usize),
    /// More input is needed; the message is at least `min_len` bytes
    Incomplete { min_len: usize },
}

/// Find where the first message in `bytes` ends
pub fn scan_frame(bytes: &[u8]) -> Result<FrameScan> {
    let mut reader = Reader::new(bytes);
    match reader.header().and_then(|_| reader.skip_expr(0)) {
        Ok(()) => Ok(FrameScan::Complete(reader.pos)),
        Err(ReadError::Incomplete(min_len)) => Ok(FrameScan::Incomplete {
            min_len: min_len.max(bytes.len() + 1),
        }),
        Err(ReadError::Malformed(message)) => Err(EngineError::MalformedPayload(message)),
    }
}

/// Length of the first complete message in `bytes`
///
/// `Ok(None)` means more input is needed.
pub fn frame_length(bytes: &[u8]) -> Result<Option<usize>> {
    match scan_frame(bytes)? {
        FrameScan::Complete(len) => Ok(Some(len)),
        FrameScan::Incomplete { .. } => Ok(None),
    }
}
