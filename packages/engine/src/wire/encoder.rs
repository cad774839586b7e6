// packages/engine/src/wire/encoder.rs
//! Expression → bytes
//!
//! Pure and stateless; safe to call from any number of threads at once.

use crate::utils::errors::{EngineError, Result};
use crate::wire::expr::{Expr, NumericArray};
use crate::wire::token;
use crate::wire::varint::write_varint;
use bytes::{BufMut, Bytes, BytesMut};

/// Serialize one expression into a complete wire message
pub fn serialize(expr: &Expr) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(token::HEADER);
    write_expr(&mut buf, expr, 0)?;
    Ok(buf.freeze())
}

fn write_expr(buf: &mut BytesMut, expr: &Expr, depth: usize) -> Result<()> {
    if depth > token::MAX_DEPTH {
        return Err(EngineError::UnsupportedValue(format!(
            "expression nested deeper than {} levels",
            token::MAX_DEPTH
        )));
    }

    match expr {
        Expr::Integer(n) => write_integer(buf, *n),
        Expr::BigInteger(digits) => {
            if !is_integer_literal(digits) {
                return Err(EngineError::UnsupportedValue(format!(
                    "invalid big integer digits {:?}",
                    digits
                )));
            }
            write_text(buf, token::BIG_INTEGER, digits);
        }
        Expr::Real(x) => {
            if !x.is_finite() {
                return Err(EngineError::UnsupportedValue(format!(
                    "non-finite real {}",
                    x
                )));
            }
            buf.put_u8(token::REAL64);
            buf.put_f64_le(*x);
        }
        Expr::BigReal(text) => {
            if !is_real_literal(text) {
                return Err(EngineError::UnsupportedValue(format!(
                    "invalid big real literal {:?}",
                    text
                )));
            }
            write_text(buf, token::BIG_REAL, text);
        }
        Expr::String(s) => write_text(buf, token::STRING, s),
        Expr::Symbol(name) => {
            if name.is_empty() {
                return Err(EngineError::UnsupportedValue("empty symbol name".into()));
            }
            write_text(buf, token::SYMBOL, name);
        }
        Expr::Binary(bytes) => {
            buf.put_u8(token::BINARY_STRING);
            write_varint(buf, bytes.len() as u64);
            buf.put_slice(bytes);
        }
        Expr::Function(func) => {
            buf.put_u8(token::FUNCTION);
            write_varint(buf, func.args.len() as u64);
            write_expr(buf, &func.head, depth + 1)?;
            for arg in &func.args {
                write_expr(buf, arg, depth + 1)?;
            }
        }
        Expr::Association(rules) => {
            buf.put_u8(token::ASSOCIATION);
            write_varint(buf, rules.len() as u64);
            for rule in rules {
                buf.put_u8(if rule.delayed {
                    token::RULE_DELAYED
                } else {
                    token::RULE
                });
                write_expr(buf, &rule.key, depth + 1)?;
                write_expr(buf, &rule.value, depth + 1)?;
            }
        }
        Expr::PackedArray(array) => {
            if !array.kind.allowed_in_packed_array() {
                return Err(EngineError::UnsupportedValue(format!(
                    "packed arrays cannot hold {}",
                    array.kind.name()
                )));
            }
            write_array(buf, token::PACKED_ARRAY, array)?;
        }
        Expr::NumericArray(array) => write_array(buf, token::NUMERIC_ARRAY, array)?,
    }
    Ok(())
}

fn write_integer(buf: &mut BytesMut, n: i64) {
    if let Ok(v) = i8::try_from(n) {
        buf.put_u8(token::INTEGER8);
        buf.put_i8(v);
    } else if let Ok(v) = i16::try_from(n) {
        buf.put_u8(token::INTEGER16);
        buf.put_i16_le(v);
    } else if let Ok(v) = i32::try_from(n) {
        buf.put_u8(token::INTEGER32);
        buf.put_i32_le(v);
    } else {
        buf.put_u8(token::INTEGER64);
        buf.put_i64_le(n);
    }
}

fn write_text(buf: &mut BytesMut, tag: u8, text: &str) {
    buf.put_u8(tag);
    write_varint(buf, text.len() as u64);
    buf.put_slice(text.as_bytes());
}

fn write_array(buf: &mut BytesMut, tag: u8, array: &NumericArray) -> Result<()> {
    if array.dims.is_empty() {
        return Err(EngineError::UnsupportedValue(
            "array rank must be at least 1".into(),
        ));
    }
    let expected = array.expected_len().ok_or_else(|| {
        EngineError::UnsupportedValue(format!("array dimensions {:?} overflow", array.dims))
    })?;
    if expected != array.data.len() {
        return Err(EngineError::UnsupportedValue(format!(
            "{} array with dimensions {:?} needs {} bytes, got {}",
            array.kind.name(),
            array.dims,
            expected,
            array.data.len()
        )));
    }

    buf.put_u8(tag);
    buf.put_u8(array.kind.code());
    write_varint(buf, array.dims.len() as u64);
    for &dim in &array.dims {
        write_varint(buf, dim as u64);
    }
    buf.put_slice(&array.data);
    Ok(())
}

fn is_integer_literal(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_real_literal(text: &str) -> bool {
    text.bytes().any(|b| b.is_ascii_digit())
        && text
            .bytes()
            .all(|b| b.is_ascii_digit() || b"-+.`*^".contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::expr::ArrayKind;

    #[test]
    fn test_narrowest_integer_width() {
        assert_eq!(serialize(&Expr::Integer(5)).unwrap().as_ref(), b"8:C\x05");
        assert_eq!(serialize(&Expr::Integer(-129)).unwrap().as_ref(), b"8:j\x7f\xff");
        assert_eq!(
            serialize(&Expr::Integer(1 << 20)).unwrap().as_ref(),
            b"8:i\x00\x00\x10\x00"
        );
        assert_eq!(serialize(&Expr::Integer(i64::MIN)).unwrap()[2], token::INTEGER64);
    }

    #[test]
    fn test_function_layout() {
        let bytes = serialize(&Expr::apply("Range", [3])).unwrap();
        assert_eq!(bytes.as_ref(), b"8:f\x01s\x05RangeC\x03");
    }

    #[test]
    fn test_association_layout() {
        let expr = Expr::association([(Expr::from("a"), Expr::Integer(1))]);
        assert_eq!(serialize(&expr).unwrap().as_ref(), b"8:A\x01-S\x01aC\x01");
    }

    #[test]
    fn test_inconsistent_array_rejected() {
        let array = NumericArray::new(ArrayKind::Integer32, vec![2, 2], vec![0u8; 15]);
        let err = serialize(&Expr::NumericArray(array)).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedValue(_)));

        let rank0 = NumericArray::new(ArrayKind::Integer8, vec![], vec![1u8]);
        assert!(serialize(&Expr::NumericArray(rank0)).is_err());
    }

    #[test]
    fn test_unsigned_packed_array_rejected() {
        let array = NumericArray::new(ArrayKind::UnsignedInteger8, vec![2], vec![1u8, 2]);
        assert!(serialize(&Expr::PackedArray(array.clone())).is_err());
        assert!(serialize(&Expr::NumericArray(array)).is_ok());
    }

    #[test]
    fn test_invalid_atoms_rejected() {
        assert!(serialize(&Expr::Real(f64::NAN)).is_err());
        assert!(serialize(&Expr::Real(f64::INFINITY)).is_err());
        assert!(serialize(&Expr::BigInteger("12a".into())).is_err());
        assert!(serialize(&Expr::BigInteger("-".into())).is_err());
        assert!(serialize(&Expr::BigReal("1.5`20".into())).is_ok());
        assert!(serialize(&Expr::symbol("")).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let mut expr = Expr::Integer(0);
        for _ in 0..=token::MAX_DEPTH + 1 {
            expr = Expr::list([expr]);
        }
        assert!(matches!(
            serialize(&expr),
            Err(EngineError::UnsupportedValue(_))
        ));
    }
}
