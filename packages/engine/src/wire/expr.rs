// packages/engine/src/wire/expr.rs
//! Expression values exchanged with the kernel
//!
//! The variant set is closed: everything the wire format can carry has a
//! variant here, and nothing else does.

use bytes::Bytes;
use std::fmt;

/// A symbolic expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Machine-size integer
    Integer(i64),

    /// Arbitrary-precision integer as decimal digits, optionally signed
    BigInteger(String),

    /// IEEE-754 double
    Real(f64),

    /// Arbitrary-precision real in the kernel's textual notation
    BigReal(String),

    /// Text string
    String(String),

    /// Symbol name, possibly context-qualified (`` System`List ``)
    Symbol(String),

    /// Exact byte string
    Binary(Bytes),

    /// Headed sequence `head[args...]`
    Function(Function),

    /// Ordered key/value association
    Association(Vec<Rule>),

    /// Rectangular array of machine numbers
    PackedArray(NumericArray),

    /// Rectangular array with an explicit element type
    NumericArray(NumericArray),
}

/// `head[args...]`
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub head: Box<Expr>,
    pub args: Vec<Expr>,
}

/// One association entry; `delayed` selects `:>` over `->`
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub key: Expr,
    pub value: Expr,
    pub delayed: bool,
}

/// Element type of packed and numeric arrays, with its wire code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ArrayKind {
    Integer8 = 0,
    Integer16 = 1,
    Integer32 = 2,
    Integer64 = 3,
    UnsignedInteger8 = 16,
    UnsignedInteger16 = 17,
    UnsignedInteger32 = 18,
    UnsignedInteger64 = 19,
    Real32 = 34,
    Real64 = 35,
    ComplexReal32 = 51,
    ComplexReal64 = 52,
}

impl ArrayKind {
    pub fn from_code(code: u8) -> Option<Self> {
        let kind = match code {
            0 => ArrayKind::Integer8,
            1 => ArrayKind::Integer16,
            2 => ArrayKind::Integer32,
            3 => ArrayKind::Integer64,
            16 => ArrayKind::UnsignedInteger8,
            17 => ArrayKind::UnsignedInteger16,
            18 => ArrayKind::UnsignedInteger32,
            19 => ArrayKind::UnsignedInteger64,
            34 => ArrayKind::Real32,
            35 => ArrayKind::Real64,
            51 => ArrayKind::ComplexReal32,
            52 => ArrayKind::ComplexReal64,
            _ => return None,
        };
        Some(kind)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Bytes per element
    pub fn width(self) -> usize {
        match self {
            ArrayKind::Integer8 | ArrayKind::UnsignedInteger8 => 1,
            ArrayKind::Integer16 | ArrayKind::UnsignedInteger16 => 2,
            ArrayKind::Integer32 | ArrayKind::UnsignedInteger32 | ArrayKind::Real32 => 4,
            ArrayKind::Integer64
            | ArrayKind::UnsignedInteger64
            | ArrayKind::Real64
            | ArrayKind::ComplexReal32 => 8,
            ArrayKind::ComplexReal64 => 16,
        }
    }

    /// Packed arrays have no unsigned element types
    pub fn allowed_in_packed_array(self) -> bool {
        !matches!(
            self,
            ArrayKind::UnsignedInteger8
                | ArrayKind::UnsignedInteger16
                | ArrayKind::UnsignedInteger32
                | ArrayKind::UnsignedInteger64
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ArrayKind::Integer8 => "Integer8",
            ArrayKind::Integer16 => "Integer16",
            ArrayKind::Integer32 => "Integer32",
            ArrayKind::Integer64 => "Integer64",
            ArrayKind::UnsignedInteger8 => "UnsignedInteger8",
            ArrayKind::UnsignedInteger16 => "UnsignedInteger16",
            ArrayKind::UnsignedInteger32 => "UnsignedInteger32",
            ArrayKind::UnsignedInteger64 => "UnsignedInteger64",
            ArrayKind::Real32 => "Real32",
            ArrayKind::Real64 => "Real64",
            ArrayKind::ComplexReal32 => "ComplexReal32",
            ArrayKind::ComplexReal64 => "ComplexReal64",
        }
    }
}

/// Raw little-endian array payload with its shape
#[derive(Debug, Clone, PartialEq)]
pub struct NumericArray {
    pub kind: ArrayKind,
    pub dims: Vec<usize>,
    pub data: Bytes,
}

impl NumericArray {
    /// Build without checking that `data` matches `dims`; the encoder does
    pub fn new(kind: ArrayKind, dims: Vec<usize>, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            dims,
            data: data.into(),
        }
    }

    /// One-dimensional Integer64 array
    pub fn from_i64s(values: &[i64]) -> Self {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(ArrayKind::Integer64, vec![values.len()], data)
    }

    /// One-dimensional Real64 array
    pub fn from_f64s(values: &[f64]) -> Self {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(ArrayKind::Real64, vec![values.len()], data)
    }

    /// Element count implied by `dims`, `None` on overflow
    pub fn element_count(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Byte length implied by `dims` and `kind`
    pub fn expected_len(&self) -> Option<usize> {
        self.element_count()?.checked_mul(self.kind.width())
    }
}

impl Expr {
    pub fn symbol(name: impl Into<String>) -> Self {
        Expr::Symbol(name.into())
    }

    pub fn string(text: impl Into<String>) -> Self {
        Expr::String(text.into())
    }

    /// `head[args...]` for an arbitrary head expression
    pub fn function<I>(head: impl Into<Expr>, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Expr>,
    {
        Expr::Function(Function {
            head: Box::new(head.into()),
            args: args.into_iter().map(Into::into).collect(),
        })
    }

    /// `name[args...]` with a symbol head
    pub fn apply<I>(name: &str, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Expr>,
    {
        Expr::function(Expr::symbol(name), args)
    }

    pub fn list<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Expr>,
    {
        Expr::apply("List", items)
    }

    pub fn association<I>(rules: I) -> Self
    where
        I: IntoIterator<Item = (Expr, Expr)>,
    {
        Expr::Association(
            rules
                .into_iter()
                .map(|(key, value)| Rule {
                    key,
                    value,
                    delayed: false,
                })
                .collect(),
        )
    }

    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Expr::Binary(bytes.into())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Expr::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Expr::Real(x) => Some(*x),
            Expr::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Expr::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Expr::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Expr::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Symbol name of the head, ignoring any context prefix
    pub fn head_name(&self) -> Option<&str> {
        let head = self.as_function()?.head.as_symbol()?;
        Some(head.rsplit('`').next().unwrap_or(head))
    }

    /// Arguments of `name[...]`, if this expression has that head
    pub fn args_of(&self, name: &str) -> Option<&[Expr]> {
        if self.head_name()? == name {
            self.as_function().map(|f| f.args.as_slice())
        } else {
            None
        }
    }

    /// Elements of a `List[...]`
    pub fn as_list(&self) -> Option<&[Expr]> {
        self.args_of("List")
    }

    pub fn is_symbol(&self, name: &str) -> bool {
        match self {
            Expr::Symbol(s) => s == name || s.rsplit('`').next() == Some(name),
            _ => false,
        }
    }

    /// Look up a key in an association
    pub fn lookup(&self, key: &Expr) -> Option<&Expr> {
        match self {
            Expr::Association(rules) => rules.iter().find(|r| &r.key == key).map(|r| &r.value),
            _ => None,
        }
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Expr::Integer(value)
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::Integer(value as i64)
    }
}

impl From<u32> for Expr {
    fn from(value: u32) -> Self {
        Expr::Integer(value as i64)
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Real(value)
    }
}

impl From<bool> for Expr {
    fn from(value: bool) -> Self {
        Expr::Symbol(if value { "True" } else { "False" }.to_string())
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Expr::String(value.to_string())
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Expr::String(value)
    }
}

impl<T: Into<Expr>> From<Vec<T>> for Expr {
    fn from(items: Vec<T>) -> Self {
        Expr::list(items)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Integer(n) => write!(f, "{}", n),
            Expr::BigInteger(digits) => f.write_str(digits),
            Expr::Real(x) => write!(f, "{:?}", x),
            Expr::BigReal(text) => f.write_str(text),
            Expr::String(s) => write!(f, "{:?}", s),
            Expr::Symbol(s) => f.write_str(s),
            Expr::Binary(bytes) => write!(f, "ByteArray[<{}>]", bytes.len()),
            Expr::Function(func) => {
                if func.head.is_symbol("List") {
                    f.write_str("{")?;
                    write_sequence(f, &func.args)?;
                    f.write_str("}")
                } else {
                    write!(f, "{}[", func.head)?;
                    write_sequence(f, &func.args)?;
                    f.write_str("]")
                }
            }
            Expr::Association(rules) => {
                f.write_str("<|")?;
                for (i, rule) in rules.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    let arrow = if rule.delayed { ":>" } else { "->" };
                    write!(f, "{} {} {}", rule.key, arrow, rule.value)?;
                }
                f.write_str("|>")
            }
            Expr::PackedArray(array) => {
                write!(f, "PackedArray[{}, {:?}]", array.kind.name(), array.dims)
            }
            Expr::NumericArray(array) => {
                write!(f, "NumericArray[{}, {:?}]", array.kind.name(), array.dims)
            }
        }
    }
}

fn write_sequence(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}
