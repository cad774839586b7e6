// packages/engine/src/wire/mod.rs
//! Binary exchange format
//!
//! - **Expr**: the closed set of values the format can carry
//! - **Encoder / Decoder**: pure `serialize` / `deserialize` pair
//! - **Frame**: stream framing over the kernel's stdio pipes
//! - **Envelope**: ready marker and response envelope conventions
//!
//! # Layout
//!
//! ```text
//! "8:"  expr
//!        ├─ 'C' i8 | 'j' i16 | 'i' i32 | 'L' i64 | 'r' f64   (little-endian)
//!        ├─ 'S' | 's' | 'B' | 'I' | 'R'  varint len, bytes
//!        ├─ 'f'  varint argc, head, args...
//!        ├─ 'A'  varint count, ('-' | ':') key value ...
//!        └─ 0xC1 | 0xC2  type, varint rank, varint dims..., data
//! ```

pub mod decoder;
pub mod encoder;
pub mod envelope;
pub mod expr;
pub mod frame;
pub mod token;
pub mod varint;

pub use decoder::{deserialize, frame_length};
pub use encoder::serialize;
pub use envelope::{KernelMessage, ResponseEnvelope, READY_SYMBOL};
pub use expr::{ArrayKind, Expr, Function, NumericArray, Rule};
pub use frame::FrameCodec;
