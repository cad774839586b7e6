// packages/engine/src/wire/envelope.rs
//! Conventions layered on top of plain messages
//!
//! - The kernel announces readiness with one frame holding [`READY_SYMBOL`].
//! - Each request is answered by one frame holding a response envelope:
//!
//! ```text
//! <|"Success" -> True | False,
//!   "Messages" -> {{tag, text}, ...},
//!   "Result" -> ByteArray[<message bytes of the result>]|>
//! ```
//!
//! Keeping the result as nested message bytes lets callers that only want
//! the encoded form receive it without a decode/re-encode pass.

use crate::utils::errors::{EngineError, Result};
use crate::wire::decoder::deserialize;
use crate::wire::encoder::serialize;
use crate::wire::expr::Expr;
use bytes::Bytes;

/// Symbol sent by a kernel once it accepts requests
pub const READY_SYMBOL: &str = "KernelLink`Ready";

const KEY_SUCCESS: &str = "Success";
const KEY_MESSAGES: &str = "Messages";
const KEY_RESULT: &str = "Result";

/// Encoded ready marker
pub fn ready_frame() -> Result<Bytes> {
    serialize(&Expr::symbol(READY_SYMBOL))
}

pub fn is_ready_marker(expr: &Expr) -> bool {
    matches!(expr, Expr::Symbol(name) if name == READY_SYMBOL)
}

/// A message the kernel emitted while evaluating, e.g. `Power::infy`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelMessage {
    pub tag: String,
    pub text: String,
}

impl KernelMessage {
    pub fn new(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            text: text.into(),
        }
    }
}

/// One response as sent by the kernel
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub success: bool,
    pub messages: Vec<KernelMessage>,
    /// Encoded result expression
    pub result: Bytes,
}

impl ResponseEnvelope {
    /// Successful response carrying `result`
    pub fn success(result: &Expr) -> Result<Self> {
        Ok(Self {
            success: true,
            messages: vec![],
            result: serialize(result)?,
        })
    }

    pub fn to_expr(&self) -> Expr {
        let messages = self
            .messages
            .iter()
            .map(|m| Expr::list([Expr::string(m.tag.clone()), Expr::string(m.text.clone())]));

        Expr::association([
            (Expr::from(KEY_SUCCESS), Expr::from(self.success)),
            (Expr::from(KEY_MESSAGES), Expr::list(messages)),
            (Expr::from(KEY_RESULT), Expr::Binary(self.result.clone())),
        ])
    }

    pub fn encode(&self) -> Result<Bytes> {
        serialize(&self.to_expr())
    }

    pub fn from_expr(expr: &Expr) -> Result<Self> {
        let field = |key: &str| {
            expr.lookup(&Expr::from(key)).ok_or_else(|| {
                EngineError::MalformedPayload(format!("response envelope lacks \"{}\"", key))
            })
        };

        let success = match field(KEY_SUCCESS)? {
            Expr::Symbol(s) if s == "True" => true,
            Expr::Symbol(s) if s == "False" => false,
            other => {
                return Err(EngineError::MalformedPayload(format!(
                    "envelope Success must be True or False, got {}",
                    other
                )))
            }
        };

        let messages = field(KEY_MESSAGES)?
            .as_list()
            .ok_or_else(|| EngineError::MalformedPayload("envelope Messages is not a list".into()))?
            .iter()
            .map(|entry| match entry.as_list() {
                Some([Expr::String(tag), Expr::String(text)]) => Ok(KernelMessage::new(
                    tag.clone(),
                    text.clone(),
                )),
                _ => Err(EngineError::MalformedPayload(format!(
                    "envelope message entry {} is not {{tag, text}}",
                    entry
                ))),
            })
            .collect::<Result<Vec<_>>>()?;

        let result = match field(KEY_RESULT)? {
            Expr::Binary(bytes) => bytes.clone(),
            other => {
                return Err(EngineError::MalformedPayload(format!(
                    "envelope Result must be a byte string, got {}",
                    other
                )))
            }
        };

        Ok(Self {
            success,
            messages,
            result,
        })
    }

    /// Parse a response frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        Self::from_expr(&deserialize(frame)?)
    }

    /// Decode the nested result expression
    pub fn result_expr(&self) -> Result<Expr> {
        deserialize(&self.result)
    }
}
