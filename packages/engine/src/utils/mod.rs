// packages/engine/src/utils/mod.rs
//! Shared utilities: error taxonomy and layered configuration.

pub mod config;
pub mod errors;

pub use config::{EngineConfig, KernelConfig, LoggingConfig, PoolConfig, SessionConfig};
pub use errors::{EngineError, Result};
