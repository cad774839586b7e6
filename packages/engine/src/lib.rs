// packages/engine/src/lib.rs
//! Kernel Evaluation Engine Library
//!
//! This library drives external symbolic-computation kernels over their
//! standard streams and evaluates expressions on them asynchronously.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **wire**: Expression model, binary codec, stream framing
//! - **runtime**: Kernel processes, sessions, pools
//! - **observability**: Tracing and metrics setup
//! - **utils**: Configuration and error taxonomy
//!
//! # Example
//!
//! ```no_run
//! use kernel_eval_engine::{AsyncSession, EngineConfig, Expr};
//!
//! # async fn run() -> kernel_eval_engine::Result<()> {
//! let config = EngineConfig::load()?;
//! let session = AsyncSession::launch(&config.kernel, config.session.clone()).await?;
//! let range = session.evaluate(Expr::apply("Range", [3])).await?;
//! assert_eq!(range, Expr::list([1, 2, 3]));
//! session.terminate().await?;
//! # Ok(())
//! # }
//! ```

// Public module exports
pub mod observability;
pub mod runtime;
pub mod utils;
pub mod wire;

// Re-export commonly used types
pub use runtime::kernel_pool::{parallel_evaluate, KernelPool};
pub use runtime::session::{AsyncSession, EvaluationResult, ResultShape};
pub use runtime::state::SessionState;
pub use utils::config::{EngineConfig, SessionConfig, STARTUP_READ_TIMEOUT, TERMINATE_READ_TIMEOUT};
pub use utils::errors::{EngineError, Result};
pub use wire::{deserialize, serialize, Expr};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}

impl std::fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, built {} with {})",
            self.version, self.git_hash, self.build_timestamp, self.rustc_version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_build_info() {
        let info = BuildInfo::current();
        assert!(!info.version.is_empty());
        assert!(info.to_string().starts_with(VERSION));
    }
}
