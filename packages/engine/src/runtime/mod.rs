// packages/engine/src/runtime/mod.rs
//! Kernel execution runtime
//!
//! This module provides the process and concurrency layers of the engine:
//!
//! - **Kernel Process**: spawn, ready handshake, frame I/O, termination
//! - **Session**: concurrent request/response multiplexing over one kernel
//! - **Pending Queue**: FIFO correlation of responses to requests
//! - **Kernel Pool**: fixed set of sessions with least-loaded routing
//! - **Diagnostics**: captured stderr and exit classification
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                     KernelPool (N)                    │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐    │
//! │  │ AsyncSession│  │ AsyncSession│  │ AsyncSession│ ...│
//! │  │  writer ▼   │  │  writer ▼   │  │  writer ▼   │    │
//! │  │  kernel     │  │  kernel     │  │  kernel     │    │
//! │  │  reader ▲   │  │  reader ▲   │  │  reader ▲   │    │
//! │  └─────────────┘  └─────────────┘  └─────────────┘    │
//! │         ▲                ▲                ▲           │
//! │         └──── least-loaded selection ─────┘           │
//! │                          │                            │
//! │                concurrent evaluate calls              │
//! └───────────────────────────────────────────────────────┘
//! ```

pub mod diagnostics;
pub mod kernel_pool;
pub mod kernel_process;
pub mod pending;
pub mod selector;
pub mod session;
pub mod state;

// Re-export commonly used types
pub use diagnostics::{StderrLog, TerminationReason};
pub use kernel_pool::{parallel_evaluate, KernelPool, MemberStats, PoolMember, PoolStats};
pub use kernel_process::{FrameReader, FrameWriter, KernelProcess, SpawnConfig};
pub use session::{
    AsyncSession, EvaluationOutput, EvaluationResult, KernelFunction, PendingEvaluation,
    ResultShape, SessionInfo,
};
pub use state::SessionState;
