// packages/engine/src/utils/errors.rs
//! Error taxonomy for the evaluation engine
//!
//! Errors fall into three propagation classes:
//!
//! - **Request-local**: `UnsupportedValue`, `EvaluationTimeout`. Returned only
//!   to the caller that issued the request.
//! - **Session-fatal**: `StreamClosed`, `MalformedPayload`, `StartupTimeout`.
//!   Broadcast to every caller pending on the session, which is then marked
//!   crashed; later requests fail with `SessionUnavailable`. Requests issued
//!   against or outstanding during a terminate call get `SessionTerminated`.
//!   A pool reports a member's crash as `SessionUnavailable` with the cause
//!   attached.
//! - **Pool-level**: `PoolStartupFailed`, `PoolTerminationFailed`,
//!   `NoHealthyKernels`.

use crate::runtime::state::SessionState;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to spawn kernel process: {0}")]
    ProcessSpawnFailed(String),

    #[error("Kernel did not signal readiness within {timeout:?}{}", stderr_suffix(.stderr))]
    StartupTimeout { timeout: Duration, stderr: String },

    #[error("Kernel stream closed{}", stderr_suffix(.stderr))]
    StreamClosed { stderr: String },

    #[error("Session unavailable (state: {state}){}", cause_suffix(.cause))]
    SessionUnavailable {
        state: SessionState,
        cause: Option<Box<EngineError>>,
    },

    #[error("Session terminated")]
    SessionTerminated,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Unsupported value: {0}")]
    UnsupportedValue(String),

    #[error("Evaluation timed out after {0:?}")]
    EvaluationTimeout(Duration),

    #[error("Invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("Pool startup failed: {}", join_failures(.failures))]
    PoolStartupFailed { failures: Vec<(usize, EngineError)> },

    #[error("Pool termination failed: {}", join_failures(.failures))]
    PoolTerminationFailed { failures: Vec<(usize, EngineError)> },

    #[error("No healthy kernels left in pool")]
    NoHealthyKernels,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

impl EngineError {
    /// `SessionUnavailable` with no known cause
    pub fn unavailable(state: SessionState) -> Self {
        EngineError::SessionUnavailable { state, cause: None }
    }

    /// The failure that took the session down, if one was recorded
    pub fn crash_cause(&self) -> Option<&EngineError> {
        match self {
            EngineError::SessionUnavailable { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// True for errors that leave the originating session unusable
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::StreamClosed { .. }
                | EngineError::MalformedPayload(_)
                | EngineError::StartupTimeout { .. }
                | EngineError::SessionUnavailable { .. }
                | EngineError::SessionTerminated
        )
    }

    /// Copy handed to each caller a session-fatal error is broadcast to
    pub(crate) fn replicate(&self) -> EngineError {
        match self {
            EngineError::StreamClosed { stderr } => EngineError::StreamClosed {
                stderr: stderr.clone(),
            },
            EngineError::MalformedPayload(msg) => EngineError::MalformedPayload(msg.clone()),
            EngineError::StartupTimeout { timeout, stderr } => EngineError::StartupTimeout {
                timeout: *timeout,
                stderr: stderr.clone(),
            },
            EngineError::SessionUnavailable { state, cause } => EngineError::SessionUnavailable {
                state: *state,
                cause: cause.as_ref().map(|c| Box::new(c.replicate())),
            },
            EngineError::SessionTerminated => EngineError::SessionTerminated,
            EngineError::EvaluationTimeout(d) => EngineError::EvaluationTimeout(*d),
            other => EngineError::RuntimeError(other.to_string()),
        }
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!("; kernel stderr:\n{}", stderr)
    }
}

fn cause_suffix(cause: &Option<Box<EngineError>>) -> String {
    match cause {
        Some(cause) => format!(": {}", cause),
        None => String::new(),
    }
}

fn join_failures(failures: &[(usize, EngineError)]) -> String {
    failures
        .iter()
        .map(|(index, error)| format!("[kernel {}] {}", index, error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_closed_carries_stderr() {
        let err = EngineError::StreamClosed {
            stderr: "segmentation fault".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("stream closed"));
        assert!(msg.contains("segmentation fault"));

        let bare = EngineError::StreamClosed { stderr: String::new() };
        assert_eq!(bare.to_string(), "Kernel stream closed");
    }

    #[test]
    fn test_unavailable_shows_cause() {
        let bare = EngineError::unavailable(SessionState::NotStarted);
        assert_eq!(bare.to_string(), "Session unavailable (state: not-started)");
        assert!(bare.crash_cause().is_none());

        let crashed = EngineError::SessionUnavailable {
            state: SessionState::Crashed,
            cause: Some(Box::new(EngineError::StreamClosed {
                stderr: "out of memory".into(),
            })),
        };
        let msg = crashed.to_string();
        assert!(msg.starts_with("Session unavailable (state: crashed): Kernel stream closed"));
        assert!(msg.contains("out of memory"));
        assert!(crashed.is_session_fatal());
    }

    #[test]
    fn test_pool_startup_failed_lists_members() {
        let err = EngineError::PoolStartupFailed {
            failures: vec![
                (0, EngineError::ProcessSpawnFailed("no such file".into())),
                (2, EngineError::StartupTimeout {
                    timeout: Duration::from_secs(1),
                    stderr: String::new(),
                }),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("[kernel 0]"));
        assert!(msg.contains("[kernel 2]"));
        assert!(msg.contains("no such file"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::MalformedPayload("bad tag".into()).is_session_fatal());
        assert!(!EngineError::UnsupportedValue("rank 0".into()).is_session_fatal());
        assert!(!EngineError::EvaluationTimeout(Duration::from_millis(5)).is_session_fatal());
    }

    #[test]
    fn test_replicate_keeps_kind_and_detail() {
        let err = EngineError::StreamClosed {
            stderr: "core dumped".into(),
        };
        match err.replicate() {
            EngineError::StreamClosed { stderr } => assert_eq!(stderr, "core dumped"),
            other => panic!("unexpected {:?}", other),
        }

        let wrapped = EngineError::SessionUnavailable {
            state: SessionState::Crashed,
            cause: Some(Box::new(EngineError::MalformedPayload("bad tag".into()))),
        };
        match wrapped.replicate().crash_cause() {
            Some(EngineError::MalformedPayload(msg)) => assert_eq!(msg, "bad tag"),
            other => panic!("unexpected {:?}", other),
        }

        let io = EngineError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"));
        assert!(matches!(io.replicate(), EngineError::RuntimeError(_)));
    }
}
