// packages/engine/src/runtime/diagnostics.rs
//! Kernel diagnostics: captured stderr and exit classification
//!
//! Stderr is drained by its own task into a bounded ring so a chatty kernel
//! can never block the frame reader. When the ring is full the oldest line
//! is evicted. Failures raised by a session take the retained tail;
//! introspection only copies it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Lines retained per kernel by default
pub const DEFAULT_STDERR_CAPACITY: usize = 64;

/// Bounded stderr buffer
#[derive(Debug)]
pub struct StderrLog {
    /// Retained lines, oldest first
    lines: Mutex<VecDeque<String>>,
    capacity: usize,

    /// Lines received
    push_count: AtomicU64,

    /// Lines evicted to make room
    evict_count: AtomicU64,

    /// Set once the stream hit EOF
    closed: AtomicBool,
    closed_notify: Notify,
}

impl StderrLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            push_count: AtomicU64::new(0),
            evict_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        }
    }

    /// Called by the drain task when stderr reaches EOF
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.closed_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for the drain task to reach EOF, so the last
    /// lines a dying kernel wrote are included in its failure
    pub async fn settle(&self, timeout: Duration) {
        let notified = self.closed_notify.notified();
        if self.is_closed() {
            return;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
    }

    /// Record one line, evicting the oldest when full
    pub fn push(&self, line: String) {
        self.push_count.fetch_add(1, Ordering::Relaxed);
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
            self.evict_count.fetch_add(1, Ordering::Relaxed);
        }
        lines.push_back(line);
    }

    /// Remove and join everything retained so far
    pub fn take_tail(&self) -> String {
        let lines: Vec<String> = self.lines.lock().drain(..).collect();
        lines.join("\n")
    }

    /// Join everything retained so far, leaving it in place
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    pub fn stats(&self) -> StderrStats {
        StderrStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            evict_count: self.evict_count.load(Ordering::Relaxed),
            retained: self.len(),
            capacity: self.capacity,
        }
    }
}

impl Default for StderrLog {
    fn default() -> Self {
        Self::new(DEFAULT_STDERR_CAPACITY)
    }
}

/// Stderr buffer statistics
#[derive(Debug, Clone)]
pub struct StderrStats {
    pub push_count: u64,
    pub evict_count: u64,
    pub retained: usize,
    pub capacity: usize,
}

/// How a kernel process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Exited on its own after the graceful request
    Exited(i32),

    /// Ended by a signal during the graceful phase
    Signaled(i32),

    /// Needed SIGKILL after the grace period
    Killed,

    /// Still not reaped after the kill timeout
    Unreaped,

    /// Had already exited before termination began
    AlreadyExited(Option<i32>),
}

impl TerminationReason {
    /// Classify an exit status observed during the graceful phase
    pub fn from_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => TerminationReason::Exited(code),
            (None, Some(signal)) => TerminationReason::Signaled(signal),
            (None, None) => TerminationReason::Exited(-1),
        }
    }

    /// Whether the kernel left without being force-killed
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            TerminationReason::Exited(_)
                | TerminationReason::Signaled(_)
                | TerminationReason::AlreadyExited(_)
        )
    }

    pub fn description(&self) -> String {
        match self {
            TerminationReason::Exited(code) => format!("exited with code {}", code),
            TerminationReason::Signaled(signal) => format!("terminated by signal {}", signal),
            TerminationReason::Killed => "killed after grace period".to_string(),
            TerminationReason::Unreaped => "not reaped after kill".to_string(),
            TerminationReason::AlreadyExited(Some(code)) => {
                format!("had already exited with code {}", code)
            }
            TerminationReason::AlreadyExited(None) => "had already exited".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description())
    }
}
