// packages/engine/src/runtime/kernel_pool.rs
//! Fixed-size pool of kernel sessions
//!
//! All members start together; a pool is never left half-started. Each
//! request goes to the least-loaded healthy member.
//!
//! # Architecture
//!
//! ```text
//! KernelPool
//! ├─ Selector: least-loaded, round-robin on ties
//! ├─ Member 0: AsyncSession + in-flight counter
//! ├─ Member 1: AsyncSession + in-flight counter
//! └─ ...
//! ```
//!
//! A member's load is the larger of the callers routed to it and the
//! requests its kernel still has to answer, so a request abandoned after a
//! timeout keeps counting until the kernel replies.
//!
//! A crashed member is skipped from then on and is not respawned; callers
//! watch [`KernelPool::healthy_count`] instead. Requests in flight on it fail
//! with `SessionUnavailable` carrying the crash cause.

use crate::observability::POOL_HEALTHY_MEMBERS;
use crate::runtime::selector::LeastLoaded;
use crate::runtime::session::{
    AsyncSession, EvaluationOutput, EvaluationResult, PendingEvaluation, ResultShape,
};
use crate::runtime::state::SessionState;
use crate::utils::config::{EngineConfig, KernelConfig, PoolConfig, SessionConfig};
use crate::utils::errors::{EngineError, Result};
use crate::wire::Expr;
use bytes::Bytes;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

/// One pool slot
pub struct PoolMember {
    /// Position in the pool
    pub index: usize,

    session: Arc<AsyncSession>,

    /// Requests routed here and not yet settled
    in_flight: AtomicUsize,

    /// Requests settled, successfully or not
    completed: AtomicU64,
}

impl PoolMember {
    fn new(index: usize, session: Arc<AsyncSession>) -> Self {
        Self {
            index,
            session,
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> &Arc<AsyncSession> {
        &self.session
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.session.is_healthy()
    }

    /// Requests written to the kernel and not yet answered, abandoned ones
    /// included
    pub fn outstanding(&self) -> usize {
        self.session.pending_count()
    }

    /// Selection input: `None` once the member can no longer serve
    fn load(&self) -> Option<usize> {
        if self.is_healthy() {
            Some(self.in_flight().max(self.outstanding()))
        } else {
            None
        }
    }
}

/// Keeps a member's in-flight count raised until the request settles
struct LoadGuard<'a> {
    member: &'a PoolMember,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.member.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.member.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-member counters
#[derive(Debug, Clone)]
pub struct MemberStats {
    pub index: usize,
    pub pid: Option<u32>,
    pub state: SessionState,
    pub in_flight: usize,
    /// Unanswered requests on the kernel, including abandoned ones
    pub outstanding: usize,
    pub completed: u64,
}

/// Pool-wide counters
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: usize,
    pub healthy: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub members: Vec<MemberStats>,
}

/// Kernel pool
pub struct KernelPool {
    members: Vec<PoolMember>,
    selector: LeastLoaded,
}

impl KernelPool {
    /// Start a pool on the current tokio runtime
    pub async fn start(
        kernel: &KernelConfig,
        pool: &PoolConfig,
        session: &SessionConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| EngineError::RuntimeError(format!("no tokio runtime: {}", e)))?;
        Self::start_with_runtime(kernel, pool, session, runtime).await
    }

    /// Start a pool from a loaded engine configuration
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::start(&config.kernel, &config.pool, &config.session).await
    }

    /// Start `pool.size` sessions on `runtime`
    ///
    /// If any member fails to start, the others are terminated and the
    /// failures are reported together as `PoolStartupFailed`.
    #[instrument(skip_all, fields(size = pool.size))]
    pub async fn start_with_runtime(
        kernel: &KernelConfig,
        pool: &PoolConfig,
        session: &SessionConfig,
        runtime: Handle,
    ) -> Result<Self> {
        if pool.size == 0 {
            return Err(EngineError::InvalidConfiguration(
                "pool size must be at least 1".into(),
            ));
        }

        info!("Starting kernel pool with {} members", pool.size);

        let sessions: Vec<_> = (0..pool.size)
            .map(|_| {
                Arc::new(AsyncSession::with_runtime(
                    kernel,
                    session.clone(),
                    runtime.clone(),
                ))
            })
            .collect();

        let outcomes = join_all(sessions.iter().map(|s| s.start())).await;

        let failures: Vec<(usize, EngineError)> = outcomes
            .into_iter()
            .enumerate()
            .filter_map(|(index, outcome)| outcome.err().map(|e| (index, e)))
            .collect();

        if !failures.is_empty() {
            warn!(
                failed = failures.len(),
                "Pool startup failed, terminating started members"
            );
            let shutdowns = join_all(sessions.iter().map(|s| s.terminate())).await;
            for (index, outcome) in shutdowns.into_iter().enumerate() {
                if let Err(e) = outcome {
                    warn!(index, "Failed to terminate member after startup failure: {}", e);
                }
            }
            return Err(EngineError::PoolStartupFailed { failures });
        }

        let members = sessions
            .into_iter()
            .enumerate()
            .map(|(index, session)| PoolMember::new(index, session))
            .collect();

        let pool = Self {
            members,
            selector: LeastLoaded::new(),
        };
        pool.report_health();
        info!("Kernel pool ready");
        Ok(pool)
    }

    /// Route one request to the least-loaded healthy member
    fn submit(
        &self,
        expr: &Expr,
        shape: ResultShape,
    ) -> Result<(PendingEvaluation, LoadGuard<'_>)> {
        // A member may crash between selection and submission; try the rest
        for _ in 0..self.members.len() {
            let index = self
                .selector
                .select(self.members.iter().map(PoolMember::load), |i| {
                    self.members[i].in_flight.fetch_add(1, Ordering::AcqRel);
                })
                .ok_or(EngineError::NoHealthyKernels)?;

            let member = &self.members[index];
            let guard = LoadGuard { member };

            match member.session.submit(expr, shape) {
                Ok(pending) => {
                    debug!(member = index, in_flight = member.in_flight(), "Request routed");
                    return Ok((pending, guard));
                }
                Err(e @ (EngineError::SessionUnavailable { .. } | EngineError::SessionTerminated)) => {
                    debug!(member = index, "Member unavailable, reselecting: {}", e);
                    drop(guard);
                    self.report_health();
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::NoHealthyKernels)
    }

    /// Evaluate with an explicit result shape and optional deadline
    pub async fn evaluate_shaped(
        &self,
        expr: &Expr,
        shape: ResultShape,
        deadline: Option<Duration>,
    ) -> Result<EvaluationOutput> {
        let (pending, guard) = self.submit(expr, shape)?;
        let pending = match deadline {
            Some(deadline) => pending.with_deadline(deadline),
            None => pending,
        };

        match pending.await {
            Ok(output) => Ok(output),
            Err(e) if e.is_session_fatal() => {
                self.report_health();
                let state = guard.member.session.state();
                match e {
                    EngineError::StreamClosed { .. } | EngineError::MalformedPayload(_)
                        if state == SessionState::Crashed =>
                    {
                        warn!(member = guard.member.index, "Request lost to crashed member: {}", e);
                        Err(EngineError::SessionUnavailable {
                            state,
                            cause: Some(Box::new(e)),
                        })
                    }
                    other => Err(other),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn evaluate(&self, expr: impl Into<Expr>) -> Result<Expr> {
        self.evaluate_shaped(&expr.into(), ResultShape::Decoded, None)
            .await?
            .into_value()
    }

    pub async fn evaluate_wxf(&self, expr: impl Into<Expr>) -> Result<Bytes> {
        self.evaluate_shaped(&expr.into(), ResultShape::Raw, None)
            .await?
            .into_raw()
    }

    pub async fn evaluate_wrap(&self, expr: impl Into<Expr>) -> Result<EvaluationResult> {
        self.evaluate_shaped(&expr.into(), ResultShape::Wrapped, None)
            .await?
            .into_wrapped()
    }

    pub async fn evaluate_with_timeout(
        &self,
        expr: impl Into<Expr>,
        deadline: Duration,
    ) -> Result<Expr> {
        self.evaluate_shaped(&expr.into(), ResultShape::Decoded, Some(deadline))
            .await?
            .into_value()
    }

    /// Evaluate every expression concurrently; results keep input order
    pub async fn evaluate_many<I>(&self, exprs: I) -> Vec<Result<Expr>>
    where
        I: IntoIterator,
        I::Item: Into<Expr>,
    {
        let exprs: Vec<Expr> = exprs.into_iter().map(Into::into).collect();
        join_all(exprs.iter().map(|expr| async move {
            self.evaluate_shaped(expr, ResultShape::Decoded, None)
                .await?
                .into_value()
        }))
        .await
    }

    /// Terminate every member concurrently
    ///
    /// All members are stopped even if some fail; failures are reported
    /// together as `PoolTerminationFailed`.
    #[instrument(skip(self), fields(size = self.members.len()))]
    pub async fn terminate(&self) -> Result<()> {
        info!("Terminating kernel pool");
        let outcomes = join_all(self.members.iter().map(|m| m.session.terminate())).await;

        let failures: Vec<(usize, EngineError)> = outcomes
            .into_iter()
            .enumerate()
            .filter_map(|(index, outcome)| outcome.err().map(|e| (index, e)))
            .collect();

        self.report_health();
        if failures.is_empty() {
            info!("Kernel pool terminated");
            Ok(())
        } else {
            Err(EngineError::PoolTerminationFailed { failures })
        }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Members still able to serve requests
    pub fn healthy_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_healthy()).count()
    }

    pub fn member_pids(&self) -> Vec<Option<u32>> {
        self.members.iter().map(|m| m.session.pid()).collect()
    }

    pub fn members(&self) -> &[PoolMember] {
        &self.members
    }

    pub fn stats(&self) -> PoolStats {
        let members: Vec<_> = self
            .members
            .iter()
            .map(|m| MemberStats {
                index: m.index,
                pid: m.session.pid(),
                state: m.session.state(),
                in_flight: m.in_flight(),
                outstanding: m.outstanding(),
                completed: m.completed.load(Ordering::Relaxed),
            })
            .collect();

        PoolStats {
            size: members.len(),
            healthy: members
                .iter()
                .filter(|m| m.state.accepts_requests())
                .count(),
            in_flight: members.iter().map(|m| m.in_flight).sum(),
            completed: members.iter().map(|m| m.completed).sum(),
            members,
        }
    }

    fn report_health(&self) {
        metrics::gauge!(POOL_HEALTHY_MEMBERS).set(self.healthy_count() as f64);
    }
}

impl std::fmt::Debug for KernelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelPool")
            .field("size", &self.members.len())
            .field("healthy", &self.healthy_count())
            .finish()
    }
}

/// Start a pool, evaluate `exprs` across it, then shut it down
///
/// Results keep input order. A failure to terminate is logged, not returned,
/// so the results are never lost.
pub async fn parallel_evaluate<I>(config: &EngineConfig, exprs: I) -> Result<Vec<Result<Expr>>>
where
    I: IntoIterator,
    I::Item: Into<Expr>,
{
    let pool = KernelPool::from_config(config).await?;
    let results = pool.evaluate_many(exprs).await;
    if let Err(e) = pool.terminate().await {
        warn!("Pool termination after parallel evaluation failed: {}", e);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_size_rejected() {
        let result = KernelPool::start(
            &KernelConfig::default(),
            &PoolConfig { size: 0 },
            &SessionConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(EngineError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_startup_failure_reports_every_member() {
        let kernel = KernelConfig {
            path: "/nonexistent/kernel-binary".into(),
            ..Default::default()
        };
        let result =
            KernelPool::start(&kernel, &PoolConfig { size: 3 }, &SessionConfig::default()).await;

        match result {
            Err(EngineError::PoolStartupFailed { failures }) => {
                let indices: Vec<_> = failures.iter().map(|(i, _)| *i).collect();
                assert_eq!(indices, vec![0, 1, 2]);
                assert!(failures
                    .iter()
                    .all(|(_, e)| matches!(e, EngineError::ProcessSpawnFailed(_))));
            }
            other => panic!("expected PoolStartupFailed, got {:?}", other.err()),
        }
    }
}
