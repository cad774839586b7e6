// packages/engine/src/runtime/session.rs
//! Concurrent evaluation session over one kernel
//!
//! Any number of callers can evaluate at once. Each request is encoded on
//! the caller's task, queued with its reply slot, and written by a single
//! writer task; a single read loop matches responses to requests in FIFO
//! order.
//!
//! # Architecture
//!
//! ```text
//!   caller ─┐                        ┌─► writer task ──► kernel stdin
//!   caller ─┼─► PendingQueue ────────┤
//!   caller ─┘    (slots + frames)    └─◄ read loop  ◄── kernel stdout
//!       ▲                                    │
//!       └──────────── oneshot reply ◄────────┘
//! ```
//!
//! A broken pipe, an early exit, or an unparseable envelope crashes the
//! session: every outstanding caller receives the failure and later
//! submissions fail with `SessionUnavailable`.
//!
//! `terminate` may be called at any point, including while `start` is still
//! waiting for the ready marker. It returns only once the kernel process
//! has been reaped.

use crate::observability::{
    EVALUATIONS_TOTAL, EVALUATION_SECONDS, SESSIONS_CRASHED_TOTAL, SESSIONS_STARTED_TOTAL,
};
use crate::runtime::diagnostics::{StderrLog, TerminationReason};
use crate::runtime::kernel_process::{FrameReader, FrameWriter, KernelProcess, SpawnConfig};
use crate::runtime::pending::{PendingQueue, PendingSlot};
use crate::runtime::state::{SessionState, StateCell};
use crate::utils::config::{KernelConfig, SessionConfig};
use crate::utils::errors::{EngineError, Result};
use crate::wire::{deserialize, serialize, Expr, KernelMessage, ResponseEnvelope};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};
use ulid::Ulid;

/// Wait after SIGKILL before giving up on reaping the kernel
pub const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Form in which a caller wants its result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Decoded expression
    Decoded,
    /// Encoded result bytes, untouched
    Raw,
    /// Decoded expression plus success flag and kernel messages
    Wrapped,
}

/// Expression together with what the kernel reported about it
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    /// False when the kernel emitted messages marking the evaluation failed
    pub success: bool,

    /// Messages emitted during evaluation
    pub messages: Vec<KernelMessage>,

    /// Decoded result
    pub result: Expr,

    /// Encoded result as received
    pub raw: Bytes,
}

impl EvaluationResult {
    /// The result expression, whether or not the evaluation succeeded
    pub fn get(&self) -> &Expr {
        if !self.success {
            for message in &self.messages {
                warn!("{}: {}", message.tag, message.text);
            }
        }
        &self.result
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn into_inner(self) -> Expr {
        self.result
    }
}

/// What a pending evaluation resolves to
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutput {
    Value(Expr),
    Raw(Bytes),
    Wrapped(EvaluationResult),
}

impl EvaluationOutput {
    pub fn shape(&self) -> ResultShape {
        match self {
            EvaluationOutput::Value(_) => ResultShape::Decoded,
            EvaluationOutput::Raw(_) => ResultShape::Raw,
            EvaluationOutput::Wrapped(_) => ResultShape::Wrapped,
        }
    }

    pub fn into_value(self) -> Result<Expr> {
        match self {
            EvaluationOutput::Value(expr) => Ok(expr),
            EvaluationOutput::Raw(bytes) => deserialize(&bytes),
            EvaluationOutput::Wrapped(wrapped) => Ok(wrapped.result),
        }
    }

    pub fn into_raw(self) -> Result<Bytes> {
        match self {
            EvaluationOutput::Value(expr) => serialize(&expr),
            EvaluationOutput::Raw(bytes) => Ok(bytes),
            EvaluationOutput::Wrapped(wrapped) => Ok(wrapped.raw),
        }
    }

    pub fn into_wrapped(self) -> Result<EvaluationResult> {
        match self {
            EvaluationOutput::Wrapped(wrapped) => Ok(wrapped),
            other => {
                let raw = other.clone().into_raw()?;
                Ok(EvaluationResult {
                    success: true,
                    messages: vec![],
                    result: other.into_value()?,
                    raw,
                })
            }
        }
    }
}

/// Handle to a submitted request
///
/// Awaiting it yields the response. Dropping it abandons the wait only; the
/// kernel still evaluates the request and its response is discarded.
#[must_use = "the request is sent either way; await the handle to get its result"]
pub struct PendingEvaluation {
    reply: oneshot::Receiver<Result<EvaluationOutput>>,
    deadline: Option<Duration>,
}

impl PendingEvaluation {
    /// Fail with `EvaluationTimeout` if no response arrives within `deadline`
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub async fn wait(self) -> Result<EvaluationOutput> {
        let PendingEvaluation { reply, deadline } = self;
        let reply = async move {
            match reply.await {
                Ok(outcome) => outcome,
                // slot dropped without an answer: the session went away
                Err(_) => Err(EngineError::SessionTerminated),
            }
        };

        match deadline {
            None => reply.await,
            Some(deadline) => match tokio::time::timeout(deadline, reply).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    metrics::counter!(EVALUATIONS_TOTAL, "outcome" => "timeout").increment(1);
                    Err(EngineError::EvaluationTimeout(deadline))
                }
            },
        }
    }
}

impl IntoFuture for PendingEvaluation {
    type Output = Result<EvaluationOutput>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

/// Snapshot of a session for logs and monitoring
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Ulid,
    pub pid: Option<u32>,
    pub state: SessionState,
    pub pending: usize,
    pub started_at: Option<DateTime<Utc>>,
}

struct Running {
    process: Option<KernelProcess>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    stderr: Arc<StderrLog>,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
}

/// One kernel, shared by any number of concurrent callers
pub struct AsyncSession {
    id: Ulid,
    spawn: SpawnConfig,
    config: SessionConfig,
    runtime: Handle,
    state: Arc<StateCell>,
    pending: Arc<PendingQueue>,
    running: Mutex<Option<Running>>,

    /// Calls to `start` still in progress
    starting: watch::Sender<usize>,
}

/// Counts one `start` call for as long as it runs
struct StartGuard<'a> {
    starting: &'a watch::Sender<usize>,
}

impl<'a> StartGuard<'a> {
    fn enter(starting: &'a watch::Sender<usize>) -> Self {
        starting.send_modify(|count| *count += 1);
        Self { starting }
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.starting
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

impl AsyncSession {
    /// Session for `kernel`, not yet started; background tasks run on the
    /// current tokio runtime
    pub fn new(kernel: &KernelConfig, config: SessionConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| EngineError::RuntimeError(format!("no tokio runtime: {}", e)))?;
        Ok(Self::with_runtime(kernel, config, runtime))
    }

    /// Session whose background tasks run on `runtime`
    pub fn with_runtime(kernel: &KernelConfig, config: SessionConfig, runtime: Handle) -> Self {
        let mut spawn = SpawnConfig::from(kernel);
        spawn.stderr_level = config.kernel_loglevel;

        let state = Arc::new(StateCell::new());
        let (starting, _) = watch::channel(0);
        Self {
            id: Ulid::new(),
            spawn,
            config,
            runtime,
            pending: Arc::new(PendingQueue::new(Arc::clone(&state))),
            state,
            running: Mutex::new(None),
            starting,
        }
    }

    /// Create and start in one step
    pub async fn launch(kernel: &KernelConfig, config: SessionConfig) -> Result<Arc<Self>> {
        let session = Arc::new(Self::new(kernel, config)?);
        session.start().await?;
        Ok(session)
    }

    /// Spawn the kernel and wait until it is ready
    ///
    /// On failure the session ends up `Crashed`. If `terminate` is called
    /// meanwhile, this returns `SessionTerminated` and leaves the process
    /// for `terminate` to reap.
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn start(&self) -> Result<()> {
        let _guard = StartGuard::enter(&self.starting);
        if self.pending.is_closed() {
            return Err(EngineError::SessionTerminated);
        }
        match self.state.transition(SessionState::Starting) {
            Ok(_) => {}
            Err(SessionState::Terminating | SessionState::Terminated) => {
                return Err(EngineError::SessionTerminated)
            }
            Err(actual) => {
                return Err(EngineError::InvalidState {
                    expected: SessionState::NotStarted,
                    actual,
                })
            }
        }

        let mut process = match KernelProcess::start(
            &self.spawn,
            self.config.startup_read_timeout,
            &self.runtime,
        )
        .await
        {
            Ok(process) => process,
            Err(e) => {
                warn!("Kernel failed to start: {}", e);
                // None: terminate closed the queue and finishes the shutdown
                if self.pending.close(SessionState::Crashed).is_some() {
                    metrics::counter!(SESSIONS_CRASHED_TOTAL).increment(1);
                }
                return Err(e);
            }
        };

        let (reader, writer) = match (process.take_reader(), process.take_writer()) {
            (Some(reader), Some(writer)) => (reader, writer),
            _ => {
                self.pending.close(SessionState::Crashed);
                self.reap(process).await;
                return Err(EngineError::RuntimeError("kernel streams unavailable".into()));
            }
        };

        let pid = process.pid();
        let stderr = process.stderr_log();
        let (outbound, inbound) = mpsc::unbounded_channel();
        if let Err(e) = self.pending.open(outbound) {
            info!(?pid, "Session terminated while starting");
            drop((reader, writer));
            self.store_running(Running {
                process: Some(process),
                reader: None,
                writer: None,
                stderr,
                pid,
                started_at: Utc::now(),
            });
            return Err(e);
        }

        let writer_task = self.runtime.spawn(write_loop(
            self.id,
            writer,
            inbound,
            Arc::clone(&self.pending),
        ));
        let reader_task = self
            .runtime
            .spawn(read_loop(self.id, reader, Arc::clone(&self.pending)));

        self.store_running(Running {
            process: Some(process),
            reader: Some(reader_task),
            writer: Some(writer_task),
            stderr,
            pid,
            started_at: Utc::now(),
        });

        if !self
            .state
            .compare_transition(SessionState::Starting, SessionState::Ready)
        {
            let actual = self.state.get();
            debug!(%actual, "Session closed before it became ready");
            return Err(match actual {
                SessionState::Crashed => EngineError::unavailable(actual),
                _ => EngineError::SessionTerminated,
            });
        }

        metrics::counter!(SESSIONS_STARTED_TOTAL).increment(1);
        info!(?pid, "Session ready");
        Ok(())
    }

    fn store_running(&self, running: Running) {
        *self.running.lock() = Some(running);
    }

    /// Queue `expr` for evaluation without waiting for the result
    ///
    /// Fails immediately with `UnsupportedValue` if `expr` cannot be
    /// encoded, `SessionTerminated` once `terminate` was called, or
    /// `SessionUnavailable` if the session is not ready.
    pub fn submit(&self, expr: &Expr, shape: ResultShape) -> Result<PendingEvaluation> {
        let frame = match serialize(expr) {
            Ok(frame) => frame,
            Err(e) => {
                metrics::counter!(EVALUATIONS_TOTAL, "outcome" => "rejected").increment(1);
                return Err(e);
            }
        };

        let (reply, receiver) = oneshot::channel();
        let depth = self.pending.push(frame, PendingSlot::new(shape, reply))?;
        trace!(session = %self.id, depth, "Request queued: {}", expr);

        Ok(PendingEvaluation {
            reply: receiver,
            deadline: None,
        })
    }

    /// Evaluate and decode the result
    pub async fn evaluate(&self, expr: impl Into<Expr>) -> Result<Expr> {
        self.submit(&expr.into(), ResultShape::Decoded)?
            .await?
            .into_value()
    }

    /// Evaluate and return the encoded result bytes
    pub async fn evaluate_wxf(&self, expr: impl Into<Expr>) -> Result<Bytes> {
        self.submit(&expr.into(), ResultShape::Raw)?.await?.into_raw()
    }

    /// Evaluate and return the result with the kernel's messages
    pub async fn evaluate_wrap(&self, expr: impl Into<Expr>) -> Result<EvaluationResult> {
        self.submit(&expr.into(), ResultShape::Wrapped)?
            .await?
            .into_wrapped()
    }

    /// Evaluate, giving up with `EvaluationTimeout` after `deadline`
    pub async fn evaluate_with_timeout(
        &self,
        expr: impl Into<Expr>,
        deadline: Duration,
    ) -> Result<Expr> {
        self.submit(&expr.into(), ResultShape::Decoded)?
            .with_deadline(deadline)
            .await?
            .into_value()
    }

    /// Callable wrapper evaluating `head[args...]`
    pub fn function(&self, head: impl Into<String>) -> KernelFunction<'_> {
        KernelFunction {
            session: self,
            head: Expr::symbol(head),
        }
    }

    /// Stop the kernel
    ///
    /// Outstanding requests fail with `SessionTerminated`. A `start` in
    /// progress is waited for, so the process it spawned is reaped before
    /// this returns. Returns how the process ended, or `None` if there was
    /// no process to stop. A crashed session stays `Crashed` but its
    /// process is still reaped.
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn terminate(&self) -> Result<Option<TerminationReason>> {
        if let Some(slots) = self.pending.close(SessionState::Terminating) {
            if !slots.is_empty() {
                debug!(count = slots.len(), "Failing outstanding requests");
            }
            for slot in slots {
                let _ = slot.reply.send(Err(EngineError::SessionTerminated));
            }
        }

        let mut starting = self.starting.subscribe();
        loop {
            let active = *starting.borrow_and_update();
            if active == 0 {
                break;
            }
            debug!(active, "Waiting for start to finish");
            // the sender lives in self and cannot close first
            if starting.changed().await.is_err() {
                break;
            }
        }

        self.shutdown().await
    }

    async fn shutdown(&self) -> Result<Option<TerminationReason>> {
        let running = {
            let mut guard = self.running.lock();
            guard.as_mut().map(|running| {
                (
                    running.reader.take(),
                    running.writer.take(),
                    running.process.take(),
                )
            })
        };

        let (reader, writer, process) = match running {
            Some(parts) => parts,
            None => {
                self.finish_termination();
                return Ok(None);
            }
        };

        if let Some(reader) = reader {
            reader.abort();
        }
        if let Some(writer) = writer {
            // closes the kernel's stdin
            writer.abort();
        }

        let reason = match process {
            Some(process) => self.reap(process).await,
            None => None,
        };
        self.finish_termination();

        match reason {
            Some(TerminationReason::Unreaped) => Err(EngineError::RuntimeError(format!(
                "kernel {:?} still running after kill",
                self.pid()
            ))),
            other => Ok(other),
        }
    }

    /// Terminated only after the process is gone; Crashed is left alone
    fn finish_termination(&self) {
        self.state
            .compare_transition(SessionState::Terminating, SessionState::Terminated);
    }

    async fn reap(&self, mut process: KernelProcess) -> Option<TerminationReason> {
        match process
            .terminate(self.config.terminate_read_timeout, KILL_TIMEOUT)
            .await
        {
            Ok(reason) => {
                info!(pid = ?process.pid(), "Kernel {}", reason);
                Some(reason)
            }
            Err(e) => {
                error!(pid = ?process.pid(), "Failed to terminate kernel: {}", e);
                None
            }
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Ready or evaluating
    pub fn is_healthy(&self) -> bool {
        self.state.get().accepts_requests()
    }

    /// Requests written but not yet answered
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pid(&self) -> Option<u32> {
        self.running.lock().as_ref().and_then(|running| running.pid)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn info(&self) -> SessionInfo {
        let running = self.running.lock();
        SessionInfo {
            id: self.id,
            pid: running.as_ref().and_then(|r| r.pid),
            state: self.state.get(),
            pending: self.pending.len(),
            started_at: running.as_ref().map(|r| r.started_at),
        }
    }

    /// The kernel's recent stderr output, left in place for error reports
    pub fn stderr_tail(&self) -> String {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.stderr.snapshot())
            .unwrap_or_default()
    }
}

impl Drop for AsyncSession {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().as_mut() {
            for task in [running.reader.take(), running.writer.take()].into_iter().flatten() {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for AsyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSession")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// A kernel-side function bound to a session
pub struct KernelFunction<'a> {
    session: &'a AsyncSession,
    head: Expr,
}

impl KernelFunction<'_> {
    pub async fn call<I>(&self, args: I) -> Result<Expr>
    where
        I: IntoIterator,
        I::Item: Into<Expr>,
    {
        self.session
            .evaluate(Expr::function(self.head.clone(), args))
            .await
    }

    pub fn head(&self) -> &Expr {
        &self.head
    }
}

async fn write_loop(
    session: Ulid,
    mut writer: FrameWriter,
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
    pending: Arc<PendingQueue>,
) {
    while let Some(frame) = inbound.recv().await {
        if let Err(e) = writer.write_frame(frame).await {
            warn!(%session, "Write to kernel failed: {}", e);
            fail_session(session, &pending, e);
            return;
        }
    }
    debug!(%session, "Writer finished");
}

async fn read_loop(session: Ulid, mut reader: FrameReader, pending: Arc<PendingQueue>) {
    loop {
        let frame = match reader.read_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                fail_session(session, &pending, e);
                return;
            }
        };

        let envelope = match ResponseEnvelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(%session, "Unreadable response from kernel: {}", e);
                fail_session(session, &pending, e);
                return;
            }
        };

        let slot = match pending.pop() {
            Some(slot) => slot,
            None => {
                let e = EngineError::MalformedPayload(
                    "kernel sent a response with no request outstanding".into(),
                );
                error!(%session, "{}", e);
                fail_session(session, &pending, e);
                return;
            }
        };

        let elapsed = slot.submitted_at.elapsed();
        let outcome = shape_response(slot.shape, envelope);
        let label = match &outcome {
            Ok(EvaluationOutput::Wrapped(result)) if !result.success => "failed",
            Ok(_) => "ok",
            Err(_) => "error",
        };
        metrics::counter!(EVALUATIONS_TOTAL, "outcome" => label).increment(1);
        metrics::histogram!(EVALUATION_SECONDS).record(elapsed.as_secs_f64());

        if slot.reply.send(outcome).is_err() {
            debug!(%session, ?elapsed, "Discarding response for an abandoned request");
        }
    }
}

/// Broadcast a fatal error and mark the session crashed
fn fail_session(session: Ulid, pending: &PendingQueue, cause: EngineError) {
    let slots = match pending.close(SessionState::Crashed) {
        Some(slots) => slots,
        // already terminating or crashed
        None => {
            debug!(%session, "Stream ended after close: {}", cause);
            return;
        }
    };

    error!(%session, outstanding = slots.len(), "Session crashed: {}", cause);
    metrics::counter!(SESSIONS_CRASHED_TOTAL).increment(1);
    for slot in slots {
        let _ = slot.reply.send(Err(cause.replicate()));
    }
}

fn shape_response(shape: ResultShape, envelope: ResponseEnvelope) -> Result<EvaluationOutput> {
    match shape {
        ResultShape::Raw => Ok(EvaluationOutput::Raw(envelope.result)),
        ResultShape::Decoded => Ok(EvaluationOutput::Value(envelope.result_expr()?)),
        ResultShape::Wrapped => {
            let result = envelope.result_expr()?;
            Ok(EvaluationOutput::Wrapped(EvaluationResult {
                success: envelope.success,
                messages: envelope.messages,
                result,
                raw: envelope.result,
            }))
        }
    }
}
