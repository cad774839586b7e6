// packages/engine/src/runtime/kernel_process.rs
//! One external kernel process
//!
//! Owns the OS process and its three pipes:
//!
//! - **stdin**: request frames, through a [`FrameWriter`]
//! - **stdout**: response frames, through a [`FrameReader`]
//! - **stderr**: drained line by line into a [`StderrLog`] by a background
//!   task and forwarded to tracing
//!
//! The reader and writer can be split off so a session can drive each half
//! from a different task. Termination is graceful first (stdin closed plus
//! SIGTERM), forced after the grace period (SIGKILL).

use crate::runtime::diagnostics::{StderrLog, TerminationReason, DEFAULT_STDERR_CAPACITY};
use crate::utils::config::KernelConfig;
use crate::utils::errors::{EngineError, Result};
use crate::wire::envelope::is_ready_marker;
use crate::wire::{deserialize, FrameCodec};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, instrument, trace, warn, Level};

/// How long a stream-closed error waits for trailing stderr output
const STDERR_SETTLE_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration for spawning a kernel
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Kernel executable
    pub path: PathBuf,

    /// Command-line arguments
    pub args: Vec<String>,

    /// Environment variables
    pub env_vars: Vec<(String, String)>,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// Level for forwarding stderr lines to tracing
    pub stderr_level: Level,

    /// Stderr lines retained for error reports
    pub stderr_capacity: usize,
}

impl SpawnConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("WolframKernel"),
            args: vec![],
            env_vars: vec![],
            work_dir: None,
            stderr_level: Level::WARN,
            stderr_capacity: DEFAULT_STDERR_CAPACITY,
        }
    }
}

impl From<&KernelConfig> for SpawnConfig {
    fn from(config: &KernelConfig) -> Self {
        let mut env_vars: Vec<_> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env_vars.sort();

        Self {
            path: config.path.clone(),
            args: config.args.clone(),
            env_vars,
            ..Default::default()
        }
    }
}

/// Receive half: one complete frame per call
pub struct FrameReader {
    inner: FramedRead<ChildStdout, FrameCodec>,
    stderr: Arc<StderrLog>,
}

impl FrameReader {
    /// Block until one frame arrives
    ///
    /// Fails with `StreamClosed` when the kernel closes stdout and with
    /// `MalformedPayload` when the bytes cannot be framed.
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        match self.inner.next().await {
            Some(Ok(frame)) => {
                trace!(len = frame.len(), "Frame received");
                Ok(frame)
            }
            Some(Err(EngineError::Io(e))) => {
                debug!("Read from kernel failed: {}", e);
                Err(self.stream_closed().await)
            }
            Some(Err(e)) => Err(e),
            None => Err(self.stream_closed().await),
        }
    }

    async fn stream_closed(&self) -> EngineError {
        self.stderr.settle(STDERR_SETTLE_TIMEOUT).await;
        EngineError::StreamClosed {
            stderr: self.stderr.snapshot(),
        }
    }
}

/// Send half: writes and flushes one frame per call
pub struct FrameWriter {
    inner: FramedWrite<ChildStdin, FrameCodec>,
    stderr: Arc<StderrLog>,
}

impl FrameWriter {
    pub async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        let len = frame.len();
        match self.inner.send(frame).await {
            Ok(()) => {
                trace!(len, "Frame written");
                Ok(())
            }
            Err(EngineError::Io(e)) => {
                debug!("Write to kernel failed: {}", e);
                self.stderr.settle(STDERR_SETTLE_TIMEOUT).await;
                Err(EngineError::StreamClosed {
                    stderr: self.stderr.snapshot(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// A running kernel process
pub struct KernelProcess {
    child: Child,
    pid: Option<u32>,
    reader: Option<FrameReader>,
    writer: Option<FrameWriter>,
    stderr: Arc<StderrLog>,
    stderr_task: Option<JoinHandle<()>>,
}

impl KernelProcess {
    /// Spawn the kernel and wait for its ready marker
    ///
    /// Fails with `StartupTimeout` if the marker does not arrive within
    /// `startup_timeout`; the process is killed before returning any error.
    #[instrument(skip_all, fields(path = %config.path.display()))]
    pub async fn start(
        config: &SpawnConfig,
        startup_timeout: Duration,
        runtime: &Handle,
    ) -> Result<Self> {
        let mut process = Self::spawn(config, runtime)?;

        let handshake = tokio::time::timeout(startup_timeout, process.await_ready()).await;
        match handshake {
            Ok(Ok(())) => {
                info!(pid = ?process.pid, "Kernel ready");
                Ok(process)
            }
            Ok(Err(e)) => {
                warn!(pid = ?process.pid, "Kernel failed during startup: {}", e);
                process.kill_now().await;
                Err(e)
            }
            Err(_) => {
                warn!(pid = ?process.pid, ?startup_timeout, "Kernel startup timed out");
                process.kill_now().await;
                Err(EngineError::StartupTimeout {
                    timeout: startup_timeout,
                    stderr: process.stderr.take_tail(),
                })
            }
        }
    }

    /// Spawn without waiting for readiness
    pub fn spawn(config: &SpawnConfig, runtime: &Handle) -> Result<Self> {
        debug!("Spawning kernel process: {:?} {:?}", config.path, config.args);

        let mut command = Command::new(&config.path);
        command.args(&config.args);
        for (key, value) in &config.env_vars {
            command.env(key, value);
        }
        if let Some(work_dir) = &config.work_dir {
            command.current_dir(work_dir);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            EngineError::ProcessSpawnFailed(format!("{}: {}", config.path.display(), e))
        })?;
        let pid = child.id();
        debug!("Kernel spawned with PID: {:?}", pid);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Failed to capture stdout".into()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Failed to capture stderr".into()))?;

        let stderr = Arc::new(StderrLog::new(config.stderr_capacity));
        let stderr_task = runtime.spawn(drain_stderr(
            stderr_pipe,
            Arc::clone(&stderr),
            config.stderr_level,
            pid,
        ));

        Ok(Self {
            child,
            pid,
            reader: Some(FrameReader {
                inner: FramedRead::new(stdout, FrameCodec::new()),
                stderr: Arc::clone(&stderr),
            }),
            writer: Some(FrameWriter {
                inner: FramedWrite::new(stdin, FrameCodec::new()),
                stderr: Arc::clone(&stderr),
            }),
            stderr,
            stderr_task: Some(stderr_task),
        })
    }

    async fn await_ready(&mut self) -> Result<()> {
        let frame = self.read_frame().await?;
        let expr = deserialize(&frame)?;
        if is_ready_marker(&expr) {
            Ok(())
        } else {
            Err(EngineError::MalformedPayload(format!(
                "expected ready marker, kernel sent {}",
                expr
            )))
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn stderr_log(&self) -> Arc<StderrLog> {
        Arc::clone(&self.stderr)
    }

    /// Write one frame while the writer is still owned here
    pub async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_frame(frame).await,
            None => Err(EngineError::RuntimeError("kernel writer was taken".into())),
        }
    }

    /// Read one frame while the reader is still owned here
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        match self.reader.as_mut() {
            Some(reader) => reader.read_frame().await,
            None => Err(EngineError::RuntimeError("kernel reader was taken".into())),
        }
    }

    pub fn take_reader(&mut self) -> Option<FrameReader> {
        self.reader.take()
    }

    pub fn take_writer(&mut self) -> Option<FrameWriter> {
        self.writer.take()
    }

    /// Non-blocking liveness check
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Graceful shutdown, then force-kill
    ///
    /// Closes stdin and sends SIGTERM, waits up to `grace`, then sends
    /// SIGKILL and waits up to `kill_timeout`.
    #[instrument(skip(self), fields(pid = ?self.pid))]
    pub async fn terminate(
        &mut self,
        grace: Duration,
        kill_timeout: Duration,
    ) -> Result<TerminationReason> {
        // Dropping the writer closes the kernel's stdin
        self.writer.take();

        if let Some(status) = self.child.try_wait()? {
            self.finish();
            return Ok(TerminationReason::AlreadyExited(status.code()));
        }

        if let Some(pid) = self.pid {
            send_sigterm(pid);
        }

        let reason = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => TerminationReason::from_status(status?),
            Err(_) => {
                warn!(?grace, "Kernel did not exit in time, forcing kill");
                if let Err(e) = self.child.start_kill() {
                    debug!("start_kill failed: {}", e);
                }
                match tokio::time::timeout(kill_timeout, self.child.wait()).await {
                    Ok(status) => {
                        status?;
                        TerminationReason::Killed
                    }
                    Err(_) => {
                        error!(?kill_timeout, "Kernel still running after SIGKILL");
                        TerminationReason::Unreaped
                    }
                }
            }
        };

        debug!("Kernel {}", reason);
        self.finish();
        Ok(reason)
    }

    /// Kill immediately, used when startup fails
    async fn kill_now(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Failed to kill kernel: {}", e);
        }
        self.stderr.settle(STDERR_SETTLE_TIMEOUT).await;
        self.finish();
    }

    fn finish(&mut self) {
        self.reader.take();
        self.writer.take();
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

impl Drop for KernelProcess {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    debug!("Sending SIGTERM to PID {}", pid);
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!("Failed to send SIGTERM to PID {}: {}", pid, e),
    }
}

async fn drain_stderr(pipe: ChildStderr, log: Arc<StderrLog>, level: Level, pid: Option<u32>) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                forward_stderr(level, pid, &line);
                log.push(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(?pid, "Kernel stderr read failed: {}", e);
                break;
            }
        }
    }
    log.mark_closed();
}

fn forward_stderr(level: Level, pid: Option<u32>, line: &str) {
    if level == Level::ERROR {
        error!(target: "kernel", ?pid, "{}", line);
    } else if level == Level::WARN {
        warn!(target: "kernel", ?pid, "{}", line);
    } else if level == Level::INFO {
        info!(target: "kernel", ?pid, "{}", line);
    } else if level == Level::DEBUG {
        debug!(target: "kernel", ?pid, "{}", line);
    } else {
        trace!(target: "kernel", ?pid, "{}", line);
    }
}
