//! Executor - owns the runner subprocess and the framed protocol to it.
//!
//! Flow:
//! 1. Spawn runner subprocess with piped stdio
//! 2. Stream SetupLog until Ready (bounded by the setup timeout)
//! 3. Per batch: send Predict, require Ack, await Completed (bounded by the
//!    prediction timeout)
//! 4. On timeout: send Cancel{Timeout}, give the runner a grace window, then
//!    kill it
//!
//! One batch is in flight at a time; the writer lock is held across the
//! Predict/Ack handshake so a cancel message can never arrive at the runner
//! before the batch it targets.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    BatchOutcome, CancelKind, PROTOCOL_VERSION, RunnerRequest, RunnerResponse,
};
use crate::error::ServerError;

const ACK_POLL: Duration = Duration::from_secs(1);
const CANCEL_GRACE: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const STDERR_TAIL_LINES: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different runner spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Spawner running a configured command line with piped stdio.
pub struct SimpleSpawner {
    command: Vec<String>,
}

impl SimpleSpawner {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl WorkerSpawner for SimpleSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| SpawnError::Other("empty runner command".to_string()))?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The runner must not outlive the server when the owning task is
            // dropped before a graceful terminate.
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Batch execution seam between the worker loop and the runner subprocess.
///
/// This abstraction enables testing the worker loop without a real runner
/// subprocess.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// Run model setup to completion.
    async fn setup(&self) -> Result<(), ServerError>;

    /// Execute one batch and return its outcome. Serialized by the caller;
    /// only one batch is in flight at a time.
    async fn predict(
        &self,
        inputs: Vec<serde_json::Value>,
        is_demo: bool,
        log_path: Option<PathBuf>,
    ) -> Result<BatchOutcome, ServerError>;

    /// Ask the runner to abort the in-flight batch. Fire-and-forget.
    async fn cancel(&self);

    /// Shut the runner down gracefully, killing it if it lingers.
    async fn terminate(&self);
}

/// Executor backed by a spawned subprocess speaking the framed JSON protocol
/// over stdin/stdout.
pub struct ProcessExecutor {
    child: Mutex<Child>,
    writer: Mutex<FramedWrite<ChildStdin, JsonCodec<RunnerRequest>>>,
    reader: Mutex<FramedRead<ChildStdout, JsonCodec<RunnerResponse>>>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    setup_timeout: Duration,
    prediction_timeout: Duration,
}

impl ProcessExecutor {
    pub fn spawn(
        spawner: &dyn WorkerSpawner,
        setup_timeout: Duration,
        prediction_timeout: Duration,
    ) -> Result<Self, ServerError> {
        let mut child = spawner
            .spawn()
            .map_err(|e| ServerError::SetupFailed(format!("failed to spawn runner: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ServerError::SetupFailed("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServerError::SetupFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ServerError::SetupFailed("stderr not captured".to_string()))?;

        let stderr_tail = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail = Arc::clone(&stderr_tail);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::info!(target: "batchlet::runner", "{}", line);
                let mut tail = tail.lock().expect("stderr tail lock poisoned");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        Ok(Self {
            child: Mutex::new(child),
            writer: Mutex::new(FramedWrite::new(stdin, JsonCodec::new())),
            reader: Mutex::new(FramedRead::new(stdout, JsonCodec::new())),
            stderr_tail,
            setup_timeout,
            prediction_timeout,
        })
    }

    fn log_tail(&self) -> String {
        let tail = self.stderr_tail.lock().expect("stderr tail lock poisoned");
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    async fn kill(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            tracing::warn!(error = %e, "Failed to kill runner");
        }
    }

    fn terminated(&self) -> ServerError {
        ServerError::SubprocessTerminated {
            log_tail: self.log_tail(),
        }
    }
}

#[async_trait]
impl BatchExecutor for ProcessExecutor {
    async fn setup(&self) -> Result<(), ServerError> {
        let mut reader = self.reader.lock().await;
        let deadline = tokio::time::Instant::now() + self.setup_timeout;

        loop {
            let next = tokio::time::timeout_at(deadline, reader.next()).await;
            match next {
                Ok(Some(Ok(RunnerResponse::Ready { version }))) => {
                    if version != PROTOCOL_VERSION {
                        self.kill().await;
                        return Err(ServerError::SetupFailed(format!(
                            "runner protocol version {version} does not match {PROTOCOL_VERSION}"
                        )));
                    }
                    tracing::info!("Runner setup complete");
                    return Ok(());
                }
                Ok(Some(Ok(RunnerResponse::SetupLog { data }))) => {
                    for line in data.lines() {
                        tracing::info!(target: "batchlet::setup", "{}", line);
                    }
                }
                Ok(Some(Ok(other))) => {
                    self.kill().await;
                    return Err(ServerError::SetupFailed(format!(
                        "unexpected message during setup: {other:?}"
                    )));
                }
                Ok(Some(Err(e))) => {
                    self.kill().await;
                    return Err(ServerError::SetupFailed(format!("protocol error: {e}")));
                }
                Ok(None) => {
                    return Err(ServerError::SetupFailed(format!(
                        "runner exited during setup:\n{}",
                        self.log_tail()
                    )));
                }
                Err(_) => {
                    self.kill().await;
                    return Err(ServerError::SetupFailed("setup timed out".to_string()));
                }
            }
        }
    }

    async fn predict(
        &self,
        inputs: Vec<serde_json::Value>,
        is_demo: bool,
        log_path: Option<PathBuf>,
    ) -> Result<BatchOutcome, ServerError> {
        let mut reader = self.reader.lock().await;

        // Hold the writer lock until Ack so a concurrent cancel cannot reach
        // the runner before the batch it is meant to abort.
        {
            let mut writer = self.writer.lock().await;
            writer
                .send(RunnerRequest::Predict {
                    inputs,
                    is_demo,
                    log_path,
                })
                .await
                .map_err(|_| self.terminated())?;

            // The ack can lag behind a busy runner; wait for it as long as
            // the subprocess stays alive.
            loop {
                match tokio::time::timeout(ACK_POLL, reader.next()).await {
                    Ok(Some(Ok(RunnerResponse::Ack))) => break,
                    Ok(Some(Ok(other))) => {
                        return Err(ServerError::Protocol(format!(
                            "expected ack, got {other:?}"
                        )));
                    }
                    Ok(Some(Err(e))) => {
                        return Err(ServerError::Protocol(format!("protocol error: {e}")));
                    }
                    Ok(None) => return Err(self.terminated()),
                    Err(_) => {
                        let exited = self
                            .child
                            .lock()
                            .await
                            .try_wait()
                            .ok()
                            .flatten()
                            .is_some();
                        if exited {
                            return Err(self.terminated());
                        }
                    }
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.prediction_timeout;
        loop {
            match tokio::time::timeout_at(deadline, reader.next()).await {
                Ok(Some(Ok(RunnerResponse::Completed { outcome }))) => return Ok(outcome),
                Ok(Some(Ok(other))) => {
                    tracing::warn!(message = ?other, "Ignoring unexpected runner message");
                }
                Ok(Some(Err(e))) => {
                    return Err(ServerError::Protocol(format!("protocol error: {e}")));
                }
                Ok(None) => return Err(self.terminated()),
                Err(_) => break,
            }
        }

        // Timeout expired. Tell the runner, then give it a grace window to
        // come back with an outcome before killing it.
        tracing::warn!("Prediction timed out, canceling batch");
        {
            let mut writer = self.writer.lock().await;
            if writer
                .send(RunnerRequest::Cancel {
                    kind: CancelKind::Timeout,
                })
                .await
                .is_err()
            {
                return Err(self.terminated());
            }
        }

        let grace = tokio::time::Instant::now() + CANCEL_GRACE;
        loop {
            match tokio::time::timeout_at(grace, reader.next()).await {
                Ok(Some(Ok(RunnerResponse::Completed { .. }))) => {
                    return Err(ServerError::PredictionTimeout);
                }
                Ok(Some(Ok(_))) | Ok(Some(Err(_))) => {}
                Ok(None) => return Err(self.terminated()),
                Err(_) => {
                    tracing::error!("Runner did not honor cancellation, killing it");
                    self.kill().await;
                    return Err(self.terminated());
                }
            }
        }
    }

    async fn cancel(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer
            .send(RunnerRequest::Cancel {
                kind: CancelKind::Cancel,
            })
            .await
        {
            tracing::warn!(error = %e, "Failed to send cancel to runner");
        }
    }

    async fn terminate(&self) {
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.send(RunnerRequest::Shutdown).await {
                tracing::debug!(error = %e, "Failed to send shutdown to runner");
            }
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(?status, "Runner exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to wait for runner");
            }
            Err(_) => {
                tracing::warn!("Runner did not exit after shutdown, killing it");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "Failed to kill runner");
                }
            }
        }
    }
}
