//! Runner side of the protocol - drives a model through setup and batches.
//!
//! A model process links this module, implements `PredictHandler`, and calls
//! `run_runner_stdio`. The loop answers every Predict with an Ack before any
//! model code runs, then races the handler against further control messages
//! so cancellation takes effect mid-batch. A Cancel arriving while no batch
//! is in flight is a no-op.

use std::path::PathBuf;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    BatchOutcome, CancelKind, PROTOCOL_VERSION, RunnerRequest, RunnerResponse,
};

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("model setup failed: {0}")]
    Setup(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Model hooks the runner loop drives.
///
/// `predict` receives a cancellation token; a cooperative model checks it
/// between work items and returns early when it fires. The loop reports the
/// canceled outcome either way, so ignoring the token only wastes compute.
#[async_trait]
pub trait PredictHandler: Send + Sync {
    async fn setup(&self) -> Result<(), SetupError>;

    async fn predict(
        &self,
        inputs: Vec<serde_json::Value>,
        is_demo: bool,
        log_path: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> BatchOutcome;
}

/// Run the protocol loop over the process's stdin/stdout.
pub async fn run_runner_stdio<H: PredictHandler>(handler: H) -> anyhow::Result<()> {
    run_runner(handler, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Run the protocol loop over an arbitrary duplex transport.
pub async fn run_runner<H, R, W>(handler: H, input: R, output: W) -> anyhow::Result<()>
where
    H: PredictHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(input, JsonCodec::<RunnerRequest>::new());
    let mut writer = FramedWrite::new(output, JsonCodec::<RunnerResponse>::new());

    if let Err(e) = handler.setup().await {
        writer
            .send(RunnerResponse::SetupLog {
                data: format!("setup failed: {e}"),
            })
            .await?;
        return Err(e.into());
    }
    writer
        .send(RunnerResponse::Ready {
            version: PROTOCOL_VERSION,
        })
        .await?;

    while let Some(msg) = reader.next().await {
        match msg? {
            RunnerRequest::Predict {
                inputs,
                is_demo,
                log_path,
            } => {
                writer.send(RunnerResponse::Ack).await?;

                let token = CancellationToken::new();
                let predict = handler.predict(inputs, is_demo, log_path, token.clone());
                tokio::pin!(predict);

                let mut cancel_kind = None;
                let outcome = loop {
                    tokio::select! {
                        outcome = &mut predict => break Some(outcome),
                        msg = reader.next() => match msg {
                            Some(Ok(RunnerRequest::Cancel { kind })) => {
                                cancel_kind = Some(kind);
                                token.cancel();
                            }
                            Some(Ok(RunnerRequest::Shutdown)) => {
                                token.cancel();
                                break None;
                            }
                            Some(Ok(RunnerRequest::Predict { .. })) => {
                                tracing::error!("Received predict while a batch is in flight");
                            }
                            Some(Err(e)) => return Err(e.into()),
                            None => break None,
                        }
                    }
                };

                let Some(outcome) = outcome else {
                    return Ok(());
                };

                // A canceled batch always reports failure, even if the model
                // raced to a result.
                let outcome = match cancel_kind {
                    Some(CancelKind::Timeout) => BatchOutcome::Failure {
                        error: "Timeout".to_string(),
                    },
                    Some(CancelKind::Cancel) => BatchOutcome::Failure {
                        error: "Canceled".to_string(),
                    },
                    None => outcome,
                };
                writer.send(RunnerResponse::Completed { outcome }).await?;
            }
            RunnerRequest::Cancel { kind } => {
                tracing::debug!(?kind, "Ignoring cancel with no batch in flight");
            }
            RunnerRequest::Shutdown => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct EchoHandler;

    #[async_trait]
    impl PredictHandler for EchoHandler {
        async fn setup(&self) -> Result<(), SetupError> {
            Ok(())
        }

        async fn predict(
            &self,
            inputs: Vec<serde_json::Value>,
            _is_demo: bool,
            _log_path: Option<PathBuf>,
            cancel: CancellationToken,
        ) -> BatchOutcome {
            // Inputs with a "delay_ms" field simulate slow model work.
            let delay = inputs
                .first()
                .and_then(|i| i.get("delay_ms"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                    BatchOutcome::Success {
                        outputs: inputs,
                        demo_outputs: None,
                        files: vec![],
                    }
                }
                _ = cancel.cancelled() => BatchOutcome::Failure {
                    error: "interrupted".to_string(),
                },
            }
        }
    }

    struct FailingSetupHandler;

    #[async_trait]
    impl PredictHandler for FailingSetupHandler {
        async fn setup(&self) -> Result<(), SetupError> {
            Err(SetupError::Setup("weights missing".to_string()))
        }

        async fn predict(
            &self,
            _inputs: Vec<serde_json::Value>,
            _is_demo: bool,
            _log_path: Option<PathBuf>,
            _cancel: CancellationToken,
        ) -> BatchOutcome {
            unreachable!()
        }
    }

    type TestWriter = FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, JsonCodec<RunnerRequest>>;
    type TestReader = FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, JsonCodec<RunnerResponse>>;

    fn start<H: PredictHandler + 'static>(
        handler: H,
    ) -> (TestWriter, TestReader, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let (server_io, runner_io) = tokio::io::duplex(64 * 1024);
        let (runner_read, runner_write) = tokio::io::split(runner_io);
        let task = tokio::spawn(run_runner(handler, runner_read, runner_write));

        let (server_read, server_write) = tokio::io::split(server_io);
        (
            FramedWrite::new(server_write, JsonCodec::new()),
            FramedRead::new(server_read, JsonCodec::new()),
            task,
        )
    }

    async fn expect_ready(reader: &mut TestReader) {
        match reader.next().await.unwrap().unwrap() {
            RunnerResponse::Ready { version } => assert_eq!(version, PROTOCOL_VERSION),
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ack_precedes_completed() {
        let (mut writer, mut reader, _task) = start(EchoHandler);
        expect_ready(&mut reader).await;

        writer
            .send(RunnerRequest::Predict {
                inputs: vec![json!({"x": 1})],
                is_demo: false,
                log_path: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            reader.next().await.unwrap().unwrap(),
            RunnerResponse::Ack
        ));
        match reader.next().await.unwrap().unwrap() {
            RunnerResponse::Completed {
                outcome: BatchOutcome::Success { outputs, .. },
            } => assert_eq!(outputs, vec![json!({"x": 1})]),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_mid_batch_reports_canceled() {
        let (mut writer, mut reader, _task) = start(EchoHandler);
        expect_ready(&mut reader).await;

        writer
            .send(RunnerRequest::Predict {
                inputs: vec![json!({"delay_ms": 10_000})],
                is_demo: false,
                log_path: None,
            })
            .await
            .unwrap();
        assert!(matches!(
            reader.next().await.unwrap().unwrap(),
            RunnerResponse::Ack
        ));

        writer
            .send(RunnerRequest::Cancel {
                kind: CancelKind::Cancel,
            })
            .await
            .unwrap();

        match reader.next().await.unwrap().unwrap() {
            RunnerResponse::Completed {
                outcome: BatchOutcome::Failure { error },
            } => assert_eq!(error, "Canceled"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_cancel_reports_timeout() {
        let (mut writer, mut reader, _task) = start(EchoHandler);
        expect_ready(&mut reader).await;

        writer
            .send(RunnerRequest::Predict {
                inputs: vec![json!({"delay_ms": 10_000})],
                is_demo: false,
                log_path: None,
            })
            .await
            .unwrap();
        assert!(matches!(
            reader.next().await.unwrap().unwrap(),
            RunnerResponse::Ack
        ));

        writer
            .send(RunnerRequest::Cancel {
                kind: CancelKind::Timeout,
            })
            .await
            .unwrap();

        match reader.next().await.unwrap().unwrap() {
            RunnerResponse::Completed {
                outcome: BatchOutcome::Failure { error },
            } => assert_eq!(error, "Timeout"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_cancel_is_a_noop() {
        let (mut writer, mut reader, _task) = start(EchoHandler);
        expect_ready(&mut reader).await;

        writer
            .send(RunnerRequest::Cancel {
                kind: CancelKind::Cancel,
            })
            .await
            .unwrap();

        // The next batch runs normally.
        writer
            .send(RunnerRequest::Predict {
                inputs: vec![json!({"x": 2})],
                is_demo: false,
                log_path: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            reader.next().await.unwrap().unwrap(),
            RunnerResponse::Ack
        ));
        assert!(matches!(
            reader.next().await.unwrap().unwrap(),
            RunnerResponse::Completed {
                outcome: BatchOutcome::Success { .. }
            }
        ));
    }

    #[tokio::test]
    async fn shutdown_ends_the_loop() {
        let (mut writer, mut reader, task) = start(EchoHandler);
        expect_ready(&mut reader).await;

        writer.send(RunnerRequest::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn setup_failure_is_reported_and_exits() {
        let (_writer, mut reader, task) = start(FailingSetupHandler);

        match reader.next().await.unwrap().unwrap() {
            RunnerResponse::SetupLog { data } => {
                assert!(data.contains("weights missing"), "{data}");
            }
            other => panic!("expected setup log, got {other:?}"),
        }
        assert!(task.await.unwrap().is_err());
    }
}
