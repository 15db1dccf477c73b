//! Prediction worker - the single consumer of the input queue.
//!
//! One worker drives one executor. The loop pops a compatible batch, marks
//! its units running, executes, then records per-unit results. Failure is
//! batch-granular: when a batch fails for any reason, every prediction that
//! contributed an input to it is failed, including its inputs that were
//! never dequeued.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::bridge::protocol::BatchOutcome;
use crate::bus::{EventBus, LocalEventBus};
use crate::cache::{PredictionStatus, ResultCache};
use crate::error::ServerError;
use crate::executor::BatchExecutor;
use crate::ids;
use crate::queue::{Batch, InputQueue};
use crate::uploader::FileUploader;

const CANCEL_EVENT: &str = "cancel";
const CANCEL_WAIT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
enum SetupState {
    Pending,
    Ready,
    Failed(String),
}

/// Externally visible setup phase, reported by the metadata endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupStatus {
    Starting,
    Ready,
    Failed,
}

pub struct PredictionWorker {
    queue: Arc<InputQueue>,
    cache: Arc<ResultCache>,
    bus: Arc<LocalEventBus>,
    executor: Arc<dyn BatchExecutor>,
    uploader: Arc<dyn FileUploader>,
    max_batch_size: usize,
    running_input_ids: Arc<StdMutex<Vec<String>>>,
    setup_tx: watch::Sender<SetupState>,
    fatal_tx: watch::Sender<bool>,
}

impl PredictionWorker {
    pub fn new(
        queue: Arc<InputQueue>,
        cache: Arc<ResultCache>,
        bus: Arc<LocalEventBus>,
        executor: Arc<dyn BatchExecutor>,
        uploader: Arc<dyn FileUploader>,
        max_batch_size: usize,
    ) -> Self {
        let (setup_tx, _) = watch::channel(SetupState::Pending);
        let (fatal_tx, _) = watch::channel(false);
        Self {
            queue,
            cache,
            bus,
            executor,
            uploader,
            max_batch_size,
            running_input_ids: Arc::new(StdMutex::new(Vec::new())),
            setup_tx,
            fatal_tx,
        }
    }

    /// Fires when the executor hits an unrecoverable error; the server uses
    /// it to shut down.
    pub fn fatal_signal(&self) -> watch::Receiver<bool> {
        self.fatal_tx.subscribe()
    }

    /// Stop the consumption loop and terminate the runner.
    pub fn trigger_shutdown(&self) {
        let _ = self.fatal_tx.send(true);
    }

    pub fn setup_status(&self) -> SetupStatus {
        match &*self.setup_tx.borrow() {
            SetupState::Pending => SetupStatus::Starting,
            SetupState::Ready => SetupStatus::Ready,
            SetupState::Failed(_) => SetupStatus::Failed,
        }
    }

    /// Register a new prediction: allocate ids, create pending results, and
    /// enqueue the inputs.
    pub fn create_prediction(
        &self,
        inputs: &[serde_json::Value],
        is_demo: bool,
    ) -> Result<String, ServerError> {
        let prediction_id = self.cache.register(inputs.len())?;
        self.queue.push(&prediction_id, inputs, is_demo);
        tracing::info!(
            target: "batchlet::prediction",
            prediction_id,
            num_inputs = inputs.len(),
            is_demo,
            "Prediction created"
        );
        Ok(prediction_id)
    }

    pub async fn wait_for_prediction(
        &self,
        prediction_id: &str,
        timeout: Duration,
    ) -> Result<(), ServerError> {
        self.cache.wait_until_done(prediction_id, timeout).await
    }

    pub async fn get_prediction_result(
        &self,
        prediction_id: &str,
    ) -> Result<crate::cache::PredictionResult, ServerError> {
        self.cache.get_result(prediction_id).await
    }

    pub async fn remove_prediction_result(
        &self,
        prediction_id: &str,
    ) -> Result<(), ServerError> {
        self.cache.remove(prediction_id).await
    }

    /// Cancel a prediction wherever it currently is: drop queued inputs, ask
    /// the executor to abort a running batch, and fail whatever is left
    /// non-terminal. A no-op for predictions that already finished.
    pub async fn cancel_prediction(&self, prediction_id: &str) -> Result<(), ServerError> {
        let result = self.cache.get_result(prediction_id).await?;
        if result.status.is_terminal() {
            return Ok(());
        }

        let removed = self.queue.remove(prediction_id);
        let num_inputs = self.cache.get_num_inputs(prediction_id).await?;
        if removed.len() == num_inputs {
            // Nothing ever started running.
            self.cache.set_failure(prediction_id, "Canceled").await?;
            tracing::info!(
                target: "batchlet::prediction",
                prediction_id,
                "Prediction canceled before execution"
            );
            return Ok(());
        }

        // Some inputs are in flight. Wait for the batch to actually pick them
        // up, then decide from the status at that point.
        self.cache
            .wait_while_pending(prediction_id, CANCEL_WAIT)
            .await?;
        let status = self.cache.get_result(prediction_id).await?.status;
        if status.is_terminal() {
            return Ok(());
        }
        if status == PredictionStatus::Running {
            // The cancel event only aborts the batch when it belongs to this
            // prediction alone, so co-batched predictions are never
            // collateral damage.
            self.bus.post(CANCEL_EVENT, Some(prediction_id.to_string()));
        }
        // Fail the prediction right away: a shared batch keeps running, and a
        // batch that completes anyway loses to these terminal transitions.
        self.cache.set_failure(prediction_id, "Canceled").await?;
        tracing::info!(
            target: "batchlet::prediction",
            prediction_id,
            "Prediction canceled"
        );
        Ok(())
    }

    /// Block until model setup has finished, propagating a setup failure.
    pub async fn wait_for_setup(&self) -> Result<(), ServerError> {
        let mut rx = self.setup_tx.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                SetupState::Ready => return Ok(()),
                SetupState::Failed(message) => return Err(ServerError::SetupFailed(message)),
                SetupState::Pending => {
                    rx.changed().await.map_err(|_| {
                        ServerError::SetupFailed("worker stopped during setup".to_string())
                    })?;
                }
            }
        }
    }

    /// Run setup, then consume the queue until shutdown or a fatal error.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let worker = Arc::clone(self);
        let handler_worker = Arc::clone(self);
        self.bus.register_handler(
            CANCEL_EVENT,
            Box::new(move |payload| {
                let worker = Arc::clone(&handler_worker);
                Box::pin(async move {
                    let Some(prediction_id) = payload else { return };
                    worker.handle_cancel_event(&prediction_id).await;
                })
            }),
        );
        self.bus.start();
        self.cache.spawn_cleanup();

        tokio::spawn(async move {
            if let Err(e) = worker.executor.setup().await {
                tracing::error!(error = %e, "Model setup failed");
                let _ = worker.setup_tx.send(SetupState::Failed(e.to_string()));
                let _ = worker.fatal_tx.send(true);
                return;
            }
            let _ = worker.setup_tx.send(SetupState::Ready);

            let mut fatal_rx = worker.fatal_tx.subscribe();
            loop {
                if *fatal_rx.borrow() {
                    break;
                }
                let batch = tokio::select! {
                    batch = worker.queue.pop(worker.max_batch_size, None) => match batch {
                        Ok(batch) => batch,
                        Err(_) => continue,
                    },
                    _ = fatal_rx.changed() => break,
                };

                let fatal = worker.run_batch(batch).await;
                worker
                    .running_input_ids
                    .lock()
                    .expect("running batch lock poisoned")
                    .clear();
                if fatal {
                    let _ = worker.fatal_tx.send(true);
                    break;
                }
            }
            worker.executor.terminate().await;
        })
    }

    async fn handle_cancel_event(&self, prediction_id: &str) {
        let cancel_running = {
            let running = self
                .running_input_ids
                .lock()
                .expect("running batch lock poisoned");
            !running.is_empty()
                && running
                    .iter()
                    .all(|id| ids::input_in_prediction(id, prediction_id))
        };
        if cancel_running {
            tracing::info!(
                target: "batchlet::prediction",
                prediction_id,
                "Canceling running batch"
            );
            self.executor.cancel().await;
        }
    }

    /// Execute one batch end to end. Returns true when the executor error is
    /// fatal and the loop must stop.
    async fn run_batch(&self, batch: Batch) -> bool {
        *self
            .running_input_ids
            .lock()
            .expect("running batch lock poisoned") = batch.input_ids.clone();

        let log_path = if batch.is_demo {
            match self.create_log_file(&batch.input_ids).await {
                Ok(path) => Some(path),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create log file, continuing without");
                    None
                }
            }
        } else {
            None
        };

        if let Err(e) = self.cache.set_running(&batch.input_ids).await {
            tracing::warn!(error = %e, "Failed to mark batch running");
        }

        tracing::info!(
            target: "batchlet::prediction",
            batch_size = batch.input_ids.len(),
            is_demo = batch.is_demo,
            "Executing batch"
        );
        let outcome = self
            .executor
            .predict(batch.data, batch.is_demo, log_path)
            .await;

        match outcome {
            Ok(BatchOutcome::Success {
                outputs,
                demo_outputs,
                files,
            }) => {
                match self.publish_outputs(outputs, demo_outputs, files).await {
                    Ok((outputs, demo_outputs)) => {
                        if let Err(e) = self
                            .cache
                            .set_success(&batch.input_ids, outputs, demo_outputs)
                            .await
                        {
                            tracing::warn!(error = %e, "Failed to record batch success");
                        }
                    }
                    Err(e) => {
                        self.fail_batch(&batch.input_ids, &e.to_string()).await;
                    }
                }
                false
            }
            Ok(BatchOutcome::Failure { error }) => {
                self.fail_batch(&batch.input_ids, &error).await;
                false
            }
            Err(e) => {
                self.fail_batch(&batch.input_ids, &e.to_string()).await;
                if e.is_fatal() {
                    tracing::error!(error = %e, "Fatal executor error, stopping worker");
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn create_log_file(&self, input_ids: &[String]) -> Result<PathBuf, ServerError> {
        let path = tempfile::Builder::new()
            .prefix("batchlet-log-")
            .tempfile()
            .and_then(|f| f.into_temp_path().keep().map_err(Into::into))
            .map_err(|e| ServerError::Upload(format!("failed to create log file: {e}")))?;
        self.cache.set_log_path(input_ids, path.clone()).await?;
        Ok(path)
    }

    /// Upload output files and rewrite path references in the outputs to the
    /// published locations.
    async fn publish_outputs(
        &self,
        mut outputs: Vec<serde_json::Value>,
        demo_outputs: Option<Vec<serde_json::Value>>,
        files: Vec<PathBuf>,
    ) -> Result<(Vec<serde_json::Value>, Vec<Option<serde_json::Value>>), ServerError> {
        let num_units = outputs.len();
        let mut demo = match demo_outputs {
            Some(values) => values.into_iter().map(Some).collect(),
            None => vec![None; num_units],
        };

        if !files.is_empty() {
            let keys: Vec<String> = files
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            let refs = self.uploader.upload(files).await?;
            let replacements: HashMap<String, String> =
                keys.into_iter().zip(refs).collect();

            for output in &mut outputs {
                rewrite_file_refs(output, &replacements);
            }
            for output in demo.iter_mut().flatten() {
                rewrite_file_refs(output, &replacements);
            }
        }
        Ok((outputs, demo))
    }

    /// Fail every prediction that contributed an input to the batch, pulling
    /// its remaining inputs out of the queue first.
    async fn fail_batch(&self, input_ids: &[String], error: &str) {
        let mut prediction_ids: Vec<&str> = Vec::new();
        for input_id in input_ids {
            let prediction_id = ids::prediction_id_of_input(input_id);
            if !prediction_ids.contains(&prediction_id) {
                prediction_ids.push(prediction_id);
            }
        }

        for prediction_id in prediction_ids {
            self.queue.remove(prediction_id);
            if let Err(e) = self.cache.set_failure(prediction_id, error).await {
                tracing::warn!(prediction_id, error = %e, "Failed to record batch failure");
            }
            tracing::warn!(
                target: "batchlet::prediction",
                prediction_id,
                error,
                "Prediction failed"
            );
        }
    }
}

/// Replace string values that exactly match a published file path.
fn rewrite_file_refs(value: &mut serde_json::Value, replacements: &HashMap<String, String>) {
    match value {
        serde_json::Value::String(s) => {
            if let Some(replacement) = replacements.get(s.as_str()) {
                *s = replacement.clone();
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                rewrite_file_refs(item, replacements);
            }
        }
        serde_json::Value::Object(fields) => {
            for item in fields.values_mut() {
                rewrite_file_refs(item, replacements);
            }
        }
        _ => {}
    }
}
