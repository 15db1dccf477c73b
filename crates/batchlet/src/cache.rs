//! Per-unit result tracking with expiration-based garbage collection.
//!
//! Every input of a prediction gets a `UnitResult`; the prediction-level
//! result is derived on read by aggregating its units. Terminal transitions
//! are first-writer-wins: once a unit reaches success or failure, later
//! transition attempts are silent no-ops, which is what makes cancel-racing
//! and duplicate saves safe.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::select_all;
use tokio::sync::{Notify, RwLock};

use crate::error::ServerError;
use crate::ids;

const CLEANUP_PERIOD: Duration = Duration::from_secs(10);

/// Lifecycle status of a unit (and, by aggregation, a prediction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Pending,
    Running,
    Success,
    #[serde(rename = "failed")]
    Failure,
}

impl PredictionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failed",
        }
    }
}

/// Result state for a single input.
struct UnitResult {
    status: PredictionStatus,
    log_id: Option<u64>,
    output: Option<serde_json::Value>,
    demo_output: Option<serde_json::Value>,
    error_message: Option<String>,
    // Fired on every status transition; waiters re-check the status.
    changed: Arc<Notify>,
    done_at: Option<Instant>,
}

impl UnitResult {
    fn new() -> Self {
        Self {
            status: PredictionStatus::Pending,
            log_id: None,
            output: None,
            demo_output: None,
            error_message: None,
            changed: Arc::new(Notify::new()),
            done_at: None,
        }
    }

    fn set_running(&mut self) {
        if self.status == PredictionStatus::Pending {
            self.status = PredictionStatus::Running;
            self.changed.notify_waiters();
        }
    }

    fn set_output(&mut self, output: serde_json::Value, demo_output: Option<serde_json::Value>) {
        if self.status.is_terminal() {
            return;
        }
        self.output = Some(output);
        self.demo_output = demo_output;
        self.status = PredictionStatus::Success;
        self.done_at = Some(Instant::now());
        self.changed.notify_waiters();
    }

    fn set_error(&mut self, message: &str) {
        if self.status.is_terminal() {
            return;
        }
        self.status = PredictionStatus::Failure;
        self.error_message = Some(message.to_string());
        self.done_at = Some(Instant::now());
        self.changed.notify_waiters();
    }
}

/// Aggregated result of all units of a prediction.
#[derive(Debug, Clone)]
pub struct PredictionResult {
    pub status: PredictionStatus,
    pub outputs: Option<Vec<serde_json::Value>>,
    pub demo_outputs: Option<Vec<serde_json::Value>>,
    pub logs: Option<String>,
    pub error_message: Option<String>,
}

struct PredictionEntry {
    input_ids: Vec<String>,
    units: HashMap<String, UnitResult>,
}

impl PredictionEntry {
    fn unit(&self, input_id: &str) -> Result<&UnitResult, ServerError> {
        self.units
            .get(input_id)
            .ok_or_else(|| ServerError::InputIdNotFound(input_id.to_string()))
    }

    fn unit_mut(&mut self, input_id: &str) -> Result<&mut UnitResult, ServerError> {
        self.units
            .get_mut(input_id)
            .ok_or_else(|| ServerError::InputIdNotFound(input_id.to_string()))
    }
}

#[derive(Default)]
struct LogRegistry {
    last_log_id: u64,
    files: HashMap<u64, PathBuf>,
}

/// Result cache: one reader-writer lock per prediction, so status polling
/// runs concurrently while transitions and removal are exclusive per
/// prediction.
pub struct ResultCache {
    predictions: DashMap<String, Arc<RwLock<PredictionEntry>>>,
    logs: Mutex<LogRegistry>,
    expiration: Duration,
}

impl ResultCache {
    pub fn new(expiration: Duration) -> Self {
        Self {
            predictions: DashMap::new(),
            logs: Mutex::new(LogRegistry::default()),
            expiration,
        }
    }

    fn entry(&self, prediction_id: &str) -> Result<Arc<RwLock<PredictionEntry>>, ServerError> {
        self.predictions
            .get(prediction_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ServerError::PredictionIdNotFound(prediction_id.to_string()))
    }

    /// Allocate a new prediction id and create pending units for all of its
    /// derived input ids.
    pub fn register(&self, num_inputs: usize) -> Result<String, ServerError> {
        let prediction_id = uuid::Uuid::new_v4().simple().to_string();
        let input_ids = ids::input_ids_for_prediction(&prediction_id, num_inputs);

        let units = input_ids
            .iter()
            .map(|id| (id.clone(), UnitResult::new()))
            .collect();
        let entry = Arc::new(RwLock::new(PredictionEntry { input_ids, units }));

        // uuid v4 collision would indicate an id-generation defect.
        match self.predictions.entry(prediction_id.clone()) {
            dashmap::Entry::Occupied(_) => {
                Err(ServerError::PredictionIdAlreadyExists(prediction_id))
            }
            dashmap::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(prediction_id)
            }
        }
    }

    pub async fn get_num_inputs(&self, prediction_id: &str) -> Result<usize, ServerError> {
        let entry = self.entry(prediction_id)?;
        let guard = entry.read().await;
        Ok(guard.input_ids.len())
    }

    /// Allocate a fresh log id, attach it to the given units, and record the
    /// backing file for later aggregation.
    pub async fn set_log_path(
        &self,
        input_ids: &[String],
        log_path: PathBuf,
    ) -> Result<(), ServerError> {
        let log_id = {
            let mut logs = self.logs.lock().expect("log registry lock poisoned");
            logs.last_log_id += 1;
            let log_id = logs.last_log_id;
            logs.files.insert(log_id, log_path);
            log_id
        };

        for input_id in input_ids {
            let entry = self.entry(ids::prediction_id_of_input(input_id))?;
            let mut guard = entry.write().await;
            guard.unit_mut(input_id)?.log_id = Some(log_id);
        }
        Ok(())
    }

    /// Transition units from pending to running.
    pub async fn set_running(&self, input_ids: &[String]) -> Result<(), ServerError> {
        for input_id in input_ids {
            let entry = self.entry(ids::prediction_id_of_input(input_id))?;
            let mut guard = entry.write().await;
            guard.unit_mut(input_id)?.set_running();
        }
        Ok(())
    }

    /// Record outputs for units still pending or running.
    pub async fn set_success(
        &self,
        input_ids: &[String],
        outputs: Vec<serde_json::Value>,
        demo_outputs: Vec<Option<serde_json::Value>>,
    ) -> Result<(), ServerError> {
        for ((input_id, output), demo_output) in input_ids.iter().zip(outputs).zip(demo_outputs) {
            let entry = self.entry(ids::prediction_id_of_input(input_id))?;
            let mut guard = entry.write().await;
            guard.unit_mut(input_id)?.set_output(output, demo_output);
        }
        Ok(())
    }

    /// Fail every non-terminal unit of a prediction.
    pub async fn set_failure(
        &self,
        prediction_id: &str,
        message: &str,
    ) -> Result<(), ServerError> {
        let entry = self.entry(prediction_id)?;
        let mut guard = entry.write().await;
        let input_ids = guard.input_ids.clone();
        for input_id in &input_ids {
            guard.unit_mut(input_id)?.set_error(message);
        }
        Ok(())
    }

    /// Aggregate the units of a prediction into a `PredictionResult`.
    ///
    /// Status aggregation: any failure wins, else success requires all units,
    /// else running if anything has started, else pending. The error message
    /// is the first non-null one in unit order.
    pub async fn get_result(&self, prediction_id: &str) -> Result<PredictionResult, ServerError> {
        let entry = self.entry(prediction_id)?;
        let guard = entry.read().await;

        let mut any_failure = false;
        let mut all_success = true;
        let mut any_started = false;
        for input_id in &guard.input_ids {
            let unit = guard.unit(input_id)?;
            match unit.status {
                PredictionStatus::Failure => any_failure = true,
                PredictionStatus::Success => any_started = true,
                PredictionStatus::Running => {
                    all_success = false;
                    any_started = true;
                }
                PredictionStatus::Pending => all_success = false,
            }
        }

        let status = if any_failure {
            PredictionStatus::Failure
        } else if all_success {
            PredictionStatus::Success
        } else if any_started {
            PredictionStatus::Running
        } else {
            PredictionStatus::Pending
        };

        let logs = self.aggregate_logs(&guard)?;

        if status == PredictionStatus::Failure {
            let error_message = guard
                .input_ids
                .iter()
                .filter_map(|id| guard.units.get(id))
                .find_map(|u| u.error_message.clone());
            return Ok(PredictionResult {
                status,
                outputs: None,
                demo_outputs: None,
                logs,
                error_message,
            });
        }

        if status == PredictionStatus::Success {
            let mut outputs = Vec::with_capacity(guard.input_ids.len());
            let mut demo_outputs = Vec::with_capacity(guard.input_ids.len());
            for input_id in &guard.input_ids {
                let unit = guard.unit(input_id)?;
                outputs.push(unit.output.clone().unwrap_or(serde_json::Value::Null));
                demo_outputs.push(unit.demo_output.clone());
            }
            // Demo outputs are all-or-nothing: only expose them when every
            // unit produced one.
            let demo_outputs = demo_outputs
                .into_iter()
                .collect::<Option<Vec<_>>>();
            return Ok(PredictionResult {
                status,
                outputs: Some(outputs),
                demo_outputs,
                logs,
                error_message: None,
            });
        }

        Ok(PredictionResult {
            status,
            outputs: None,
            demo_outputs: None,
            logs,
            error_message: None,
        })
    }

    fn aggregate_logs(&self, entry: &PredictionEntry) -> Result<Option<String>, ServerError> {
        let log_id_set: BTreeSet<u64> = entry
            .input_ids
            .iter()
            .filter_map(|id| entry.units.get(id))
            .filter_map(|u| u.log_id)
            .collect();
        if log_id_set.is_empty() {
            return Ok(None);
        }

        let paths: Vec<PathBuf> = {
            let logs = self.logs.lock().expect("log registry lock poisoned");
            log_id_set
                .iter()
                .filter_map(|id| logs.files.get(id).cloned())
                .collect()
        };

        let mut aggregated = String::new();
        for (idx, path) in paths.iter().enumerate() {
            match std::fs::read_to_string(path) {
                Ok(content) => aggregated.push_str(&content),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read log file");
                }
            }
            if idx != paths.len() - 1 {
                aggregated.push('\n');
            }
        }
        Ok(Some(aggregated))
    }

    /// Wait for every unit of a prediction to reach a terminal state.
    ///
    /// Units are waited sequentially, each against the same `timeout` value,
    /// so the total wall-clock wait for a multi-unit prediction can exceed
    /// the nominal timeout. A wait timeout is not authoritative: the work may
    /// still complete, and callers should re-poll `get_result`.
    pub async fn wait_until_done(
        &self,
        prediction_id: &str,
        timeout: Duration,
    ) -> Result<(), ServerError> {
        let entry = self.entry(prediction_id)?;
        let input_ids = entry.read().await.input_ids.clone();

        'units: for input_id in &input_ids {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let changed = {
                    let guard = entry.read().await;
                    let unit = guard.unit(input_id)?;
                    if unit.status.is_terminal() {
                        continue 'units;
                    }
                    Arc::clone(&unit.changed)
                };

                let notified = changed.notified();
                tokio::pin!(notified);
                // Register the waiter before re-checking, so a transition
                // between the check and the await cannot be missed.
                notified.as_mut().enable();
                if entry.read().await.unit(input_id)?.status.is_terminal() {
                    continue 'units;
                }
                tokio::time::timeout_at(deadline, notified)
                    .await
                    .map_err(|_| ServerError::PredictionTimeout)?;
                // The wake may have been pending-to-running; re-check.
            }
        }
        Ok(())
    }

    /// Wait until the prediction has left the pending state: some unit has
    /// started running or already finished. Returns normally when the
    /// deadline passes; callers re-read the status and decide from there.
    pub async fn wait_while_pending(
        &self,
        prediction_id: &str,
        timeout: Duration,
    ) -> Result<(), ServerError> {
        let entry = self.entry(prediction_id)?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let changed: Vec<Arc<Notify>> = {
                let guard = entry.read().await;
                guard
                    .input_ids
                    .iter()
                    .filter_map(|id| guard.units.get(id))
                    .map(|u| Arc::clone(&u.changed))
                    .collect()
            };
            if changed.is_empty() {
                return Ok(());
            }

            let mut waiters: Vec<_> = changed.iter().map(|n| Box::pin(n.notified())).collect();
            for waiter in &mut waiters {
                waiter.as_mut().enable();
            }
            {
                let guard = entry.read().await;
                let started = guard
                    .input_ids
                    .iter()
                    .filter_map(|id| guard.units.get(id))
                    .any(|u| u.status != PredictionStatus::Pending);
                if started {
                    return Ok(());
                }
            }
            if tokio::time::timeout_at(deadline, select_all(waiters))
                .await
                .is_err()
            {
                return Ok(());
            }
        }
    }

    /// Delete all state of a prediction.
    pub async fn remove(&self, prediction_id: &str) -> Result<(), ServerError> {
        match self.predictions.remove(prediction_id) {
            Some(_) => Ok(()),
            None => Err(ServerError::PredictionIdNotFound(prediction_id.to_string())),
        }
    }

    /// One garbage-collection pass: drop predictions with any unit completed
    /// longer than `expiration` ago, then delete log files no surviving unit
    /// references.
    pub async fn cleanup(&self) {
        let now = Instant::now();
        // Snapshot the entries before taking any per-prediction lock; a
        // DashMap iterator guard must not be held across an await.
        let entries: Vec<(String, Arc<RwLock<PredictionEntry>>)> = self
            .predictions
            .iter()
            .map(|item| (item.key().clone(), Arc::clone(item.value())))
            .collect();

        let mut expired = Vec::new();
        for (prediction_id, entry) in &entries {
            let guard = entry.read().await;
            let is_expired = guard.units.values().any(|u| {
                u.done_at
                    .is_some_and(|done_at| now.duration_since(done_at) > self.expiration)
            });
            if is_expired {
                expired.push(prediction_id.clone());
            }
        }

        for prediction_id in &expired {
            tracing::debug!(prediction_id, "Expiring prediction result");
            self.predictions.remove(prediction_id);
        }

        // Fresh snapshot: predictions registered since the first pass must
        // keep their log files.
        let survivors: Vec<Arc<RwLock<PredictionEntry>>> = self
            .predictions
            .iter()
            .map(|item| Arc::clone(item.value()))
            .collect();
        let mut referenced: BTreeSet<u64> = BTreeSet::new();
        for entry in &survivors {
            let guard = entry.read().await;
            referenced.extend(guard.units.values().filter_map(|u| u.log_id));
        }

        let mut logs = self.logs.lock().expect("log registry lock poisoned");
        let orphaned: Vec<u64> = logs
            .files
            .keys()
            .filter(|id| !referenced.contains(id))
            .copied()
            .collect();
        for log_id in orphaned {
            if let Some(path) = logs.files.remove(&log_id) {
                tracing::debug!(log_id, path = %path.display(), "Deleting orphaned log file");
                if path.exists()
                    && let Err(e) = std::fs::remove_file(&path)
                {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete log file");
                }
            }
        }
    }

    /// Spawn the periodic cleanup task.
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CLEANUP_PERIOD).await;
                cache.cleanup().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn cache() -> ResultCache {
        ResultCache::new(Duration::from_secs(600))
    }

    #[tokio::test]
    async fn register_creates_pending_units() {
        let cache = cache();
        let id = cache.register(3).unwrap();
        assert_eq!(cache.get_num_inputs(&id).await.unwrap(), 3);

        let result = cache.get_result(&id).await.unwrap();
        assert_eq!(result.status, PredictionStatus::Pending);
        assert!(result.outputs.is_none());
        assert!(result.error_message.is_none());
    }

    #[tokio::test]
    async fn unknown_prediction_is_not_found() {
        let cache = cache();
        assert!(matches!(
            cache.get_result("nope").await,
            Err(ServerError::PredictionIdNotFound(_))
        ));
        assert!(matches!(
            cache.remove("nope").await,
            Err(ServerError::PredictionIdNotFound(_))
        ));
    }

    #[tokio::test]
    async fn end_to_end_two_unit_status_walk() {
        let cache = cache();
        let id = cache.register(2).unwrap();
        let input_ids = ids::input_ids_for_prediction(&id, 2);

        assert_eq!(
            cache.get_result(&id).await.unwrap().status,
            PredictionStatus::Pending
        );

        cache.set_running(&input_ids[..1]).await.unwrap();
        assert_eq!(
            cache.get_result(&id).await.unwrap().status,
            PredictionStatus::Running
        );

        cache
            .set_success(&input_ids[..1], vec![json!("out0")], vec![None])
            .await
            .unwrap();
        // One unit still pending: overall running, not success.
        assert_eq!(
            cache.get_result(&id).await.unwrap().status,
            PredictionStatus::Running
        );

        cache.set_running(&input_ids[1..]).await.unwrap();
        cache
            .set_success(&input_ids[1..], vec![json!("out1")], vec![None])
            .await
            .unwrap();

        let result = cache.get_result(&id).await.unwrap();
        assert_eq!(result.status, PredictionStatus::Success);
        assert_eq!(result.outputs, Some(vec![json!("out0"), json!("out1")]));
        assert!(result.demo_outputs.is_none());
    }

    #[tokio::test]
    async fn any_failure_dominates_aggregation() {
        let cache = cache();
        let id = cache.register(2).unwrap();
        let input_ids = ids::input_ids_for_prediction(&id, 2);

        cache
            .set_success(&input_ids[..1], vec![json!("ok")], vec![None])
            .await
            .unwrap();
        cache.set_failure(&id, "boom").await.unwrap();

        let result = cache.get_result(&id).await.unwrap();
        assert_eq!(result.status, PredictionStatus::Failure);
        assert_eq!(result.error_message.as_deref(), Some("boom"));
        assert!(result.outputs.is_none());
    }

    #[tokio::test]
    async fn terminal_transitions_are_idempotent() {
        let cache = cache();
        let id = cache.register(1).unwrap();
        let input_ids = ids::input_ids_for_prediction(&id, 1);

        cache
            .set_success(&input_ids, vec![json!("first")], vec![None])
            .await
            .unwrap();

        // Later transition attempts leave the terminal result untouched.
        cache.set_failure(&id, "too late").await.unwrap();
        cache
            .set_success(&input_ids, vec![json!("second")], vec![None])
            .await
            .unwrap();
        cache.set_running(&input_ids).await.unwrap();

        let result = cache.get_result(&id).await.unwrap();
        assert_eq!(result.status, PredictionStatus::Success);
        assert_eq!(result.outputs, Some(vec![json!("first")]));
        assert!(result.error_message.is_none());
    }

    #[tokio::test]
    async fn set_running_only_promotes_pending_units() {
        let cache = cache();
        let id = cache.register(1).unwrap();
        let input_ids = ids::input_ids_for_prediction(&id, 1);

        cache.set_failure(&id, "early").await.unwrap();
        cache.set_running(&input_ids).await.unwrap();

        let result = cache.get_result(&id).await.unwrap();
        assert_eq!(result.status, PredictionStatus::Failure);
    }

    #[tokio::test]
    async fn demo_outputs_are_all_or_nothing() {
        let cache = cache();
        let id = cache.register(2).unwrap();
        let input_ids = ids::input_ids_for_prediction(&id, 2);

        cache
            .set_success(
                &input_ids,
                vec![json!("a"), json!("b")],
                vec![Some(json!("demo-a")), None],
            )
            .await
            .unwrap();

        let result = cache.get_result(&id).await.unwrap();
        assert_eq!(result.status, PredictionStatus::Success);
        assert!(result.demo_outputs.is_none());
    }

    #[tokio::test]
    async fn log_aggregation_joins_files_with_blank_line() {
        let cache = cache();
        let id = cache.register(2).unwrap();
        let input_ids = ids::input_ids_for_prediction(&id, 2);

        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("log-1");
        let second = dir.path().join("log-2");
        writeln!(std::fs::File::create(&first).unwrap(), "first").unwrap();
        writeln!(std::fs::File::create(&second).unwrap(), "second").unwrap();

        cache
            .set_log_path(&input_ids[..1], first)
            .await
            .unwrap();
        cache
            .set_log_path(&input_ids[1..], second)
            .await
            .unwrap();

        let result = cache.get_result(&id).await.unwrap();
        assert_eq!(result.logs.as_deref(), Some("first\n\nsecond\n"));
    }

    #[tokio::test]
    async fn shared_log_file_appears_once() {
        let cache = cache();
        let id = cache.register(2).unwrap();
        let input_ids = ids::input_ids_for_prediction(&id, 2);

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        writeln!(std::fs::File::create(&log).unwrap(), "shared").unwrap();

        cache.set_log_path(&input_ids, log).await.unwrap();

        let result = cache.get_result(&id).await.unwrap();
        assert_eq!(result.logs.as_deref(), Some("shared\n"));
    }

    #[tokio::test]
    async fn wait_until_done_returns_after_completion() {
        let cache = Arc::new(cache());
        let id = cache.register(1).unwrap();
        let input_ids = ids::input_ids_for_prediction(&id, 1);

        let waiter = {
            let cache = Arc::clone(&cache);
            let id = id.clone();
            tokio::spawn(async move { cache.wait_until_done(&id, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache
            .set_success(&input_ids, vec![json!("done")], vec![None])
            .await
            .unwrap();

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_until_done_outlasts_the_running_transition() {
        let cache = Arc::new(cache());
        let id = cache.register(1).unwrap();
        let input_ids = ids::input_ids_for_prediction(&id, 1);

        let waiter = {
            let cache = Arc::clone(&cache);
            let id = id.clone();
            tokio::spawn(async move { cache.wait_until_done(&id, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.set_running(&input_ids).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Promotion to running must not be mistaken for completion.
        assert!(!waiter.is_finished());

        cache
            .set_success(&input_ids, vec![json!("done")], vec![None])
            .await
            .unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_while_pending_returns_once_a_unit_starts() {
        let cache = Arc::new(cache());
        let id = cache.register(2).unwrap();
        let input_ids = ids::input_ids_for_prediction(&id, 2);

        let waiter = {
            let cache = Arc::clone(&cache);
            let id = id.clone();
            tokio::spawn(
                async move { cache.wait_while_pending(&id, Duration::from_secs(5)).await },
            )
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        cache.set_running(&input_ids[..1]).await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_while_pending_gives_up_at_the_deadline() {
        let cache = cache();
        let id = cache.register(1).unwrap();

        let started = Instant::now();
        cache
            .wait_while_pending(&id, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));

        let result = cache.get_result(&id).await.unwrap();
        assert_eq!(result.status, PredictionStatus::Pending);
    }

    #[tokio::test]
    async fn wait_until_done_times_out() {
        let cache = cache();
        let id = cache.register(1).unwrap();

        let result = cache.wait_until_done(&id, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ServerError::PredictionTimeout)));
    }

    #[tokio::test]
    async fn expired_predictions_are_cleaned_up() {
        let cache = ResultCache::new(Duration::from_millis(100));
        let id = cache.register(1).unwrap();
        let input_ids = ids::input_ids_for_prediction(&id, 1);

        cache
            .set_success(&input_ids, vec![json!("done")], vec![None])
            .await
            .unwrap();

        // Retrievable immediately, including right after a cleanup pass.
        cache.cleanup().await;
        assert!(cache.get_result(&id).await.is_ok());

        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.cleanup().await;
        assert!(matches!(
            cache.get_result(&id).await,
            Err(ServerError::PredictionIdNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_deletes_orphaned_log_files() {
        let cache = ResultCache::new(Duration::from_millis(50));
        let id = cache.register(1).unwrap();
        let input_ids = ids::input_ids_for_prediction(&id, 1);

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        std::fs::write(&log, "line\n").unwrap();

        cache.set_log_path(&input_ids, log.clone()).await.unwrap();
        cache
            .set_success(&input_ids, vec![json!("done")], vec![None])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.cleanup().await;

        assert!(!log.exists());
    }

    #[tokio::test]
    async fn pending_predictions_never_expire() {
        let cache = ResultCache::new(Duration::from_millis(10));
        let id = cache.register(1).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.cleanup().await;

        assert!(cache.get_result(&id).await.is_ok());
    }
}
