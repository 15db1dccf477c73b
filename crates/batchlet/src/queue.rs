//! Admission queue with greedy compatible-batch extraction.
//!
//! Inputs wait here between `create_prediction` and the orchestrator loop.
//! `pop` takes the oldest input, then scans the rest of the queue in order for
//! inputs sharing its compatibility hash and demo flag, skipping over
//! incompatible ones. Batching is therefore FIFO *within* a compatibility
//! class but not across classes: a later-arriving incompatible input can be
//! served while an earlier compatible one is still waiting behind it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::Digest;
use tokio::sync::Notify;

use crate::error::ServerError;
use crate::ids;

/// Which input fields are required, as declared by the model's input schema.
///
/// Only *optional* fields contribute to the batch-compatibility hash: inputs
/// that differ in a required field still share a batch, inputs that differ in
/// an option never do.
#[derive(Debug, Clone, Default)]
pub struct InputSpec {
    required_fields: Vec<String>,
}

impl InputSpec {
    pub fn new(required_fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required_fields: required_fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_required(&self, field: &str) -> bool {
        self.required_fields.iter().any(|f| f == field)
    }
}

/// Compatibility hash over the optional fields of an input.
///
/// Fields are visited in sorted name order; each contributes
/// `{name}:{json}\n` to the digest. Required fields are excluded entirely, so
/// two inputs differing only in required payload hash identically.
pub fn batch_hash(input: &serde_json::Value, spec: &InputSpec) -> String {
    let mut hasher = sha2::Sha256::new();

    if let serde_json::Value::Object(map) = input {
        // serde_json::Map iteration order is insertion order; collect into a
        // BTreeMap so the hash does not depend on the caller's field order.
        let sorted: BTreeMap<&String, &serde_json::Value> = map.iter().collect();
        for (name, value) in sorted {
            if spec.is_required(name) {
                continue;
            }
            let serialized =
                serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(serialized.as_bytes());
            hasher.update(b"\n");
        }
    }

    format!("sha256:{:x}", hasher.finalize())
}

/// A maximal set of mutually compatible inputs chosen for one runner call.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Vec<String>,
    pub data: Vec<serde_json::Value>,
    pub is_demo: bool,
}

#[derive(Debug, Clone)]
struct QueuedInput {
    input_id: String,
    data: serde_json::Value,
    hash: String,
    is_demo: bool,
}

/// FIFO admission queue shared between HTTP handlers and the orchestrator.
///
/// Mutation happens under a single lock sized for short critical sections
/// (scan and removal only, never execution). `pop` waits on a Notify signaled
/// by `push` rather than busy-polling.
pub struct InputQueue {
    items: Mutex<Vec<QueuedInput>>,
    available: Arc<Notify>,
    spec: InputSpec,
}

impl InputQueue {
    pub fn new(spec: InputSpec) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            available: Arc::new(Notify::new()),
            spec,
        }
    }

    /// Append the inputs of a prediction in order, computing and storing each
    /// input's compatibility hash. Returns the derived input ids.
    pub fn push(
        &self,
        prediction_id: &str,
        inputs: &[serde_json::Value],
        is_demo: bool,
    ) -> Vec<String> {
        let input_ids = ids::input_ids_for_prediction(prediction_id, inputs.len());

        {
            let mut items = self.items.lock().expect("input queue lock poisoned");
            items.extend(input_ids.iter().zip(inputs).map(|(input_id, data)| {
                QueuedInput {
                    input_id: input_id.clone(),
                    data: data.clone(),
                    hash: batch_hash(data, &self.spec),
                    is_demo,
                }
            }));
        }

        tracing::debug!(
            prediction_id,
            num_inputs = inputs.len(),
            is_demo,
            "Pushed inputs to queue"
        );
        self.available.notify_waiters();
        input_ids
    }

    /// Wait for at least one queued input, then extract a maximal compatible
    /// batch of at most `max_batch_size` inputs.
    ///
    /// The head of the queue fixes the batch's demo flag and compatibility
    /// hash; the remaining queue is scanned in order and matching inputs are
    /// removed, leaving non-matching ones in place.
    pub async fn pop(
        &self,
        max_batch_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Batch, ServerError> {
        assert!(max_batch_size > 0);

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            // Register for a wakeup before checking, so a push between the
            // check and the await is not lost.
            let notified = self.available.notified();

            if let Some(batch) = self.try_pop(max_batch_size) {
                return Ok(batch);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        // One last look: a push may have raced the deadline.
                        return self
                            .try_pop(max_batch_size)
                            .ok_or(ServerError::QueueTimeout);
                    }
                }
                None => notified.await,
            }
        }
    }

    fn try_pop(&self, max_batch_size: usize) -> Option<Batch> {
        let mut items = self.items.lock().expect("input queue lock poisoned");
        if items.is_empty() {
            return None;
        }

        let head = items.remove(0);
        let is_demo = head.is_demo;
        let hash = head.hash.clone();
        let mut taken = vec![head];

        let mut i = 0;
        while taken.len() < max_batch_size && i < items.len() {
            if items[i].hash == hash && items[i].is_demo == is_demo {
                taken.push(items.remove(i));
            } else {
                i += 1;
            }
        }

        Some(Batch {
            input_ids: taken.iter().map(|inp| inp.input_id.clone()).collect(),
            data: taken.into_iter().map(|inp| inp.data).collect(),
            is_demo,
        })
    }

    /// Remove every not-yet-popped input of a prediction.
    ///
    /// Returns the ids actually removed; a partial or empty result means some
    /// inputs were already taken by the orchestrator.
    pub fn remove(&self, prediction_id: &str) -> Vec<String> {
        let mut items = self.items.lock().expect("input queue lock poisoned");
        let mut removed = Vec::new();
        items.retain(|inp| {
            if ids::input_in_prediction(&inp.input_id, prediction_id) {
                removed.push(inp.input_id.clone());
                false
            } else {
                true
            }
        });

        for input_id in &removed {
            tracing::debug!(input_id, "Removed input from queue");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("input queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
