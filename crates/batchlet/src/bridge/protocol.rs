//! Wire protocol types for server-runner communication.
//!
//! A single duplex channel (the runner's stdin/stdout) carries everything:
//! the server sends batches and cancellation, the runner answers with an Ack
//! handshake per batch and a final outcome. Cancellation is an in-band
//! message, not a process signal, so it composes with any transport.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Bumped on incompatible wire changes. The server rejects a runner that
/// reports a different version at Ready.
pub const PROTOCOL_VERSION: u32 = 1;

/// Why an in-flight batch is being canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelKind {
    /// A client asked for cancellation.
    Cancel,
    /// The server-side prediction timeout expired.
    Timeout,
}

/// Messages from server to runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerRequest {
    /// Run one batch. The runner must answer with Ack before doing any work,
    /// then with exactly one Completed.
    Predict {
        inputs: Vec<serde_json::Value>,
        is_demo: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        log_path: Option<PathBuf>,
    },

    /// Abort the in-flight batch. A no-op when nothing is running.
    Cancel { kind: CancelKind },

    Shutdown,
}

/// Messages from runner to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerResponse {
    /// Model setup finished and the runner accepts batches.
    Ready { version: u32 },

    /// Setup-phase log line (before the first batch).
    SetupLog { data: String },

    /// Batch received, execution starting.
    Ack,

    Completed { outcome: BatchOutcome },
}

/// Final result of one batch, all inputs together.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    /// One output per input, in input order. `demo_outputs` is set only for
    /// demo batches; `files` lists artifacts the outputs reference by path.
    Success {
        outputs: Vec<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        demo_outputs: Option<Vec<serde_json::Value>>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        files: Vec<PathBuf>,
    },

    /// Any per-input failure fails the whole batch.
    Failure { error: String },
}
