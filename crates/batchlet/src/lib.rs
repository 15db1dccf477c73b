//! batchlet: dynamic-batching prediction server for packaged inference models.
//!
//! A single runner subprocess executes batches of compatible inputs one at a
//! time; the server side groups queued inputs into batches, tracks per-unit
//! results in an expiring cache, and routes cancellation to whatever batch is
//! currently in flight.

mod ids;
mod version;

pub mod bridge;
pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod queue;
pub mod runner;
pub mod uploader;
pub mod worker;

pub use bridge::protocol::{BatchOutcome, CancelKind};
pub use bus::{EventBus, LocalEventBus};
pub use cache::{PredictionResult, PredictionStatus, ResultCache};
pub use error::ServerError;
pub use executor::{BatchExecutor, ProcessExecutor, SimpleSpawner, WorkerSpawner};
pub use queue::{Batch, InputQueue, InputSpec};
pub use runner::{PredictHandler, SetupError, run_runner, run_runner_stdio};
pub use uploader::{FileUploader, InMemoryFileUploader, LocalFsFileUploader};
pub use version::VersionInfo;
pub use worker::PredictionWorker;
