//! Environment-driven configuration and component factories.
//!
//! Everything is tunable through environment variables with the defaults a
//! packaged model expects. Queue, cache, bus, and uploader are constructed
//! through explicit factory functions so alternative backends slot in at one
//! place.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::bus::LocalEventBus;
use crate::cache::ResultCache;
use crate::http::routes::ModelMetadata;
use crate::queue::{InputQueue, InputSpec};
use crate::uploader::{FileUploader, InMemoryFileUploader, LocalFsFileUploader};

/// How output files are published to clients.
#[derive(Debug, Clone)]
pub enum StorageMode {
    /// Inline data URIs; no shared storage required.
    InMemory,
    /// Copy into a directory mounted into the client's filesystem.
    LocalFs(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_batch_size: usize,
    pub setup_timeout: Duration,
    pub prediction_timeout: Duration,
    pub result_expiration: Duration,
    pub storage: StorageMode,
    pub runner_command: Vec<String>,
    pub metadata_path: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_batch_size: 1,
            setup_timeout: Duration::from_secs(600),
            prediction_timeout: Duration::from_secs(600),
            result_expiration: Duration::from_secs(600),
            storage: StorageMode::InMemory,
            runner_command: vec![],
            metadata_path: PathBuf::from("metadata.json"),
        }
    }
}

impl ServerSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let storage = match std::env::var("MOUNT_POINT") {
            Ok(mount_point) if !mount_point.is_empty() => {
                StorageMode::LocalFs(PathBuf::from(mount_point))
            }
            _ => StorageMode::InMemory,
        };
        let runner_command = std::env::var("RUNNER_COMMAND")
            .context("RUNNER_COMMAND must be set to the runner executable")?;

        Ok(Self {
            host: env_or("HOST", defaults.host)?,
            port: env_or("PORT", defaults.port)?,
            max_batch_size: env_or("MAX_BATCH_SIZE", defaults.max_batch_size)?,
            setup_timeout: env_duration_or("SETUP_TIMEOUT", defaults.setup_timeout)?,
            prediction_timeout: env_duration_or(
                "PREDICTION_TIMEOUT",
                defaults.prediction_timeout,
            )?,
            result_expiration: env_duration_or(
                "RESULT_EXPIRATION",
                defaults.result_expiration,
            )?,
            storage,
            runner_command: split_command(&runner_command),
            metadata_path: env_or("MODEL_METADATA_PATH", defaults.metadata_path)?,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("invalid {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

/// Timeouts are given in seconds, fractions allowed.
fn env_duration_or(key: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(key) {
        Ok(raw) => {
            let secs: f64 = raw.parse().with_context(|| format!("invalid {key}: {raw}"))?;
            parse_duration_secs(secs).with_context(|| format!("invalid {key}: {raw}"))
        }
        Err(_) => Ok(default),
    }
}

fn parse_duration_secs(secs: f64) -> anyhow::Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        anyhow::bail!("duration must be a positive number of seconds");
    }
    Ok(Duration::from_secs_f64(secs))
}

fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(|s| s.to_string()).collect()
}

/// The model's metadata file: JSON schemas plus an optional version string.
#[derive(Debug, serde::Deserialize)]
struct MetadataFile {
    input_schema: serde_json::Value,
    output_schema: serde_json::Value,
    #[serde(default)]
    demo_output_schema: Option<serde_json::Value>,
    #[serde(default)]
    model_version: Option<String>,
}

/// Load model metadata and derive the input spec from the schema's
/// `required` list.
pub fn load_metadata(
    path: &std::path::Path,
) -> anyhow::Result<(ModelMetadata, InputSpec, Option<String>)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read model metadata at {}", path.display()))?;
    let file: MetadataFile = serde_json::from_str(&raw)
        .with_context(|| format!("invalid model metadata at {}", path.display()))?;

    let spec = input_spec_from_schema(&file.input_schema);
    let metadata = ModelMetadata {
        input_schema: file.input_schema,
        output_schema: file.output_schema,
        demo_output_schema: file.demo_output_schema,
    };
    Ok((metadata, spec, file.model_version))
}

fn input_spec_from_schema(schema: &serde_json::Value) -> InputSpec {
    let required = schema
        .get("required")
        .and_then(|v| v.as_array())
        .map(|fields| {
            fields
                .iter()
                .filter_map(|f| f.as_str())
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    InputSpec::new(required)
}

pub fn create_queue(spec: InputSpec) -> Arc<InputQueue> {
    Arc::new(InputQueue::new(spec))
}

pub fn create_cache(result_expiration: Duration) -> Arc<ResultCache> {
    Arc::new(ResultCache::new(result_expiration))
}

pub fn create_bus() -> Arc<LocalEventBus> {
    Arc::new(LocalEventBus::new())
}

pub fn create_uploader(storage: &StorageMode) -> Arc<dyn FileUploader> {
    match storage {
        StorageMode::InMemory => Arc::new(InMemoryFileUploader),
        StorageMode::LocalFs(mount_point) => Arc::new(LocalFsFileUploader::new(mount_point)),
    }
}
