use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use batchlet::config::{self, ServerSettings};
use batchlet::http::{AppState, ServerConfig, serve};
use batchlet::{PredictionWorker, ProcessExecutor, SimpleSpawner, VersionInfo};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("batchlet=info"));
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let settings = ServerSettings::from_env()?;
    let (metadata, input_spec, model_version) = config::load_metadata(&settings.metadata_path)?;

    let queue = config::create_queue(input_spec);
    let cache = config::create_cache(settings.result_expiration);
    let bus = config::create_bus();
    let uploader = config::create_uploader(&settings.storage);

    let spawner = SimpleSpawner::new(settings.runner_command.clone());
    let executor = Arc::new(ProcessExecutor::spawn(
        &spawner,
        settings.setup_timeout,
        settings.prediction_timeout,
    )?);

    let worker = Arc::new(PredictionWorker::new(
        queue,
        cache,
        bus,
        executor,
        uploader,
        settings.max_batch_size,
    ));
    let worker_task = worker.start();

    tracing::info!("Waiting for model setup");
    worker.wait_for_setup().await?;

    let mut version = VersionInfo::new();
    if let Some(model_version) = model_version {
        version = version.with_model(model_version);
    }

    let state = Arc::new(AppState::new(
        worker,
        metadata,
        version,
        settings.prediction_timeout,
    ));
    serve(
        ServerConfig {
            host: settings.host.clone(),
            port: settings.port,
        },
        state,
    )
    .await?;

    // serve() triggers worker shutdown on the way out; wait for the loop to
    // finish terminating the runner before the runtime tears it down.
    if tokio::time::timeout(Duration::from_secs(10), worker_task)
        .await
        .is_err()
    {
        tracing::warn!("Worker did not stop in time");
    }
    Ok(())
}
