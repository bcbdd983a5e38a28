#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

mod declarations;
mod startup_health;

use config::{BackendMode, BindConfig};
use external_api::{ExternalApi, Health};
use kvbind_core::{
    Binder,
    config::{
        cli::{self, Parser},
        trace,
    },
    kv_coordination::{
        Coordinator, MemoryCoordinator, NatsClient, NatsCoordinator, PathKey, RetryPolicy,
    },
    tokio::{self, runtime::Builder, signal},
    tracing::*,
};
use startup_health::verify_background_task_running;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.kvbind_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start kvbind"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    info!(kvbind_id = %config.kvbind_id, "using id");

    debug!("parsing declarations");
    let bind_cfg = Arc::new(BindConfig::parse(&config.config_path)?);

    let backend = bind_cfg.backend();
    info!(?backend, "coordination backend");
    let coordinator: Arc<dyn Coordinator> = match backend {
        BackendMode::Memory => memory_backend(&bind_cfg)?,
        BackendMode::Nats => nats_backend(&config, &bind_cfg).await?,
    };

    let token = CancellationToken::new();
    let mut binder = Binder::with_retry_policy(coordinator, RetryPolicy::from(bind_cfg.watch()));
    let reporters = declarations::register(&mut binder, &bind_cfg, &token)
        .await
        .context("failed to register declared bindings")?;
    let binder = Arc::new(binder);

    // start external api for healthchecks
    let api = ExternalApi::new(
        config.external_api,
        Arc::clone(&bind_cfg),
        Arc::clone(&binder),
    );
    let api_sender = api.sender();
    let mut api_guard = api.start(token.clone());

    if let Err(err) = verify_background_task_running("external API", &mut api_guard).await {
        token.cancel();
        return Err(err);
    }
    if let Err(err) = binder.start().await {
        let _ = api_sender.send(Health::Bad).await;
        token.cancel();
        return Err(err.into());
    }

    debug!("changing health to good after startup checks passed");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    let res = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    info!("shutting down");
    let _ = api_sender.send(Health::Bad).await;
    let stopped = binder.stop().await;
    token.cancel();

    if let Err(err) = api_guard.await {
        error!(?err, "error waiting for web server API");
    }
    for task in reporters {
        if let Err(err) = task.await {
            error!(?err, "error waiting for binding reporter");
        }
    }
    res?;
    stopped.context("bindings failed while running")
}

/// in-process store seeded with the declared values
fn memory_backend(cfg: &BindConfig) -> Result<Arc<dyn Coordinator>> {
    let store = MemoryCoordinator::new();
    for (path, value) in cfg.values() {
        store.set(&PathKey::new(path)?, value.clone());
    }
    info!(values = cfg.values().len(), "seeded in-memory store");
    Ok(Arc::new(store))
}

async fn nats_backend(config: &cli::Config, cfg: &BindConfig) -> Result<Arc<dyn Coordinator>> {
    let nats_config = cfg
        .nats()
        .ok_or_else(|| anyhow!("nats backend requires nats configuration"))?
        .clone();
    let client = NatsClient::new(nats_config);

    info!("connecting to NATS");
    client
        .connect()
        .await
        .map_err(|e| anyhow!("NATS connection failed: {e}"))?;
    client
        .startup_write_selftest()
        .await
        .map_err(|e| anyhow!("nats startup write selftest failed: {e}"))?;

    let coordinator = NatsCoordinator::new(client, cfg.election(), config.kvbind_id.clone())
        .await
        .map_err(|e| anyhow!("failed to open coordination buckets: {e}"))?;
    Ok(Arc::new(coordinator))
}
