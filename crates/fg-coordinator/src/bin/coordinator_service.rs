use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use fg_archive::MemoryArchive;
use fg_coordinator::{serve_status, ArchiveEnumerator, Coordinator, SERVICE_NAME};
use fg_engine::{
    build_dispatcher, FederatedInference, FederatedTrainer, InferenceTask, RunnerContext,
    RunnerRegistry, TcpProducerFactory, TrainingTask,
};
use fg_rpc::HttpWorkerClient;
use fg_tracking::DefaultServiceFactory;
use fg_types::{internal_error, CoordinatorConfig, FgResult, Grid, InferenceRefs, ModelRecord};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Stands in for the model routines when none are linked into the service.
/// Alignment still runs in-process; training and inference report an error.
struct Unlinked;

#[async_trait]
impl FederatedTrainer for Unlinked {
    async fn train(&self, task: &TrainingTask) -> FgResult<ModelRecord> {
        Err(internal_error!(
            "no federated trainer is linked into this service, cannot train {}",
            task.key
        ))
    }
}

#[async_trait]
impl FederatedInference for Unlinked {
    async fn infer(&self, task: &InferenceTask) -> FgResult<BTreeMap<String, InferenceRefs>> {
        Err(internal_error!(
            "no federated inference routine is linked into this service, cannot infer {}",
            task.key
        ))
    }
}

fn load_config() -> anyhow::Result<CoordinatorConfig> {
    let mut config = match std::env::var("FEDGRID_CONFIG") {
        Ok(path) => CoordinatorConfig::from_file(&path)
            .with_context(|| format!("failed to load configuration from {path}"))?,
        Err(_) => CoordinatorConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

fn load_grids() -> anyhow::Result<Vec<Grid>> {
    let Ok(path) = std::env::var("FEDGRID_GRIDS") else {
        return Ok(Vec::new());
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read grids from {path}"))?;
    let grids = serde_json::from_str(&raw).with_context(|| format!("malformed grids in {path}"))?;
    Ok(grids)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let grids = load_grids()?;
    if grids.is_empty() {
        warn!("No grids registered, cycles will be rejected until FEDGRID_GRIDS is set");
    }

    let archive = Arc::new(MemoryArchive::new());
    let rpc = Arc::new(HttpWorkerClient::new(&config.rpc)?);
    let runners = RunnerRegistry::standard(RunnerContext {
        archive: archive.clone(),
        rpc,
        trainer: Arc::new(Unlinked),
        inference: Arc::new(Unlinked),
        out_dir: config.out_dir.clone(),
    });
    let dispatcher = build_dispatcher(
        &config,
        Arc::new(TcpProducerFactory),
        runners,
        archive.clone(),
    );

    let addr = config.status_addr.clone();
    let coordinator = Arc::new(Coordinator::new(
        config,
        archive.clone(),
        Arc::new(ArchiveEnumerator::new(archive)),
        grids,
        dispatcher,
        Arc::new(DefaultServiceFactory::new()),
    ));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        service = SERVICE_NAME,
        addr = %addr,
        mode = ?coordinator.mode(),
        grids = coordinator.grids().len(),
        "Coordinator service listening"
    );

    serve_status(listener, coordinator).await?;
    Ok(())
}
