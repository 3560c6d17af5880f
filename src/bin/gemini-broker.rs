//! Process entrypoint: reads configuration, wires the composition root
//! described in §2, and serves until a termination signal arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;

use gemini_broker::api::{AppState, DownloadTokens};
use gemini_broker::broker::{CorrelationLayer, Dispatcher, ExecutorRegistry, ReplicationEngine};
use gemini_broker::cache::{EvictionLoop, FileStore, IngestPipeline, MetadataRegistry};
use gemini_broker::config::Config;
use gemini_broker::orchestrator::Orchestrator;

const DOWNLOAD_TOKEN_TIMEOUT: Duration = Duration::from_secs(300);
const DOWNLOAD_TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let config = Arc::new(Config::from_env().context("loading configuration")?);

    let store = Arc::new(FileStore::new(config.cache_root.clone()));
    let registry = Arc::new(MetadataRegistry::new());
    let ingest = Arc::new(IngestPipeline::new(store.clone(), registry.clone()));
    let executors = Arc::new(ExecutorRegistry::new());
    let correlation = Arc::new(CorrelationLayer::new());
    let dispatcher = Arc::new(Dispatcher::new(executors.clone(), correlation.clone(), config.executor_request_timeout));
    let replication = Arc::new(ReplicationEngine::new(store.clone(), registry.clone(), dispatcher.clone()));
    let orchestrator = Arc::new(Orchestrator::new(registry.clone(), executors.clone(), dispatcher.clone(), replication.clone()));
    let download_tokens = Arc::new(DownloadTokens::new());

    let eviction = Arc::new(EvictionLoop::new(
        store.clone(),
        registry.clone(),
        ingest.clone(),
        config.cache_quota_bytes,
        config.session_timeout,
    ));

    let state = Arc::new(AppState {
        config: config.clone(),
        store: store.clone(),
        registry: registry.clone(),
        ingest,
        executors,
        correlation,
        dispatcher,
        replication,
        orchestrator,
        download_tokens: download_tokens.clone(),
        started_at: std::time::Instant::now(),
    });

    let (eviction_shutdown_tx, eviction_shutdown_rx) = tokio::sync::oneshot::channel();
    let eviction_handle = tokio::spawn({
        let eviction = eviction.clone();
        let interval = config.cache_sweep_interval;
        async move {
            eviction.run(interval, async { let _ = eviction_shutdown_rx.await; }).await;
        }
    });

    let (token_sweep_shutdown_tx, mut token_sweep_shutdown_rx) = tokio::sync::oneshot::channel();
    let token_sweep_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DOWNLOAD_TOKEN_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => download_tokens.sweep_expired(DOWNLOAD_TOKEN_TIMEOUT),
                _ = &mut token_sweep_shutdown_rx => break,
            }
        }
    });

    info!("gemini-broker starting up, cache root {}", config.cache_root.display());

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
    };
    gemini_broker::api::serve(state, shutdown).await.context("serving HTTP")?;

    let _ = eviction_shutdown_tx.send(());
    let _ = token_sweep_shutdown_tx.send(());
    let _ = eviction_handle.await;
    let _ = token_sweep_handle.await;

    info!("clearing cache on shutdown");
    store.delete_all().await.context("clearing cache store on shutdown")?;

    Ok(())
}
