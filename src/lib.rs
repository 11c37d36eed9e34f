//! opstriage -- auto-analysis agent for IT operations events.
//!
//! This crate provides the core library for event normalization, similar-case
//! retrieval, classification, scheduled trend reports, and the HTTP API.

pub mod api;
pub mod classify;
pub mod config;
pub mod index;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod retrieve;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;

use crate::classify::NearestCaseClassifier;
use crate::config::{Config, EmbeddingBackend};
use crate::index::{CaseIndex, Embedder, HashEmbedder, Indexer, RemoteEmbedder};
use crate::ingest::Normalizer;
use crate::pipeline::EventPipeline;
use crate::report::runner::ReportRunner;
use crate::retrieve::Retriever;
use crate::scheduler::Scheduler;
use crate::storage::Pool;

/// Everything the daemon and the one-shot CLI commands share.
pub struct Runtime {
    pub pool: Pool,
    pub pipeline: Arc<EventPipeline>,
    pub indexer: Arc<Indexer>,
    pub retriever: Arc<Retriever>,
    pub runner: Arc<ReportRunner>,
    pub scheduler: Scheduler,
    pub config: Arc<Config>,
}

/// Open storage, build the embedding/retrieval/classification stack, and warm
/// the case index.
pub async fn build_runtime(config: Config) -> Result<Runtime> {
    tracing::info!(db_path = %config.storage.db_path, "initializing database");
    if let Some(parent) = std::path::Path::new(&config.storage.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let pool = storage::open_pool(&config.storage.db_path)?;

    let embedder: Arc<dyn Embedder> = match config.embedding.backend {
        EmbeddingBackend::Local => Arc::new(HashEmbedder::new(config.embedding.dimension)),
        EmbeddingBackend::Remote => Arc::new(RemoteEmbedder::new(&config.embedding)?),
    };

    let index = Arc::new(CaseIndex::new());
    let indexer = Arc::new(Indexer::new(
        Arc::clone(&embedder),
        Arc::clone(&index),
        pool.clone(),
    ));
    indexer.warm_load().await?;

    let retriever = Arc::new(Retriever::new(Arc::clone(&embedder), Arc::clone(&index)));
    let pipeline = Arc::new(EventPipeline::new(
        Normalizer::new("api"),
        Retriever::new(Arc::clone(&embedder), Arc::clone(&index)),
        Arc::new(NearestCaseClassifier::new(config.classifier.min_confidence)),
        pool.clone(),
        config.classifier.retrieval_k,
        config.embedding.max_retries,
    ));
    let runner = Arc::new(ReportRunner::new(
        pool.clone(),
        config.report.top_n,
        config.report.late_grace_secs,
    ));
    let scheduler = Scheduler::new(pool.clone());

    Ok(Runtime {
        pool,
        pipeline,
        indexer,
        retriever,
        runner,
        scheduler,
        config: Arc::new(config),
    })
}

/// Start the opstriage daemon: API server plus the scheduler engine.
pub async fn serve(runtime: Runtime, bind: &str) -> Result<()> {
    let scheduler = runtime.scheduler.clone();
    let runner = Arc::clone(&runtime.runner);
    let window_minutes = runtime.config.report.window_minutes;
    let late_grace_secs = runtime.config.report.late_grace_secs;
    tokio::spawn(async move {
        scheduler::run_scheduler_loop(scheduler, runner, window_minutes, late_grace_secs).await;
    });

    let state = api::state::AppState {
        pool: runtime.pool,
        pipeline: runtime.pipeline,
        indexer: runtime.indexer,
        retriever: runtime.retriever,
        runner: runtime.runner,
        scheduler: runtime.scheduler,
        config: runtime.config,
    };
    let app = api::router(state);

    let addr: std::net::SocketAddr = bind.parse()?;
    tracing::info!(%addr, "opstriage listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
