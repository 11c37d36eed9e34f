//! Worker pool driving the event pipeline off a bounded queue.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::EventPipeline;

/// Sender half handed to ingest sources and the HTTP API.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<serde_json::Value>,
}

impl PipelineHandle {
    /// Queue one raw record. Applies backpressure when the queue is full.
    pub async fn submit(&self, raw: serde_json::Value) -> anyhow::Result<()> {
        self.tx
            .send(raw)
            .await
            .map_err(|_| anyhow::anyhow!("pipeline is shut down"))
    }
}

/// Spawn `workers` tasks consuming from a bounded queue of `queue_depth`
/// records. Dropping every [`PipelineHandle`] clone drains and stops the
/// workers. Per-event failures are already dead-lettered by the pipeline, so
/// the workers only log and move on.
pub fn spawn_workers(
    pipeline: Arc<EventPipeline>,
    workers: usize,
    queue_depth: usize,
) -> (PipelineHandle, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel::<serde_json::Value>(queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));

    let mut handles = Vec::with_capacity(workers.max(1));
    for worker_id in 0..workers.max(1) {
        let rx = Arc::clone(&rx);
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            loop {
                let raw = { rx.lock().await.recv().await };
                match raw {
                    Some(raw) => {
                        // Errors are recorded as dead letters inside handle_raw.
                        if let Err(e) = pipeline.handle_raw(&raw).await {
                            debug!(worker_id, error = %e, "record failed pipeline");
                        }
                    }
                    None => break,
                }
            }
            info!(worker_id, "pipeline worker stopped");
        }));
    }

    (PipelineHandle { tx }, handles)
}
