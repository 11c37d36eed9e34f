//! Event pipeline -- normalize, retrieve, classify, persist.
//!
//! One event's failure never blocks the rest of the stream: validation
//! failures and exhausted retries land in the dead-letter table with the
//! original payload, so nothing is silently dropped.

pub mod engine;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::classify::{Classifier, ClassifyError};
use crate::index::ScoredCase;
use crate::ingest::{Normalizer, ValidationError};
use crate::model::{Classification, Event};
use crate::retrieve::{RetrieveError, Retriever};
use crate::storage::{self, Pool};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Retrieve(#[from] RetrieveError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error("pipeline storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    /// Stage name recorded with a dead letter.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "normalize",
            PipelineError::Retrieve(_) => "retrieve",
            PipelineError::Classify(_) => "classify",
            PipelineError::Storage(_) => "storage",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Validation(_) => false,
            PipelineError::Retrieve(e) => e.is_retryable(),
            PipelineError::Classify(e) => e.is_retryable(),
            PipelineError::Storage(_) => false,
        }
    }
}

pub struct EventPipeline {
    normalizer: Normalizer,
    retriever: Retriever,
    classifier: Arc<dyn Classifier>,
    pool: Pool,
    retrieval_k: usize,
    max_retries: u32,
}

impl EventPipeline {
    pub fn new(
        normalizer: Normalizer,
        retriever: Retriever,
        classifier: Arc<dyn Classifier>,
        pool: Pool,
        retrieval_k: usize,
        max_retries: u32,
    ) -> Self {
        Self {
            normalizer,
            retriever,
            classifier,
            pool,
            retrieval_k: retrieval_k.max(1),
            max_retries,
        }
    }

    /// Run one raw record through the full pipeline. Failures are routed to
    /// the dead-letter table before the error is returned.
    pub async fn handle_raw(&self, raw: &serde_json::Value) -> Result<Classification, PipelineError> {
        match self.process(raw).await {
            Ok(c) => Ok(c),
            Err(e) => {
                let event_ref = raw_event_ref(raw);
                if let Err(store_err) = storage::save_dead_letter(
                    &self.pool,
                    event_ref.as_deref(),
                    e.stage(),
                    &e.to_string(),
                    raw,
                ) {
                    warn!(error = %store_err, "failed to record dead letter");
                }
                warn!(
                    event_ref = event_ref.as_deref().unwrap_or("?"),
                    stage = e.stage(),
                    error = %e,
                    "event dead-lettered"
                );
                Err(e)
            }
        }
    }

    async fn process(&self, raw: &serde_json::Value) -> Result<Classification, PipelineError> {
        let event = self.normalizer.normalize(raw)?;
        storage::save_event(&self.pool, &event)?;

        let support = self.retrieve_with_retry(&event).await?;
        let classification = self.classify_with_retry(&event, &support).await?;

        storage::save_classification(&self.pool, &classification, event.timestamp)?;
        debug!(
            event_id = %event.id,
            category = %classification.category,
            confidence = classification.confidence,
            "event classified"
        );
        Ok(classification)
    }

    async fn retrieve_with_retry(&self, event: &Event) -> Result<Vec<ScoredCase>, RetrieveError> {
        let mut attempt = 0;
        loop {
            match self.retriever.retrieve(event, self.retrieval_k).await {
                Ok(hits) => return Ok(hits),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    warn!(event_id = %event.id, attempt, error = %e, "retrieval retry");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn classify_with_retry(
        &self,
        event: &Event,
        support: &[ScoredCase],
    ) -> Result<Classification, ClassifyError> {
        let mut attempt = 0;
        loop {
            match self.classifier.classify(event, support).await {
                Ok(c) => return Ok(c),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    warn!(event_id = %event.id, attempt, error = %e, "classification retry");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-run unreplayed dead letters through the pipeline. Records that
    /// succeed are marked replayed; records that fail keep their original row
    /// pending. Replay never writes a second dead letter for the same
    /// payload, so repeated passes over a bad record cannot multiply rows.
    pub async fn replay_dead_letters(&self, limit: usize) -> Result<usize, anyhow::Error> {
        let pending = storage::pending_dead_letters(&self.pool, limit)?;
        let mut replayed = 0;
        for (row_id, payload) in pending {
            match self.process(&payload).await {
                Ok(_) => {
                    storage::mark_dead_letter_replayed(&self.pool, row_id)?;
                    replayed += 1;
                }
                Err(e) => {
                    warn!(row_id, stage = e.stage(), error = %e, "dead letter replay failed");
                }
            }
        }
        Ok(replayed)
    }
}

/// Exponential backoff with jitter: 200ms, 400ms, 800ms... plus 0-100ms.
fn backoff_delay(attempt: u32) -> Duration {
    let base = 200u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..100);
    Duration::from_millis(base + jitter)
}

/// Best-effort event reference for dead-letter rows, even when the record
/// failed validation.
fn raw_event_ref(raw: &serde_json::Value) -> Option<String> {
    let obj = raw.as_object()?;
    for key in ["id", "event_id", "Id", "ID", "EventId"] {
        match obj.get(key) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(serde_json::Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::FixedClassifier;
    use crate::index::{CaseIndex, HashEmbedder, Indexer};
    use crate::model::{Case, Category};
    use chrono::{TimeZone, Utc};

    async fn pipeline_with_case() -> (EventPipeline, Pool) {
        let pool = storage::open_memory_pool().unwrap();
        let embedder = Arc::new(HashEmbedder::new(64));
        let index = Arc::new(CaseIndex::new());
        let indexer = Indexer::new(embedder.clone(), index.clone(), pool.clone());
        indexer
            .index_case(&Case {
                id: "case-1".to_string(),
                event: crate::model::Event {
                    id: "hist-1".to_string(),
                    timestamp: Utc.with_ymd_and_hms(2026, 2, 1, 9, 0, 0).unwrap(),
                    description: "disk full on database volume".to_string(),
                    source: "test".to_string(),
                    host: Some("db01".to_string()),
                    service: None,
                    severity: None,
                    raw_severity: None,
                    duration_secs: None,
                    tags: Vec::new(),
                },
                resolution: "extended the volume".to_string(),
                category: Category::Fault,
            })
            .await
            .unwrap();

        let pipeline = EventPipeline::new(
            Normalizer::new("test"),
            Retriever::new(embedder, index),
            Arc::new(FixedClassifier {
                category: Category::Fault,
                confidence: 0.9,
            }),
            pool.clone(),
            5,
            3,
        );
        (pipeline, pool)
    }

    #[tokio::test]
    async fn test_valid_record_flows_to_classification() {
        let (pipeline, pool) = pipeline_with_case().await;
        let raw = serde_json::json!({
            "id": "ev-1",
            "Time": "2026-03-02 10:05:00",
            "Description": "disk full error on db01"
        });

        let c = pipeline.handle_raw(&raw).await.unwrap();
        assert_eq!(c.category, Category::Fault);
        assert_eq!(c.supporting_cases, vec!["case-1".to_string()]);

        assert!(storage::get_event(&pool, "ev-1").unwrap().is_some());
        let stored = storage::latest_classification(&pool, "ev-1").unwrap().unwrap();
        assert_eq!(stored.category, Category::Fault);
    }

    #[tokio::test]
    async fn test_invalid_record_is_dead_lettered_not_dropped() {
        let (pipeline, pool) = pipeline_with_case().await;
        let raw = serde_json::json!({
            "id": "ev-bad",
            "Description": "no timestamp on this record"
        });

        let err = pipeline.handle_raw(&raw).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(!err.is_retryable());

        let pending = storage::pending_dead_letters(&pool, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1["id"], "ev-bad");
    }

    #[tokio::test]
    async fn test_dead_letter_replay_succeeds_after_fix() {
        let (pipeline, pool) = pipeline_with_case().await;
        // A record that fails validation, then a fixed copy replayed manually
        // is out of scope here: replay re-runs the stored payload as-is, so a
        // valid payload dead-lettered by a transient failure would succeed.
        // Simulate that by inserting a valid payload directly.
        let payload = serde_json::json!({
            "id": "ev-2",
            "timestamp": "2026-03-02T10:00:00Z",
            "description": "disk almost full"
        });
        storage::save_dead_letter(&pool, Some("ev-2"), "classify", "timeout", &payload).unwrap();

        let replayed = pipeline.replay_dead_letters(10).await.unwrap();
        assert_eq!(replayed, 1);
        assert!(storage::pending_dead_letters(&pool, 10).unwrap().is_empty());
        assert!(storage::latest_classification(&pool, "ev-2").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replay_of_bad_record_leaves_single_pending_row() {
        let (pipeline, pool) = pipeline_with_case().await;
        let raw = serde_json::json!({
            "id": "ev-never-good",
            "Description": "still missing its timestamp"
        });
        pipeline.handle_raw(&raw).await.unwrap_err();
        assert_eq!(storage::pending_dead_letters(&pool, 10).unwrap().len(), 1);

        // A permanently invalid record fails every replay pass; the row count
        // must stay at one rather than compounding each pass.
        assert_eq!(pipeline.replay_dead_letters(10).await.unwrap(), 0);
        assert_eq!(storage::pending_dead_letters(&pool, 10).unwrap().len(), 1);
        assert_eq!(pipeline.replay_dead_letters(10).await.unwrap(), 0);
        let pending = storage::pending_dead_letters(&pool, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1["id"], "ev-never-good");
    }

    #[tokio::test]
    async fn test_duplicate_event_id_appends_classification_history() {
        let (pipeline, pool) = pipeline_with_case().await;
        let raw = serde_json::json!({
            "id": "ev-1",
            "timestamp": "2026-03-02T10:05:00Z",
            "description": "disk full error"
        });
        pipeline.handle_raw(&raw).await.unwrap();
        pipeline.handle_raw(&raw).await.unwrap();

        // One event row, two classification rows: audit history survives.
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap();
        assert_eq!(storage::events_in_window(&pool, start, end).unwrap().len(), 1);
        assert_eq!(
            storage::classifications_in_window(&pool, start, end).unwrap().len(),
            2
        );
    }
}
