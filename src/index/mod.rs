//! Case index -- vector store over historical cases.
//!
//! Vectors live in SQLite (`case_vectors`) for durability and in an in-memory
//! table for queries. The memory table is keyed by stable case id so the
//! whole index can be rebuilt without touching classification history.

pub mod embedder;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub use self::embedder::{Embedder, HashEmbedder, RemoteEmbedder};
use crate::model::Case;
use crate::storage::{self, Pool};

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding backend unreachable: {0}")]
    Backend(String),
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),
    #[error("embedding backend returned bad payload: {0}")]
    BadResponse(String),
}

impl EmbeddingError {
    /// Backend and timeout failures deserve a retry with backoff;
    /// a malformed payload will not improve on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbeddingError::Backend(_) | EmbeddingError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error("index storage failure: {0}")]
    Storage(#[from] anyhow::Error),
}

impl IndexError {
    pub fn is_retryable(&self) -> bool {
        match self {
            IndexError::Embedding(e) => e.is_retryable(),
            IndexError::Storage(_) => false,
        }
    }
}

pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// A case with its similarity score against some query.
#[derive(Debug, Clone)]
pub struct ScoredCase {
    pub case: Case,
    pub score: f32,
}

/// In-memory vector table. Single writer, many readers: mutation goes
/// through the write lock, queries share the read lock.
pub struct CaseIndex {
    entries: RwLock<HashMap<String, (Case, Vec<f32>)>>,
}

impl Default for CaseIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CaseIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or overwrite the vector for a case id. Overwriting is what
    /// makes re-indexing idempotent.
    pub async fn insert(&self, case: Case, vector: Vec<f32>) {
        let normalized = l2_normalize(vector);
        let mut entries = self.entries.write().await;
        entries.insert(case.id.clone(), (case, normalized));
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Top-k cases by cosine similarity, descending. Ties break toward the
    /// most recent case timestamp, then id for full determinism.
    pub async fn nearest(&self, query: &[f32], k: usize) -> Vec<ScoredCase> {
        let query = l2_normalize(query.to_vec());
        let entries = self.entries.read().await;

        let mut scored: Vec<ScoredCase> = entries
            .values()
            .map(|(case, vector)| ScoredCase {
                case: case.clone(),
                score: dot(&query, vector),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.case.event.timestamp.cmp(&a.case.event.timestamp))
                .then_with(|| a.case.id.cmp(&b.case.id))
        });
        scored.truncate(k);
        scored
    }
}

/// Maintains the durable and in-memory views of the case index.
pub struct Indexer {
    embedder: Arc<dyn Embedder>,
    index: Arc<CaseIndex>,
    pool: Pool,
}

impl Indexer {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<CaseIndex>, pool: Pool) -> Self {
        Self {
            embedder,
            index,
            pool,
        }
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    pub fn index(&self) -> Arc<CaseIndex> {
        Arc::clone(&self.index)
    }

    /// Index one case: embed its text, persist the vector, then publish it to
    /// the in-memory table. All-or-nothing per case -- an embedding failure
    /// leaves both views untouched.
    pub async fn index_case(&self, case: &Case) -> Result<(), IndexError> {
        let vector = self.embedder.embed(&case.embed_text()).await?;

        storage::save_case(&self.pool, case)?;
        storage::upsert_case_vector(&self.pool, &case.id, &vector, self.embedder.version())?;
        self.index.insert(case.clone(), vector).await;
        Ok(())
    }

    /// Load persisted vectors into the in-memory table. Vectors produced by a
    /// different embedder version are not comparable to fresh queries, so
    /// they are skipped with a warning; run [`Indexer::reindex_all`] to bring
    /// them back under the current embedder.
    pub async fn warm_load(&self) -> Result<usize, IndexError> {
        let stored = storage::load_indexed_cases(&self.pool)?;
        let mut loaded = 0;
        let mut stale = 0;
        for (case, vector, version) in stored {
            if version != self.embedder.version() {
                stale += 1;
                continue;
            }
            self.index.insert(case, vector).await;
            loaded += 1;
        }
        if stale > 0 {
            warn!(
                stale,
                expected = self.embedder.version(),
                "skipped vectors from another embedder version; reindex to restore them"
            );
        }
        info!(cases = loaded, "case index warmed from storage");
        Ok(loaded)
    }

    /// Re-embed and re-persist every stored case, e.g. after switching the
    /// embedding backend.
    pub async fn reindex_all(&self) -> Result<usize, IndexError> {
        let cases = storage::list_cases(&self.pool)?;
        let total = cases.len();
        for case in &cases {
            self.index_case(case).await?;
        }
        info!(cases = total, "full reindex complete");
        Ok(total)
    }
}
