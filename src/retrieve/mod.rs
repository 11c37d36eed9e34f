//! Similarity retrieval -- rank historical cases against an incoming event.

use std::sync::Arc;

use thiserror::Error;

use crate::index::{CaseIndex, Embedder, EmbeddingError, ScoredCase};
use crate::model::Event;

#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

impl RetrieveError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RetrieveError::InvalidArgument(_) => false,
            RetrieveError::Embedding(e) => e.is_retryable(),
        }
    }
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<CaseIndex>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<CaseIndex>) -> Self {
        Self { embedder, index }
    }

    /// Embed the event text and return the k most similar cases, descending
    /// by score with ties broken by most recent case. An empty index yields
    /// an empty list, not an error.
    pub async fn retrieve(&self, event: &Event, k: usize) -> Result<Vec<ScoredCase>, RetrieveError> {
        if k == 0 {
            return Err(RetrieveError::InvalidArgument("k must be positive"));
        }
        if self.index.is_empty().await {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed(&event.embed_text()).await?;
        Ok(self.index.nearest(&query, k).await)
    }
}
