//! Embedding backends.
//!
//! The local feature-hashing embedder is the compiled-in default so the
//! pipeline works with no network dependency; the remote backend speaks the
//! usual JSON batch contract of hosted embedding services.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::EmbeddingError;
use crate::config::EmbeddingConfig;

/// A text-to-vector backend. Implementations must be deterministic for a
/// fixed version string so classifications stay reproducible.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier stored alongside vectors; bump it when output changes.
    fn version(&self) -> &str;

    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

// ---------------------------------------------------------------------------
// Local feature-hashing embedder
// ---------------------------------------------------------------------------

/// Deterministic signed feature hashing over lowercase word tokens.
/// Not a language model, but stable, offline, and good enough for
/// duplicate-shaped operational text ("disk full" vs "disk full error").
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }
}

// FNV-1a; DefaultHasher is not stable across Rust releases, stored vectors
// must be.
fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn version(&self) -> &str {
        "hash-v1"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a(token);
            let bucket = (h % self.dimension as u64) as usize;
            // High bit as sign keeps colliding tokens from only accumulating.
            let sign = if h & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        Ok(vector)
    }
}

// ---------------------------------------------------------------------------
// Remote HTTP embedder
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Remote embedding service client. Timeouts and connection failures are
/// retryable; malformed payloads are not.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    endpoint: String,
    dimension: usize,
    timeout: Duration,
}

impl RemoteEmbedder {
    pub fn new(cfg: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let timeout = Duration::from_secs(cfg.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: cfg.endpoint.clone(),
            dimension: cfg.dimension,
            timeout,
        })
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn version(&self) -> &str {
        "remote-v1"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest { texts: vec![text] })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmbeddingError::Timeout(self.timeout)
                } else {
                    EmbeddingError::Backend(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(EmbeddingError::Backend(format!(
                "embedding service returned {}",
                response.status()
            )));
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::BadResponse(e.to_string()))?;

        let vector = body
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::BadResponse("empty embeddings array".to_string()))?;

        if vector.len() != self.dimension {
            return Err(EmbeddingError::BadResponse(format!(
                "expected {} dimensions, got {}",
                self.dimension,
                vector.len()
            )));
        }
        Ok(vector)
    }
}
