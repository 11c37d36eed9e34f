//! Event classification against a fixed category set.

pub mod nearest;

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

pub use self::nearest::NearestCaseClassifier;
use crate::index::ScoredCase;
use crate::model::{Category, Classification, Event};

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classification backend unavailable: {0}")]
    Backend(String),
    #[error("classification request timed out after {0:?}")]
    Timeout(Duration),
}

impl ClassifyError {
    /// Availability failures are retryable. Low confidence is never an
    /// error: it resolves to the `unknown` category instead, because the
    /// pipeline must not stall on ambiguous input.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Produces a [`Classification`] for an event given retrieved support.
/// Implementations must be deterministic for fixed event text, support set,
/// and version string.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn version(&self) -> &str;

    async fn classify(
        &self,
        event: &Event,
        support: &[ScoredCase],
    ) -> Result<Classification, ClassifyError>;
}

/// Test stub: always returns the configured category and confidence,
/// referencing every supporting case it was handed.
pub struct FixedClassifier {
    pub category: Category,
    pub confidence: f64,
}

#[async_trait]
impl Classifier for FixedClassifier {
    fn version(&self) -> &str {
        "fixed-stub"
    }

    async fn classify(
        &self,
        event: &Event,
        support: &[ScoredCase],
    ) -> Result<Classification, ClassifyError> {
        Ok(Classification {
            id: Uuid::new_v4(),
            event_id: event.id.clone(),
            category: self.category,
            confidence: self.confidence,
            supporting_cases: support.iter().map(|s| s.case.id.clone()).collect(),
            model_version: self.version().to_string(),
            created_at: Utc::now(),
        })
    }
}
