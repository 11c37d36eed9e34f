//! Similarity-weighted nearest-case classifier.
//!
//! Each supporting case votes for its category with its similarity score;
//! votes are normalized into per-category probabilities and the winning
//! category's probability is scaled by its best supporter's similarity. No
//! model service needed, fully deterministic.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use uuid::Uuid;

use super::{Classifier, ClassifyError};
use crate::index::ScoredCase;
use crate::model::{Category, Classification, Event};

pub struct NearestCaseClassifier {
    /// Below this the category resolves to `unknown`.
    min_confidence: f64,
}

impl NearestCaseClassifier {
    pub fn new(min_confidence: f64) -> Self {
        Self {
            min_confidence: min_confidence.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl Classifier for NearestCaseClassifier {
    fn version(&self) -> &str {
        "nearest-v1"
    }

    async fn classify(
        &self,
        event: &Event,
        support: &[ScoredCase],
    ) -> Result<Classification, ClassifyError> {
        // Negative cosine means "actively dissimilar"; those cases neither
        // vote nor count as support.
        let voters: Vec<&ScoredCase> = support.iter().filter(|s| s.score > 0.0).collect();

        let mut weights: HashMap<Category, f64> = HashMap::new();
        let mut best_similarity: HashMap<Category, f64> = HashMap::new();
        for s in &voters {
            *weights.entry(s.case.category).or_insert(0.0) += s.score as f64;
            let best = best_similarity.entry(s.case.category).or_insert(0.0);
            if (s.score as f64) > *best {
                *best = s.score as f64;
            }
        }
        let total: f64 = weights.values().sum();

        let (category, confidence) = if total <= 0.0 {
            (Category::Unknown, 0.0)
        } else {
            let mut best_category = Category::Unknown;
            let mut best_prob = 0.0;
            for (cat, weight) in &weights {
                let prob = weight / total;
                // Deterministic winner on exact probability ties.
                if prob > best_prob
                    || (prob == best_prob && cat.to_string() < best_category.to_string())
                {
                    best_prob = prob;
                    best_category = *cat;
                }
            }
            let similarity = best_similarity.get(&best_category).copied().unwrap_or(0.0);
            let confidence = (best_prob * similarity).clamp(0.0, 1.0);
            if confidence < self.min_confidence {
                (Category::Unknown, confidence)
            } else {
                (best_category, confidence)
            }
        };

        Ok(Classification {
            id: Uuid::new_v4(),
            event_id: event.id.clone(),
            category,
            confidence,
            supporting_cases: voters.iter().map(|s| s.case.id.clone()).collect(),
            model_version: self.version().to_string(),
            created_at: Utc::now(),
        })
    }
}
