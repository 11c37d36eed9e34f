//! Canonical data model -- events, cases, classifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown category '{0}'")]
    UnknownCategory(String),
}

/// Fixed category set for event classification.
/// Extending this enum is an explicit migration, not a runtime concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Fault,
    Performance,
    Security,
    UserBehavior,
    Unknown,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Fault,
        Category::Performance,
        Category::Security,
        Category::UserBehavior,
        Category::Unknown,
    ];
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Fault => write!(f, "fault"),
            Category::Performance => write!(f, "performance"),
            Category::Security => write!(f, "security"),
            Category::UserBehavior => write!(f, "user_behavior"),
            Category::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for Category {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fault" => Ok(Category::Fault),
            "performance" => Ok(Category::Performance),
            "security" => Ok(Category::Security),
            "user_behavior" => Ok(Category::UserBehavior),
            "unknown" => Ok(Category::Unknown),
            other => Err(ModelError::UnknownCategory(other.to_string())),
        }
    }
}

/// Severity tier after folding the free-form strings monitoring systems emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityTier {
    Critical,
    Warning,
    Info,
}

impl SeverityTier {
    pub const ALL: [SeverityTier; 3] = [
        SeverityTier::Critical,
        SeverityTier::Warning,
        SeverityTier::Info,
    ];

    /// Fold a raw severity keyword into a tier. Unrecognized values land in
    /// Info, matching how "not classified" is treated upstream.
    pub fn from_keyword(raw: &str) -> SeverityTier {
        match raw.trim().to_lowercase().as_str() {
            "disaster" | "high" | "fatal" | "critical" | "error" => SeverityTier::Critical,
            "average" | "warning" | "major" | "medium" => SeverityTier::Warning,
            _ => SeverityTier::Info,
        }
    }
}

impl std::fmt::Display for SeverityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeverityTier::Critical => write!(f, "critical"),
            SeverityTier::Warning => write!(f, "warning"),
            SeverityTier::Info => write!(f, "info"),
        }
    }
}

/// A single normalized operational event. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Upstream identifier; unique across the event stream.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    /// Tag identifying the upstream monitoring system.
    pub source: String,
    pub host: Option<String>,
    pub service: Option<String>,
    pub severity: Option<SeverityTier>,
    /// Original severity string before tier folding, kept for audit.
    pub raw_severity: Option<String>,
    /// Parsed event duration, when the upstream record carried one.
    pub duration_secs: Option<u64>,
    pub tags: Vec<String>,
}

impl Event {
    /// Text used for embedding and similarity matching.
    pub fn embed_text(&self) -> String {
        let mut text = self.description.clone();
        if let Some(service) = &self.service {
            text.push(' ');
            text.push_str(service);
        }
        for tag in &self.tags {
            text.push(' ');
            text.push_str(tag);
        }
        text
    }
}

/// A resolved historical event with its resolution narrative and category.
/// Read-only once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: String,
    pub event: Event,
    pub resolution: String,
    pub category: Category,
}

impl Case {
    pub fn embed_text(&self) -> String {
        let mut text = self.event.embed_text();
        if !self.resolution.is_empty() {
            text.push(' ');
            text.push_str(&self.resolution);
        }
        text
    }
}

/// The categorical judgment produced for one event. Never mutated;
/// re-classification writes a new record so audit history survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub id: uuid::Uuid,
    pub event_id: String,
    pub category: Category,
    /// In [0, 1].
    pub confidence: f64,
    /// Ids of the cases that supported this judgment. May be empty; must
    /// never reference a case that does not exist.
    pub supporting_cases: Vec<String>,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
}

/// Parse duration strings like "2d 3h", "1h 30m", "45m", "90s" into seconds.
/// Returns None when nothing parseable is present.
pub fn parse_duration_secs(raw: &str) -> Option<u64> {
    let mut total: u64 = 0;
    let mut matched = false;
    for part in raw.split_whitespace() {
        let (value, unit) = part.split_at(part.len().saturating_sub(1));
        let multiplier = match unit {
            "d" => 86_400,
            "h" => 3_600,
            "m" => 60,
            "s" => 1,
            _ => continue,
        };
        if let Ok(n) = value.parse::<u64>() {
            total += n * multiplier;
            matched = true;
        }
    }
    if matched {
        Some(total)
    } else {
        None
    }
}

/// Human-readable rendering of a duration in seconds.
pub fn format_duration_secs(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3_600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h {}m", secs / 3_600, (secs % 3_600) / 60)
    } else {
        format!("{}d {}h", secs / 86_400, (secs % 86_400) / 3_600)
    }
}
