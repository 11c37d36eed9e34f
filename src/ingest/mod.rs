//! Event normalization -- raw upstream records to canonical [`Event`]s.
//!
//! The upstream wire format is whatever the monitoring export produced; we
//! accept loosely-typed JSON objects (from JSON-lines files, CSV rows, or the
//! ingest API) and fold the common header spellings into one schema.

pub mod source;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

use crate::model::{parse_duration_secs, Event, SeverityTier};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("raw record is not a JSON object")]
    NotAnObject,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unparseable timestamp: '{0}'")]
    BadTimestamp(String),
}

/// Pure transform from a raw record to a canonical event.
pub struct Normalizer {
    /// Tag recorded as the event source when the record itself has none.
    default_source: String,
}

impl Normalizer {
    pub fn new(default_source: impl Into<String>) -> Self {
        Self {
            default_source: default_source.into(),
        }
    }

    /// Normalize one raw record. Required fields: identifier, timestamp,
    /// description. Everything else is optional.
    pub fn normalize(&self, raw: &serde_json::Value) -> Result<Event, ValidationError> {
        let obj = raw.as_object().ok_or(ValidationError::NotAnObject)?;

        let id = first_string(obj, &["id", "event_id", "Id", "ID", "EventId"])
            .ok_or(ValidationError::MissingField("id"))?;
        let ts_raw = first_string(obj, &["timestamp", "time", "Time", "Timestamp"])
            .ok_or(ValidationError::MissingField("timestamp"))?;
        let description = first_string(obj, &["description", "Description", "message", "Message"])
            .ok_or(ValidationError::MissingField("description"))?;

        let timestamp = parse_timestamp(&ts_raw)?;

        let raw_severity = first_string(obj, &["severity", "Severity", "level", "Level"]);
        let severity = raw_severity.as_deref().map(SeverityTier::from_keyword);

        let duration_secs = first_string(obj, &["duration", "Duration"])
            .as_deref()
            .and_then(parse_duration_secs);

        let tags = obj
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| t.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Event {
            id,
            timestamp,
            description,
            source: first_string(obj, &["source", "Source"])
                .unwrap_or_else(|| self.default_source.clone()),
            host: first_string(obj, &["host", "Host"]),
            service: first_string(obj, &["service", "Service"]),
            severity,
            raw_severity,
            duration_secs,
            tags,
        })
    }
}

fn first_string(
    obj: &serde_json::Map<String, serde_json::Value>,
    keys: &[&str],
) -> Option<String> {
    for key in keys {
        match obj.get(*key) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {
                return Some(s.trim().to_string());
            }
            Some(serde_json::Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Accept RFC3339 plus the space-separated formats monitoring CSV exports use.
/// Naive timestamps are taken as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(ValidationError::BadTimestamp(raw.to_string()))
}
