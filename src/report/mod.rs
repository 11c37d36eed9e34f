//! Report aggregation -- periodic trend summaries over classified events.

pub mod render;
pub mod runner;
pub mod trend;

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Category, Classification, Event, SeverityTier};

/// Half-open aggregation window [start, end).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The window of `minutes` length ending at `end`.
    pub fn ending_at(end: DateTime<Utc>, minutes: i64) -> Self {
        Self {
            start: end - Duration::minutes(minutes),
            end,
        }
    }

    /// The most recent tumbling window of `minutes` whose watermark has
    /// passed. Window ends are aligned to multiples of the window length
    /// from the epoch, so repeated runs keep targeting the same window until
    /// the next one closes -- that is what lets a re-run detect "already
    /// reported" instead of carving out a fresh overlapping window.
    pub fn latest_final(minutes: i64, late_grace_secs: i64, now: DateTime<Utc>) -> Self {
        let span = minutes.max(1) * 60;
        let horizon = (now - Duration::seconds(late_grace_secs)).timestamp();
        let end_secs = horizon.div_euclid(span) * span;
        let end = DateTime::from_timestamp(end_secs, 0).unwrap_or(now);
        Self::ending_at(end, minutes)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn previous(&self) -> Self {
        let length = self.end - self.start;
        Self {
            start: self.start - length,
            end: self.start,
        }
    }

    /// Whether this window may be finalized: the watermark has passed once
    /// `late_grace` has elapsed after the window end.
    pub fn is_final(&self, late_grace_secs: i64, now: DateTime<Utc>) -> bool {
        now >= self.end + Duration::seconds(late_grace_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// Produced by the regular schedule once a window is final.
    Scheduled,
    /// Produced when classifications arrive after the window's scheduled
    /// report was already published. Never mutates the original.
    Correction,
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportKind::Scheduled => write!(f, "scheduled"),
            ReportKind::Correction => write!(f, "correction"),
        }
    }
}

/// Immutable aggregate summary of one window. Counts always cover every
/// category, zeros included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub kind: ReportKind,
    pub window: Window,
    pub total: u64,
    pub category_counts: BTreeMap<String, u64>,
    pub severity_counts: BTreeMap<String, u64>,
    /// Ids of the classifications this report aggregates, sorted for
    /// determinism.
    pub contributing: Vec<Uuid>,
    pub top_hosts: Vec<(String, u64)>,
    pub top_patterns: Vec<(String, u64)>,
    pub peak_hour: Option<u32>,
    pub avg_duration_secs: Option<u64>,
    pub max_duration_secs: Option<u64>,
    /// Classification total of the preceding window, for trend direction.
    pub previous_total: Option<u64>,
    pub change_rate_pct: Option<f64>,
    /// Events that failed the pipeline in this window (dead-lettered).
    pub failed: u64,
    pub generated_at: DateTime<Utc>,
}

/// Window-level enrichment beyond the classification list itself.
#[derive(Debug, Default)]
pub struct WindowContext<'a> {
    /// Events of the window, for host/pattern/severity/duration statistics.
    pub events: &'a [Event],
    /// Dead-lettered event count for the window.
    pub failed: u64,
    /// Classification total of the previous window, when known.
    pub previous_total: Option<u64>,
}

pub struct Aggregator {
    top_n: usize,
}

impl Aggregator {
    pub fn new(top_n: usize) -> Self {
        Self { top_n: top_n.max(1) }
    }

    /// Aggregate classifications into a report. Deterministic and
    /// order-independent; an empty input yields a report with every count
    /// at zero, not an error.
    pub fn aggregate(&self, classifications: &[Classification], window: Window) -> Report {
        self.aggregate_with_context(classifications, window, &WindowContext::default())
    }

    pub fn aggregate_with_context(
        &self,
        classifications: &[Classification],
        window: Window,
        ctx: &WindowContext<'_>,
    ) -> Report {
        let mut category_counts: BTreeMap<String, u64> = Category::ALL
            .iter()
            .map(|c| (c.to_string(), 0))
            .collect();
        for c in classifications {
            *category_counts.entry(c.category.to_string()).or_insert(0) += 1;
        }
        let total = classifications.len() as u64;
        let mut contributing: Vec<Uuid> = classifications.iter().map(|c| c.id).collect();
        contributing.sort();

        let mut severity_counts: BTreeMap<String, u64> = SeverityTier::ALL
            .iter()
            .map(|t| (t.to_string(), 0))
            .collect();
        let mut host_counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut pattern_counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut hour_counts: BTreeMap<u32, u64> = BTreeMap::new();
        let mut durations: Vec<u64> = Vec::new();

        for event in ctx.events {
            let tier = event.severity.unwrap_or(SeverityTier::Info);
            *severity_counts.entry(tier.to_string()).or_insert(0) += 1;
            if let Some(host) = &event.host {
                *host_counts.entry(host.clone()).or_insert(0) += 1;
            }
            *pattern_counts
                .entry(pattern_key(&event.description))
                .or_insert(0) += 1;
            *hour_counts.entry(event.timestamp.hour()).or_insert(0) += 1;
            if let Some(d) = event.duration_secs {
                durations.push(d);
            }
        }

        let peak_hour = hour_counts
            .iter()
            // max_by_key returns the last max; iterate explicitly so the
            // earliest peak hour wins on ties.
            .fold(None::<(u32, u64)>, |acc, (&hour, &count)| match acc {
                Some((_, best)) if count <= best => acc,
                _ => Some((hour, count)),
            })
            .map(|(hour, _)| hour);

        let avg_duration_secs = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<u64>() / durations.len() as u64)
        };
        let max_duration_secs = durations.iter().max().copied();

        let change_rate_pct = match ctx.previous_total {
            Some(prev) if prev > 0 => {
                Some((total as f64 - prev as f64) / prev as f64 * 100.0)
            }
            _ => None,
        };

        Report {
            id: Uuid::new_v4(),
            kind: ReportKind::Scheduled,
            window,
            total,
            category_counts,
            severity_counts,
            contributing,
            top_hosts: top_n_of(host_counts, self.top_n),
            top_patterns: top_n_of(pattern_counts, self.top_n),
            peak_hour,
            avg_duration_secs,
            max_duration_secs,
            previous_total: ctx.previous_total,
            change_rate_pct,
            failed: ctx.failed,
            generated_at: Utc::now(),
        }
    }
}

/// Fold a free-text description into a recurrence pattern: lowercase, runs
/// of digits collapsed, so "disk sda1 97% full" and "disk sda1 99% full"
/// count as one pattern.
fn pattern_key(description: &str) -> String {
    let mut key = String::with_capacity(description.len());
    let mut last_digit = false;
    for c in description.to_lowercase().chars() {
        if c.is_ascii_digit() {
            if !last_digit {
                key.push('#');
                last_digit = true;
            }
        } else {
            key.push(c);
            last_digit = false;
        }
    }
    key.trim().to_string()
}

/// Top-n entries by count descending, name ascending on equal counts.
/// BTreeMap input keeps the result independent of insertion order.
fn top_n_of(counts: BTreeMap<String, u64>, n: usize) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(n);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> Window {
        Window::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap(),
        )
    }

    fn classification(event_id: &str, category: Category) -> Classification {
        Classification {
            id: Uuid::new_v4(),
            event_id: event_id.to_string(),
            category,
            confidence: 0.9,
            supporting_cases: Vec::new(),
            model_version: "nearest-v1".to_string(),
            created_at: Utc::now(),
        }
    }

    fn event(id: &str, host: &str, description: &str, minute: u32) -> Event {
        Event {
            id: id.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 2, 10, minute, 0).unwrap(),
            description: description.to_string(),
            source: "test".to_string(),
            host: Some(host.to_string()),
            service: None,
            severity: Some(SeverityTier::Critical),
            raw_severity: Some("High".to_string()),
            duration_secs: Some(600),
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_empty_window_yields_zero_report() {
        let report = Aggregator::new(10).aggregate(&[], window());
        assert_eq!(report.total, 0);
        assert_eq!(report.category_counts.len(), Category::ALL.len());
        assert!(report.category_counts.values().all(|&v| v == 0));
        assert_eq!(report.failed, 0);
        assert!(report.top_hosts.is_empty());
    }

    #[test]
    fn test_category_counts_sum_to_total() {
        let classifications = vec![
            classification("1", Category::Fault),
            classification("2", Category::Fault),
            classification("3", Category::Performance),
            classification("4", Category::Unknown),
        ];
        let report = Aggregator::new(10).aggregate(&classifications, window());
        assert_eq!(report.total, 4);
        let sum: u64 = report.category_counts.values().sum();
        assert_eq!(sum, report.total);
        assert_eq!(report.category_counts["fault"], 2);
        assert_eq!(report.category_counts["performance"], 1);
        assert_eq!(report.category_counts["unknown"], 1);
        assert_eq!(report.category_counts["security"], 0);
        assert_eq!(report.contributing.len(), 4);
    }

    #[test]
    fn test_order_independent() {
        let mut classifications = vec![
            classification("1", Category::Fault),
            classification("2", Category::Performance),
            classification("3", Category::Security),
        ];
        let events = vec![
            event("1", "db01", "disk sda1 97% full", 5),
            event("2", "web02", "disk sdb2 99% full", 10),
            event("3", "db01", "slow response", 15),
        ];
        let ctx = WindowContext {
            events: &events,
            failed: 1,
            previous_total: Some(2),
        };
        let agg = Aggregator::new(5);
        let a = agg.aggregate_with_context(&classifications, window(), &ctx);
        classifications.reverse();
        let b = agg.aggregate_with_context(&classifications, window(), &ctx);

        assert_eq!(a.category_counts, b.category_counts);
        assert_eq!(a.top_hosts, b.top_hosts);
        assert_eq!(a.top_patterns, b.top_patterns);
        assert_eq!(a.peak_hour, b.peak_hour);
    }

    #[test]
    fn test_patterns_collapse_numbers_and_hosts_ranked() {
        let events = vec![
            event("1", "db01", "disk sda1 97% full", 1),
            event("2", "db01", "disk sda1 99% full", 2),
            event("3", "web02", "slow response", 3),
        ];
        let ctx = WindowContext {
            events: &events,
            ..Default::default()
        };
        let report = Aggregator::new(5).aggregate_with_context(&[], window(), &ctx);

        assert_eq!(report.top_patterns[0], ("disk sda# #% full".to_string(), 2));
        assert_eq!(report.top_hosts[0], ("db01".to_string(), 2));
        assert_eq!(report.avg_duration_secs, Some(600));
        assert_eq!(report.max_duration_secs, Some(600));
        assert_eq!(report.peak_hour, Some(10));
    }

    #[test]
    fn test_change_rate_against_previous_window() {
        let classifications = vec![
            classification("1", Category::Fault),
            classification("2", Category::Fault),
            classification("3", Category::Fault),
        ];
        let ctx = WindowContext {
            events: &[],
            failed: 0,
            previous_total: Some(2),
        };
        let report = Aggregator::new(5).aggregate_with_context(&classifications, window(), &ctx);
        assert_eq!(report.previous_total, Some(2));
        assert!((report.change_rate_pct.unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_watermark() {
        let w = window();
        assert!(!w.is_final(120, w.end));
        assert!(!w.is_final(120, w.end + Duration::seconds(119)));
        assert!(w.is_final(120, w.end + Duration::seconds(120)));
    }

    #[test]
    fn test_latest_final_is_tumbling_not_sliding() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 31, 40).unwrap();
        let w = Window::latest_final(60, 120, now);
        assert_eq!(w.start, Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap());
        assert_eq!(w.end, Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap());
        assert!(w.is_final(120, now));

        // Moments later the same window comes back, not a shifted one.
        let again = Window::latest_final(60, 120, now + Duration::seconds(7));
        assert_eq!(again, w);

        // Grace holds a just-closed window back until its watermark passes.
        let at_boundary = Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, 30).unwrap();
        let held = Window::latest_final(60, 120, at_boundary);
        assert_eq!(held, w);
        let released = Window::latest_final(60, 120, at_boundary + Duration::seconds(90));
        assert_eq!(released.end, Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, 0).unwrap());
    }

    #[test]
    fn test_pattern_key() {
        assert_eq!(pattern_key("CPU at 97%"), "cpu at #%");
        assert_eq!(pattern_key("disk sda1 full"), "disk sda# full");
    }
}
