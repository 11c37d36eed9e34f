//! Report publication -- loads a window's data, aggregates, and persists.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::info;

use super::{Aggregator, Report, ReportKind, Window, WindowContext};
use crate::storage::{self, Pool};

pub struct ReportRunner {
    pool: Pool,
    aggregator: Aggregator,
    late_grace_secs: i64,
}

impl ReportRunner {
    pub fn new(pool: Pool, top_n: usize, late_grace_secs: i64) -> Self {
        Self {
            pool,
            aggregator: Aggregator::new(top_n),
            late_grace_secs,
        }
    }

    /// Whether the window's watermark has passed.
    pub fn window_is_final(&self, window: Window, now: DateTime<Utc>) -> bool {
        window.is_final(self.late_grace_secs, now)
    }

    /// Publish a report for `window` if there is anything to say.
    ///
    /// First publication for a window is a scheduled report. If a scheduled
    /// report already exists, a new one is published only when classifications
    /// arrived after it, and then as a correction; the original stays as
    /// published. Returns the report when one was produced.
    pub fn publish_window_report(&self, window: Window) -> Result<Option<Report>> {
        let existing = storage::report_for_window(&self.pool, window.start, window.end)?;

        let kind = match &existing {
            None => ReportKind::Scheduled,
            Some(prior) => {
                let late = storage::classifications_in_window_after(
                    &self.pool,
                    window.start,
                    window.end,
                    prior.generated_at,
                )?;
                if late.is_empty() {
                    return Ok(None);
                }
                ReportKind::Correction
            }
        };

        let classifications =
            storage::classifications_in_window(&self.pool, window.start, window.end)?;
        let events = storage::events_in_window(&self.pool, window.start, window.end)?;
        let failed = storage::dead_letter_count(&self.pool, window.start, window.end)?;
        let previous = window.previous();
        let previous_total = storage::classifications_in_window(
            &self.pool,
            previous.start,
            previous.end,
        )?
        .len() as u64;

        let ctx = WindowContext {
            events: &events,
            failed,
            // A zero previous window means no baseline for a change rate.
            previous_total: (previous_total > 0).then_some(previous_total),
        };

        let mut report = self
            .aggregator
            .aggregate_with_context(&classifications, window, &ctx);
        report.kind = kind;

        storage::save_report(&self.pool, &report)?;
        info!(
            kind = %report.kind,
            window_start = %window.start,
            total = report.total,
            failed = report.failed,
            "published report"
        );
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, Classification, Event};
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn runner() -> (ReportRunner, Pool) {
        let pool = storage::open_memory_pool().unwrap();
        (ReportRunner::new(pool.clone(), 10, 120), pool)
    }

    fn window() -> Window {
        Window::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap(),
        )
    }

    fn store_classified_event(
        pool: &Pool,
        id: &str,
        ts: chrono::DateTime<Utc>,
        created_at: chrono::DateTime<Utc>,
    ) {
        let event = Event {
            id: id.to_string(),
            timestamp: ts,
            description: "disk full".to_string(),
            source: "test".to_string(),
            host: Some("db01".to_string()),
            service: None,
            severity: None,
            raw_severity: None,
            duration_secs: None,
            tags: Vec::new(),
        };
        storage::save_event(pool, &event).unwrap();
        let c = Classification {
            id: Uuid::new_v4(),
            event_id: id.to_string(),
            category: Category::Fault,
            confidence: 0.9,
            supporting_cases: Vec::new(),
            model_version: "nearest-v1".to_string(),
            created_at,
        };
        storage::save_classification(pool, &c, ts).unwrap();
    }

    #[test]
    fn test_first_publication_is_scheduled() {
        let (runner, pool) = runner();
        let w = window();
        store_classified_event(&pool, "1", w.start + Duration::minutes(5), w.end);

        let report = runner.publish_window_report(w).unwrap().unwrap();
        assert_eq!(report.kind, ReportKind::Scheduled);
        assert_eq!(report.total, 1);
        assert_eq!(report.category_counts["fault"], 1);
    }

    #[test]
    fn test_no_duplicate_without_late_arrivals() {
        let (runner, pool) = runner();
        let w = window();
        store_classified_event(&pool, "1", w.start + Duration::minutes(5), w.end);

        assert!(runner.publish_window_report(w).unwrap().is_some());
        assert!(runner.publish_window_report(w).unwrap().is_none());
        assert_eq!(storage::list_reports(&pool, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_late_arrival_publishes_correction() {
        let (runner, pool) = runner();
        let w = window();
        store_classified_event(&pool, "1", w.start + Duration::minutes(5), w.end);
        let first = runner.publish_window_report(w).unwrap().unwrap();

        // A classification recorded after the scheduled report went out.
        store_classified_event(
            &pool,
            "2",
            w.start + Duration::minutes(50),
            first.generated_at + Duration::minutes(3),
        );
        let correction = runner.publish_window_report(w).unwrap().unwrap();
        assert_eq!(correction.kind, ReportKind::Correction);
        assert_eq!(correction.total, 2);

        // The original scheduled report is still on record, untouched.
        let stored = storage::report_for_window(&pool, w.start, w.end).unwrap().unwrap();
        assert_eq!(stored.id, correction.id);
        assert_eq!(storage::list_reports(&pool, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_empty_window_still_publishes_zero_report() {
        let (runner, _pool) = runner();
        let report = runner.publish_window_report(window()).unwrap().unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(report.kind, ReportKind::Scheduled);
    }

    #[test]
    fn test_previous_window_total_feeds_change_rate() {
        let (runner, pool) = runner();
        let w = window();
        let prev = w.previous();
        store_classified_event(&pool, "p1", prev.start + Duration::minutes(5), prev.end);
        store_classified_event(&pool, "c1", w.start + Duration::minutes(5), w.end);
        store_classified_event(&pool, "c2", w.start + Duration::minutes(6), w.end);

        let report = runner.publish_window_report(w).unwrap().unwrap();
        assert_eq!(report.previous_total, Some(1));
        assert!((report.change_rate_pct.unwrap() - 100.0).abs() < 1e-9);
    }
}
