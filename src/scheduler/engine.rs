//! Scheduler execution loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::cron::{JobSpec, Scheduler};
use crate::report::runner::ReportRunner;
use crate::report::trend::{TrendError, VolumeTrend};
use crate::report::Window;
use crate::storage;

/// Poll for due schedules every 10 seconds and run them. Never returns;
/// spawn it alongside the server.
pub async fn run_scheduler_loop(
    scheduler: Scheduler,
    runner: Arc<ReportRunner>,
    default_window_minutes: i64,
    late_grace_secs: i64,
) {
    info!("scheduler engine started");
    let mut interval = tokio::time::interval(Duration::from_secs(10));

    loop {
        interval.tick().await;
        let now = Utc::now();

        let due = match scheduler.due(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to check due schedules");
                continue;
            }
        };

        for entry in due {
            info!(schedule = %entry.name, job = %entry.job_type, "schedule due");

            // Stamp before execution so a slow job is not double-scheduled.
            if let Err(e) = scheduler.mark_run(&entry.name, now).await {
                error!(schedule = %entry.name, error = %e, "failed to stamp last run");
                continue;
            }

            let spec = match JobSpec::parse(&entry.job_type, default_window_minutes) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(schedule = %entry.name, error = %e, "unrunnable job spec");
                    let _ = scheduler
                        .record_history(&entry.name, "failed", Some(&e.to_string()), now)
                        .await;
                    continue;
                }
            };

            let scheduler = scheduler.clone();
            let runner = Arc::clone(&runner);
            tokio::spawn(async move {
                let result = execute_job(&scheduler, &runner, &spec, late_grace_secs, now).await;
                let (status, summary) = match &result {
                    Ok(summary) => ("ok", summary.clone()),
                    Err(e) => ("failed", e.to_string()),
                };
                if let Err(e) = scheduler
                    .record_history(&entry.name, status, Some(&summary), now)
                    .await
                {
                    error!(schedule = %entry.name, error = %e, "failed to record history");
                }
                match result {
                    Ok(summary) => info!(schedule = %entry.name, %summary, "job finished"),
                    Err(e) => error!(schedule = %entry.name, error = %e, "job failed"),
                }
            });
        }
    }
}

/// Run one job and return a one-line result summary for the history table.
pub async fn execute_job(
    scheduler: &Scheduler,
    runner: &ReportRunner,
    spec: &JobSpec,
    late_grace_secs: i64,
    now: DateTime<Utc>,
) -> Result<String> {
    match spec {
        JobSpec::Report { minutes } => {
            let window = Window::latest_final(*minutes, late_grace_secs, now);
            match runner.publish_window_report(window)? {
                Some(report) => Ok(format!(
                    "published {} report: {} classified, {} failed",
                    report.kind, report.total, report.failed
                )),
                None => Ok("window already reported, no late arrivals".to_string()),
            }
        }
        JobSpec::VolumeScan => {
            let trend = VolumeTrend::default();
            let counts =
                storage::daily_event_counts(scheduler.pool(), trend.baseline_days() as i64)?;
            // Key on the actual current date: a day with no events at all is
            // a zero bucket, not a day to skip.
            let today = now.format("%Y-%m-%d").to_string();
            match trend.assess(&counts, &today) {
                Err(TrendError::InsufficientBaseline { have, .. }) => Ok(format!(
                    "volume scan skipped: only {have} days of history"
                )),
                Ok(a) if a.anomalous => {
                    warn!(day = %a.day, count = a.count, z_score = a.z_score, "anomalous event volume");
                    Ok(format!(
                        "volume anomaly on {}: {} events, z={:.2}",
                        a.day, a.count, a.z_score
                    ))
                }
                Ok(a) => Ok(format!("volume normal on {}: z={:.2}", a.day, a.z_score)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, Classification, Event};
    use crate::storage::Pool;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn fixture() -> (Scheduler, Arc<ReportRunner>, Pool) {
        let pool = storage::open_memory_pool().unwrap();
        let scheduler = Scheduler::new(pool.clone());
        let runner = Arc::new(ReportRunner::new(pool.clone(), 10, 120));
        (scheduler, runner, pool)
    }

    fn store_event(pool: &Pool, id: &str, ts: DateTime<Utc>) {
        storage::save_event(
            pool,
            &Event {
                id: id.to_string(),
                timestamp: ts,
                description: "something happened".to_string(),
                source: "test".to_string(),
                host: None,
                service: None,
                severity: None,
                raw_severity: None,
                duration_secs: None,
                tags: Vec::new(),
            },
        )
        .unwrap();
    }

    fn store_classified(pool: &Pool, event_id: &str, ts: DateTime<Utc>, created_at: DateTime<Utc>) {
        store_event(pool, event_id, ts);
        storage::save_classification(
            pool,
            &Classification {
                id: uuid::Uuid::new_v4(),
                event_id: event_id.to_string(),
                category: Category::Fault,
                confidence: 0.9,
                supporting_cases: Vec::new(),
                model_version: "nearest-v1".to_string(),
                created_at,
            },
            ts,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_report_job_publishes_final_window() {
        let (scheduler, runner, pool) = fixture();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 30, 0).unwrap();
        let w = Window::latest_final(60, 120, now);
        store_classified(&pool, "ev-1", w.start + ChronoDuration::minutes(5), now);

        let spec = JobSpec::Report { minutes: 60 };
        let summary = execute_job(&scheduler, &runner, &spec, 120, now).await.unwrap();
        assert!(summary.contains("published scheduled report: 1 classified"));

        // Second run for the same window with no late arrivals is a no-op.
        let summary = execute_job(&scheduler, &runner, &spec, 120, now).await.unwrap();
        assert!(summary.contains("no late arrivals"));
    }

    #[tokio::test]
    async fn test_runs_moments_apart_target_the_same_window() {
        let (scheduler, runner, pool) = fixture();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 30, 0).unwrap();
        let w = Window::latest_final(60, 120, now);
        store_classified(&pool, "ev-1", w.start + ChronoDuration::minutes(5), now);

        // Two runs seconds apart must not each carve out an overlapping
        // window and double-publish the same classification.
        let spec = JobSpec::Report { minutes: 60 };
        let first = execute_job(&scheduler, &runner, &spec, 120, now).await.unwrap();
        assert!(first.contains("published scheduled report"));
        let second = execute_job(
            &scheduler,
            &runner,
            &spec,
            120,
            now + ChronoDuration::seconds(7),
        )
        .await
        .unwrap();
        assert!(second.contains("no late arrivals"));
        assert_eq!(storage::list_reports(&pool, 10).unwrap().len(), 1);

        // A straggler classified after publication triggers a correction for
        // that same window on the next run.
        store_classified(
            &pool,
            "ev-late",
            w.start + ChronoDuration::minutes(10),
            Utc::now() + ChronoDuration::seconds(1),
        );
        let third = execute_job(
            &scheduler,
            &runner,
            &spec,
            120,
            now + ChronoDuration::seconds(14),
        )
        .await
        .unwrap();
        assert!(third.contains("published correction report: 2 classified"));
    }

    #[tokio::test]
    async fn test_volume_scan_needs_baseline() {
        let (scheduler, runner, _pool) = fixture();
        let summary = execute_job(&scheduler, &runner, &JobSpec::VolumeScan, 120, Utc::now())
            .await
            .unwrap();
        assert!(summary.contains("skipped"));
    }

    #[tokio::test]
    async fn test_volume_scan_flags_spike() {
        let (scheduler, runner, pool) = fixture();
        let now = Utc::now();
        // Steady baseline of one event per day, then a burst today.
        for day in (1..8).rev() {
            store_event(&pool, &format!("base-{day}"), now - ChronoDuration::days(day));
        }
        for n in 0..20 {
            store_event(&pool, &format!("burst-{n}"), now - ChronoDuration::seconds(n));
        }

        let summary = execute_job(&scheduler, &runner, &JobSpec::VolumeScan, 120, now)
            .await
            .unwrap();
        assert!(summary.contains("anomaly"));
    }

    #[tokio::test]
    async fn test_volume_scan_flags_day_with_no_events() {
        let (scheduler, runner, pool) = fixture();
        let now = Utc::now();
        // Steady history, then total silence today: likely an ingestion or
        // platform outage, and exactly what the scan must not wave through.
        for day in (1..8).rev() {
            store_event(&pool, &format!("base-{day}"), now - ChronoDuration::days(day));
        }

        let summary = execute_job(&scheduler, &runner, &JobSpec::VolumeScan, 120, now)
            .await
            .unwrap();
        assert!(summary.contains("anomaly"));
        assert!(summary.contains("0 events"));
    }
}
