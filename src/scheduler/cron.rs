//! SQLite-backed cron schedule store.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use rusqlite::params;
use std::str::FromStr;

use crate::storage::Pool;

/// What a schedule runs when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSpec {
    /// Publish the report for the most recent final window of `minutes`.
    Report { minutes: i64 },
    /// Statistical scan of daily event volume.
    VolumeScan,
}

impl JobSpec {
    /// Parse the stored job string: `report`, `report:<minutes>`, `scan`.
    pub fn parse(raw: &str, default_window_minutes: i64) -> Result<Self> {
        match raw.split_once(':') {
            None if raw == "report" => Ok(JobSpec::Report {
                minutes: default_window_minutes,
            }),
            None if raw == "scan" => Ok(JobSpec::VolumeScan),
            Some(("report", minutes)) => {
                let minutes: i64 = minutes
                    .parse()
                    .with_context(|| format!("bad report window in job spec '{raw}'"))?;
                anyhow::ensure!(minutes > 0, "report window must be positive: '{raw}'");
                Ok(JobSpec::Report { minutes })
            }
            _ => anyhow::bail!("unknown job spec '{raw}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub name: String,
    pub cron_expr: String,
    pub job_type: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Persists schedules in SQLite and answers which are due.
#[derive(Clone)]
pub struct Scheduler {
    pool: Pool,
}

impl Scheduler {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Add a schedule. The cron expression and job spec are validated up
    /// front so a typo fails here, not at fire time.
    pub async fn add(&self, name: &str, cron_expr: &str, job_type: &str) -> Result<()> {
        CronSchedule::from_str(cron_expr)
            .map_err(|e| anyhow::anyhow!("invalid cron expression '{cron_expr}': {e}"))?;
        JobSpec::parse(job_type, 60)?;

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO schedules (name, cron_expr, job_type, enabled) VALUES (?1, ?2, ?3, 1)",
            params![name, cron_expr, job_type],
        )
        .context("failed to insert schedule")?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<ScheduleEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT name, cron_expr, job_type, enabled, last_run_at, created_at
             FROM schedules ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)? != 0,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for r in rows {
            let (name, cron_expr, job_type, enabled, last_run_at, created_at) = r?;
            out.push(ScheduleEntry {
                name,
                cron_expr,
                job_type,
                enabled,
                last_run_at: last_run_at.as_deref().and_then(parse_stored_ts),
                created_at: parse_stored_ts(&created_at).unwrap_or_else(Utc::now),
            });
        }
        Ok(out)
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM schedules WHERE name = ?1", params![name])?;
        anyhow::ensure!(changed > 0, "schedule '{name}' not found");
        Ok(())
    }

    /// Enabled schedules whose next fire time (after their last run) has
    /// passed. A schedule that has never run counts from its creation time.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>> {
        let mut due = Vec::new();
        for entry in self.list().await? {
            if !entry.enabled {
                continue;
            }
            let schedule = match CronSchedule::from_str(&entry.cron_expr) {
                Ok(s) => s,
                // Validated at insert; a corrupt row must not stall the loop.
                Err(_) => continue,
            };
            let basis = entry.last_run_at.unwrap_or(entry.created_at);
            if let Some(next) = schedule.after(&basis).next() {
                if next <= now {
                    due.push(entry);
                }
            }
        }
        Ok(due)
    }

    /// Stamp the last run. Done before execution so a slow job cannot be
    /// double-scheduled by the next poll tick.
    pub async fn mark_run(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE schedules SET last_run_at = ?2, updated_at = ?2 WHERE name = ?1",
            params![name, at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn record_history(
        &self,
        name: &str,
        status: &str,
        summary: Option<&str>,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO schedule_history (schedule_name, status, result_summary, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                status,
                summary,
                started_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Upcoming fire times within the next `hours`, sorted by time.
    /// Strictly a preview, not the execution loop.
    pub async fn preview_next_runs(&self, hours: u64) -> Result<Vec<(String, String, String)>> {
        let now = Utc::now();
        let end = now + chrono::Duration::hours(hours as i64);
        let mut preview = Vec::new();

        for entry in self.list().await? {
            if !entry.enabled {
                continue;
            }
            if let Ok(schedule) = CronSchedule::from_str(&entry.cron_expr) {
                for next in schedule.after(&now) {
                    if next > end {
                        break;
                    }
                    preview.push((next.to_rfc3339(), entry.name.clone(), entry.job_type.clone()));
                }
            }
        }
        preview.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(preview)
    }
}

fn parse_stored_ts(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // SQLite datetime('now') default: naive UTC.
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| chrono::TimeZone::from_utc_datetime(&Utc, &naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;

    fn scheduler() -> Scheduler {
        Scheduler::new(storage::open_memory_pool().unwrap())
    }

    #[tokio::test]
    async fn test_add_list_remove_cycle() {
        let s = scheduler();
        s.add("hourly-report", "0 0 * * * *", "report").await.unwrap();
        s.add("daily-scan", "0 0 3 * * *", "scan").await.unwrap();

        let list = s.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|e| e.enabled));
        assert!(list.iter().all(|e| e.last_run_at.is_none()));

        s.remove("daily-scan").await.unwrap();
        assert_eq!(s.list().await.unwrap().len(), 1);
        assert!(s.remove("daily-scan").await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected() {
        let s = scheduler();
        assert!(s.add("bad", "not a cron", "report").await.is_err());
        assert!(s.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_job_spec_rejected() {
        let s = scheduler();
        assert!(s.add("bad", "0 0 * * * *", "frobnicate").await.is_err());
        assert!(s.add("bad2", "0 0 * * * *", "report:zero").await.is_err());
    }

    #[tokio::test]
    async fn test_due_after_cron_boundary() {
        let s = scheduler();
        // Fires every second, so it is due almost immediately.
        s.add("tick", "* * * * * *", "scan").await.unwrap();

        let now = Utc::now() + chrono::Duration::seconds(2);
        let due = s.due(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "tick");

        // Marking the run pushes the next fire past `now`.
        s.mark_run("tick", now).await.unwrap();
        assert!(s.due(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preview_orders_by_time() {
        let s = scheduler();
        s.add("a", "0 * * * * *", "report").await.unwrap();
        s.add("b", "30 * * * * *", "scan").await.unwrap();

        let preview = s.preview_next_runs(1).await.unwrap();
        assert!(!preview.is_empty());
        for pair in preview.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
    }

    #[test]
    fn test_job_spec_parse() {
        assert_eq!(
            JobSpec::parse("report", 60).unwrap(),
            JobSpec::Report { minutes: 60 }
        );
        assert_eq!(
            JobSpec::parse("report:30", 60).unwrap(),
            JobSpec::Report { minutes: 30 }
        );
        assert_eq!(JobSpec::parse("scan", 60).unwrap(), JobSpec::VolumeScan);
        assert!(JobSpec::parse("report:-5", 60).is_err());
        assert!(JobSpec::parse("noop", 60).is_err());
    }
}
