//! SQLite storage layer -- schema, queries, migrations.

pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::model::{Case, Classification, Event, SeverityTier};
use crate::report::Report;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// In-memory pool for tests and one-shot CLI runs.
pub fn open_memory_pool() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory();
    let pool = R2D2Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("bad timestamp in database: {raw}"))
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub fn save_event(pool: &Pool, event: &Event) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR IGNORE INTO events
            (id, timestamp, description, source, host, service, severity,
             raw_severity, duration_secs, tags_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            event.id,
            event.timestamp.to_rfc3339(),
            event.description,
            event.source,
            event.host,
            event.service,
            event.severity.map(|s| s.to_string()),
            event.raw_severity,
            event.duration_secs,
            serde_json::to_string(&event.tags)?,
        ],
    )?;
    Ok(())
}

pub fn get_event(pool: &Pool, id: &str) -> Result<Option<Event>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, description, source, host, service, severity,
                raw_severity, duration_secs, tags_json
         FROM events WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map(params![id], event_from_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let ts_raw: String = row.get(1)?;
    let severity_raw: Option<String> = row.get(6)?;
    let tags_raw: String = row.get(9)?;
    Ok(Event {
        id: row.get(0)?,
        timestamp: DateTime::parse_from_rfc3339(&ts_raw)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
        description: row.get(2)?,
        source: row.get(3)?,
        host: row.get(4)?,
        service: row.get(5)?,
        severity: severity_raw.map(|s| SeverityTier::from_keyword(&s)),
        raw_severity: row.get(7)?,
        duration_secs: row.get(8)?,
        tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
    })
}

/// Events whose timestamp falls in [start, end).
pub fn events_in_window(
    pool: &Pool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Event>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, description, source, host, service, severity,
                raw_severity, duration_secs, tags_json
         FROM events
         WHERE timestamp >= ?1 AND timestamp < ?2
         ORDER BY timestamp ASC",
    )?;
    let rows = stmt.query_map(params![start.to_rfc3339(), end.to_rfc3339()], event_from_row)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Event durations inside a window, for the report's duration statistics.
pub fn event_durations_in_window(
    pool: &Pool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<u64>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT duration_secs FROM events
         WHERE duration_secs IS NOT NULL AND timestamp >= ?1 AND timestamp < ?2",
    )?;
    let rows = stmt.query_map(params![start.to_rfc3339(), end.to_rfc3339()], |row| {
        row.get::<_, i64>(0)
    })?;
    let mut out = Vec::new();
    for r in rows {
        let v = r?;
        if v >= 0 {
            out.push(v as u64);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Cases and their vectors
// ---------------------------------------------------------------------------

/// Insert or update a case. Re-indexing writes the latest content, so the
/// case row and its stored vector never diverge.
pub fn save_case(pool: &Pool, case: &Case) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO cases (id, event_json, resolution, category, event_timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            event_json = excluded.event_json,
            resolution = excluded.resolution,
            category = excluded.category,
            event_timestamp = excluded.event_timestamp",
        params![
            case.id,
            serde_json::to_string(&case.event)?,
            case.resolution,
            case.category.to_string(),
            case.event.timestamp.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn case_exists(pool: &Pool, id: &str) -> Result<bool> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM cases WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn list_cases(pool: &Pool) -> Result<Vec<Case>> {
    let conn = pool.get()?;
    let mut stmt =
        conn.prepare("SELECT id, event_json, resolution, category FROM cases ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut cases = Vec::new();
    for r in rows {
        let (id, event_json, resolution, category) = r?;
        cases.push(Case {
            id,
            event: serde_json::from_str(&event_json).context("corrupt case event_json")?,
            resolution,
            category: category.parse().context("corrupt case category")?,
        });
    }
    Ok(cases)
}

/// Insert or replace the stored vector for a case. The REPLACE makes
/// re-indexing idempotent: one row per case id, always the latest vector.
pub fn upsert_case_vector(
    pool: &Pool,
    case_id: &str,
    vector: &[f32],
    embedder_version: &str,
) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR REPLACE INTO case_vectors
            (case_id, vector_json, dimension, embedder_version, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            case_id,
            serde_json::to_string(vector)?,
            vector.len() as i64,
            embedder_version,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// All cases that have a stored vector, with their vectors and the embedder
/// version each vector was produced by. Used to warm the in-memory index at
/// startup.
pub fn load_indexed_cases(pool: &Pool) -> Result<Vec<(Case, Vec<f32>, String)>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT c.id, c.event_json, c.resolution, c.category, v.vector_json,
                v.embedder_version
         FROM cases c JOIN case_vectors v ON v.case_id = c.id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;

    let mut out = Vec::new();
    for r in rows {
        let (id, event_json, resolution, category, vector_json, version) = r?;
        let case = Case {
            id,
            event: serde_json::from_str(&event_json).context("corrupt case event_json")?,
            resolution,
            category: category.parse().context("corrupt case category")?,
        };
        let vector: Vec<f32> =
            serde_json::from_str(&vector_json).context("corrupt case vector_json")?;
        out.push((case, vector, version));
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Classifications
// ---------------------------------------------------------------------------

pub fn save_classification(pool: &Pool, c: &Classification, event_ts: DateTime<Utc>) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO classifications
            (id, event_id, category, confidence, supporting_json, model_version,
             event_timestamp, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            c.id.to_string(),
            c.event_id,
            c.category.to_string(),
            c.confidence,
            serde_json::to_string(&c.supporting_cases)?,
            c.model_version,
            event_ts.to_rfc3339(),
            c.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn classification_rows(
    pool: &Pool,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Classification>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
        ))
    })?;

    let mut out = Vec::new();
    for r in rows {
        let (id, event_id, category, confidence, supporting_json, model_version, created_at) = r?;
        out.push(Classification {
            id: id.parse().context("corrupt classification id")?,
            event_id,
            category: category.parse().context("corrupt classification category")?,
            confidence,
            supporting_cases: serde_json::from_str(&supporting_json)
                .context("corrupt supporting_json")?,
            model_version,
            created_at: parse_ts(&created_at)?,
        });
    }
    Ok(out)
}

/// Classifications whose event timestamp falls in [start, end).
pub fn classifications_in_window(
    pool: &Pool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Classification>> {
    classification_rows(
        pool,
        "SELECT id, event_id, category, confidence, supporting_json, model_version, created_at
         FROM classifications
         WHERE event_timestamp >= ?1 AND event_timestamp < ?2
         ORDER BY created_at ASC",
        &[&start.to_rfc3339(), &end.to_rfc3339()],
    )
}

/// Late arrivals: in-window classifications recorded after `cutoff`.
pub fn classifications_in_window_after(
    pool: &Pool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Classification>> {
    classification_rows(
        pool,
        "SELECT id, event_id, category, confidence, supporting_json, model_version, created_at
         FROM classifications
         WHERE event_timestamp >= ?1 AND event_timestamp < ?2 AND created_at > ?3
         ORDER BY created_at ASC",
        &[&start.to_rfc3339(), &end.to_rfc3339(), &cutoff.to_rfc3339()],
    )
}

/// Most recent classification for an event. Re-classification appends, so
/// "latest" is the current judgment and older rows are audit history.
pub fn latest_classification(pool: &Pool, event_id: &str) -> Result<Option<Classification>> {
    let mut rows = classification_rows(
        pool,
        "SELECT id, event_id, category, confidence, supporting_json, model_version, created_at
         FROM classifications
         WHERE event_id = ?1
         ORDER BY created_at DESC LIMIT 1",
        &[&event_id],
    )?;
    Ok(rows.pop())
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

pub fn save_dead_letter(
    pool: &Pool,
    event_ref: Option<&str>,
    stage: &str,
    cause: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO dead_letters (event_ref, stage, cause, payload_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            event_ref,
            stage,
            cause,
            serde_json::to_string(payload)?,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn dead_letter_count(pool: &Pool, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<u64> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM dead_letters WHERE created_at >= ?1 AND created_at < ?2",
        params![start.to_rfc3339(), end.to_rfc3339()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Unreplayed dead letters, oldest first: (row id, payload).
pub fn pending_dead_letters(pool: &Pool, limit: usize) -> Result<Vec<(i64, serde_json::Value)>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, payload_json FROM dead_letters
         WHERE replayed = 0 ORDER BY created_at ASC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit as i64], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut out = Vec::new();
    for r in rows {
        let (id, payload_json) = r?;
        out.push((
            id,
            serde_json::from_str(&payload_json).context("corrupt dead letter payload")?,
        ));
    }
    Ok(out)
}

pub fn mark_dead_letter_replayed(pool: &Pool, id: i64) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE dead_letters SET replayed = 1 WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

pub fn save_report(pool: &Pool, report: &Report) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO reports (id, kind, window_start, window_end, report_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            report.id.to_string(),
            report.kind.to_string(),
            report.window.start.to_rfc3339(),
            report.window.end.to_rfc3339(),
            serde_json::to_string(report)?,
            report.generated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn latest_report(pool: &Pool) -> Result<Option<Report>> {
    let conn = pool.get()?;
    let mut stmt =
        conn.prepare("SELECT report_json FROM reports ORDER BY created_at DESC LIMIT 1")?;
    let mut rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    match rows.next() {
        Some(json) => Ok(Some(
            serde_json::from_str(&json?).context("corrupt stored report")?,
        )),
        None => Ok(None),
    }
}

pub fn list_reports(pool: &Pool, limit: usize) -> Result<Vec<Report>> {
    let conn = pool.get()?;
    let mut stmt =
        conn.prepare("SELECT report_json FROM reports ORDER BY created_at DESC LIMIT ?1")?;
    let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(serde_json::from_str(&r?).context("corrupt stored report")?);
    }
    Ok(out)
}

/// Published scheduled report for a window, if any. Correction decisions
/// compare late classifications against this report's generation time.
pub fn report_for_window(
    pool: &Pool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Option<Report>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT report_json FROM reports
         WHERE window_start = ?1 AND window_end = ?2
         ORDER BY created_at DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![start.to_rfc3339(), end.to_rfc3339()], |row| {
        row.get::<_, String>(0)
    })?;
    match rows.next() {
        Some(json) => Ok(Some(
            serde_json::from_str(&json?).context("corrupt stored report")?,
        )),
        None => Ok(None),
    }
}

/// Daily event counts for the trend scan, oldest day first.
pub fn daily_event_counts(pool: &Pool, days: i64) -> Result<Vec<(String, u64)>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT date(timestamp) AS day, COUNT(*) FROM events
         WHERE timestamp >= datetime('now', ?1)
         GROUP BY day ORDER BY day ASC",
    )?;
    let window = format!("-{days} days");
    let rows = stmt.query_map(params![window], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut out = Vec::new();
    for r in rows {
        let (day, count) = r?;
        out.push((day, count.max(0) as u64));
    }
    Ok(out)
}
