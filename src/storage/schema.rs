//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            description TEXT NOT NULL,
            source TEXT NOT NULL,
            host TEXT,
            service TEXT,
            severity TEXT,
            raw_severity TEXT,
            duration_secs INTEGER,
            tags_json TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS cases (
            id TEXT PRIMARY KEY,
            event_json TEXT NOT NULL,
            resolution TEXT NOT NULL,
            category TEXT NOT NULL,
            event_timestamp TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS case_vectors (
            case_id TEXT PRIMARY KEY REFERENCES cases(id),
            vector_json TEXT NOT NULL,
            dimension INTEGER NOT NULL,
            embedder_version TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS classifications (
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            category TEXT NOT NULL,
            confidence REAL NOT NULL,
            supporting_json TEXT NOT NULL DEFAULT '[]',
            model_version TEXT NOT NULL,
            event_timestamp TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY,
            event_ref TEXT,
            stage TEXT NOT NULL,
            cause TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            replayed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS reports (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            report_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS schedules (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            cron_expr TEXT NOT NULL,
            job_type TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_run_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS schedule_history (
            id INTEGER PRIMARY KEY,
            schedule_name TEXT NOT NULL,
            status TEXT NOT NULL,
            result_summary TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            FOREIGN KEY (schedule_name) REFERENCES schedules(name)
        );

        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
        CREATE INDEX IF NOT EXISTS idx_cases_event_ts ON cases(event_timestamp);
        CREATE INDEX IF NOT EXISTS idx_classifications_event_ts ON classifications(event_timestamp);
        CREATE INDEX IF NOT EXISTS idx_classifications_created ON classifications(created_at);
        CREATE INDEX IF NOT EXISTS idx_dead_letters_created ON dead_letters(created_at);
        CREATE INDEX IF NOT EXISTS idx_reports_window ON reports(window_start, window_end);
        CREATE INDEX IF NOT EXISTS idx_schedule_history_name ON schedule_history(schedule_name);",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM classifications", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schedules", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }
}
