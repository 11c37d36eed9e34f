//! File-based ingestion sources: CSV exports and JSON-lines dumps.
//!
//! Monitoring consoles export CSV with headers like
//! `Time,Host,Severity,Status,Description,Duration`; each row becomes a raw
//! JSON object keyed by header, and rows without an explicit id get a
//! synthetic one derived from file name and line number.

use std::path::Path;

use anyhow::{bail, Context, Result};

/// Read raw records from a file, dispatching on extension.
pub fn read_records(path: &Path) -> Result<Vec<serde_json::Value>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();
    match ext.as_str() {
        "csv" => read_csv(path),
        "jsonl" | "ndjson" | "json" => read_jsonl(path),
        other => bail!("unsupported ingest file type: '{other}' (expected csv or jsonl)"),
    }
}

fn read_jsonl(path: &Path) -> Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut records = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid JSON", path.display(), lineno + 1))?;
        records.push(value);
    }
    Ok(records)
}

fn read_csv(path: &Path) -> Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("csv")
        .to_string();

    let mut lines = content.lines().enumerate();
    let header = match lines.next() {
        Some((_, line)) => split_csv_line(line),
        None => return Ok(Vec::new()),
    };
    let has_id = header
        .iter()
        .any(|h| matches!(h.as_str(), "id" | "Id" | "ID" | "event_id" | "EventId"));

    let mut records = Vec::new();
    for (lineno, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_csv_line(line);
        let mut obj = serde_json::Map::new();
        for (key, value) in header.iter().zip(fields.iter()) {
            obj.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        if !has_id {
            obj.insert(
                "id".to_string(),
                serde_json::Value::String(format!("{}-{}", stem, lineno + 1)),
            );
        }
        records.push(serde_json::Value::Object(obj));
    }
    Ok(records)
}

/// Split one CSV line, honoring double quotes and `""` escapes.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());
    fields
}
