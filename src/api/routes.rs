//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiError;
use crate::ingest::Normalizer;
use crate::model::Event;
use crate::pipeline::PipelineError;
use crate::report::Window;
use crate::retrieve::RetrieveError;
use crate::storage;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(submit_event))
        .route("/events/{id}/classification", get(event_classification))
        .route("/cases", get(list_cases).post(create_case))
        .route("/retrieve", post(retrieve_similar))
        .route("/reports", get(list_reports))
        .route("/reports/latest", get(latest_report))
        .route("/reports/generate", post(generate_report))
        .route("/schedules", get(list_schedules).post(add_schedule))
        .route("/schedules/{name}", delete(remove_schedule))
        .route("/schedules/dry-run", get(schedule_dry_run))
        .route("/dead-letters", get(dead_letter_summary))
}

fn envelope(data: Value, meta: Value) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta }))
}

async fn health() -> Json<Value> {
    envelope(
        json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }),
        json!({ "timestamp": Utc::now().to_rfc3339() }),
    )
}

/// Run one raw event record through the pipeline and return its
/// classification. Invalid records are dead-lettered and rejected.
async fn submit_event(
    State(state): State<AppState>,
    Json(raw): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    match state.pipeline.handle_raw(&raw).await {
        Ok(c) => Ok(envelope(
            serde_json::to_value(&c).map_err(anyhow::Error::from)?,
            json!({ "dead_lettered": false }),
        )),
        Err(PipelineError::Validation(e)) => {
            Err(ApiError::unprocessable(format!("record rejected: {e}")))
        }
        Err(e) => Err(anyhow::Error::from(e).into()),
    }
}

async fn event_classification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match storage::latest_classification(&state.pool, &id)? {
        Some(c) => Ok(envelope(
            serde_json::to_value(&c).map_err(anyhow::Error::from)?,
            json!({}),
        )),
        None => Err(ApiError::not_found(format!(
            "no classification for event '{id}'"
        ))),
    }
}

async fn list_cases(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let cases = storage::list_cases(&state.pool)?;
    let total = cases.len();
    Ok(envelope(
        serde_json::to_value(&cases).map_err(anyhow::Error::from)?,
        json!({ "total": total }),
    ))
}

#[derive(Deserialize)]
struct CreateCaseRequest {
    id: String,
    event: Value,
    resolution: String,
    category: String,
}

/// Register a resolved case and index it for retrieval.
async fn create_case(
    State(state): State<AppState>,
    Json(req): Json<CreateCaseRequest>,
) -> Result<Json<Value>, ApiError> {
    let event = Normalizer::new("case-import")
        .normalize(&req.event)
        .map_err(|e| ApiError::unprocessable(format!("bad case event: {e}")))?;
    let category = req
        .category
        .parse()
        .map_err(|e| ApiError::unprocessable(format!("{e}")))?;

    let case = crate::model::Case {
        id: req.id,
        event,
        resolution: req.resolution,
        category,
    };
    state
        .indexer
        .index_case(&case)
        .await
        .map_err(|e| ApiError::from(anyhow::Error::from(e)))?;
    Ok(envelope(
        json!({ "id": case.id }),
        json!({ "indexed": true }),
    ))
}

#[derive(Deserialize)]
struct RetrieveRequest {
    text: String,
    k: Option<usize>,
}

async fn retrieve_similar(
    State(state): State<AppState>,
    Json(req): Json<RetrieveRequest>,
) -> Result<Json<Value>, ApiError> {
    let k = req.k.unwrap_or(state.config.classifier.retrieval_k);
    let query = Event {
        id: "query".to_string(),
        timestamp: Utc::now(),
        description: req.text,
        source: "api".to_string(),
        host: None,
        service: None,
        severity: None,
        raw_severity: None,
        duration_secs: None,
        tags: Vec::new(),
    };
    let hits = match state.retriever.retrieve(&query, k).await {
        Ok(hits) => hits,
        Err(RetrieveError::InvalidArgument(msg)) => return Err(ApiError::bad_request(msg)),
        Err(e) => return Err(anyhow::Error::from(e).into()),
    };
    let total = hits.len();
    let data: Vec<Value> = hits
        .into_iter()
        .map(|h| json!({ "case": h.case, "score": h.score }))
        .collect();
    Ok(envelope(json!(data), json!({ "total": total, "k": k })))
}

#[derive(Deserialize)]
struct ListReportsQuery {
    limit: Option<usize>,
}

async fn list_reports(
    State(state): State<AppState>,
    Query(q): Query<ListReportsQuery>,
) -> Result<Json<Value>, ApiError> {
    let reports = storage::list_reports(&state.pool, q.limit.unwrap_or(20))?;
    let total = reports.len();
    Ok(envelope(
        serde_json::to_value(&reports).map_err(anyhow::Error::from)?,
        json!({ "total": total }),
    ))
}

async fn latest_report(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    match storage::latest_report(&state.pool)? {
        Some(report) => Ok(envelope(
            serde_json::to_value(&report).map_err(anyhow::Error::from)?,
            json!({ "text": crate::report::render::render_text(&report) }),
        )),
        None => Err(ApiError::not_found("no reports published yet")),
    }
}

#[derive(Deserialize, Default)]
struct GenerateReportRequest {
    window_minutes: Option<i64>,
}

/// On-demand publication for the newest final window. Send `{}` to use the
/// configured window length.
async fn generate_report(
    State(state): State<AppState>,
    Json(req): Json<GenerateReportRequest>,
) -> Result<Json<Value>, ApiError> {
    let minutes = req
        .window_minutes
        .unwrap_or(state.config.report.window_minutes);
    if minutes <= 0 {
        return Err(ApiError::bad_request("window_minutes must be positive"));
    }
    let window = Window::latest_final(minutes, state.config.report.late_grace_secs, Utc::now());
    match state.runner.publish_window_report(window)? {
        Some(report) => Ok(envelope(
            serde_json::to_value(&report).map_err(anyhow::Error::from)?,
            json!({ "text": crate::report::render::render_text(&report) }),
        )),
        None => Ok(envelope(
            json!(null),
            json!({ "message": "window already reported, no late arrivals" }),
        )),
    }
}

async fn list_schedules(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let schedules = state.scheduler.list().await?;
    let total = schedules.len();
    let data: Vec<Value> = schedules
        .into_iter()
        .map(|s| {
            json!({
                "name": s.name,
                "cron": s.cron_expr,
                "job": s.job_type,
                "enabled": s.enabled,
                "last_run_at": s.last_run_at.map(|t| t.to_rfc3339()),
            })
        })
        .collect();
    Ok(envelope(json!(data), json!({ "total": total })))
}

#[derive(Deserialize)]
struct AddScheduleRequest {
    name: String,
    cron: String,
    job: String,
}

async fn add_schedule(
    State(state): State<AppState>,
    Json(req): Json<AddScheduleRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .scheduler
        .add(&req.name, &req.cron, &req.job)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(envelope(json!({ "name": req.name }), json!({})))
}

async fn remove_schedule(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .scheduler
        .remove(&name)
        .await
        .map_err(|e| ApiError::not_found(e.to_string()))?;
    Ok(envelope(json!({ "removed": name }), json!({})))
}

#[derive(Deserialize)]
struct DryRunQuery {
    hours: Option<u64>,
}

async fn schedule_dry_run(
    State(state): State<AppState>,
    Query(q): Query<DryRunQuery>,
) -> Result<Json<Value>, ApiError> {
    let upcoming = state
        .scheduler
        .preview_next_runs(q.hours.unwrap_or(24))
        .await?;
    let data: Vec<Value> = upcoming
        .into_iter()
        .map(|(at, name, job)| json!({ "at": at, "name": name, "job": job }))
        .collect();
    Ok(envelope(json!({ "upcoming": data }), json!({})))
}

async fn dead_letter_summary(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let pending = storage::pending_dead_letters(&state.pool, 100)?;
    let total = pending.len();
    let refs: Vec<i64> = pending.iter().map(|(id, _)| *id).collect();
    Ok(envelope(
        json!({ "pending": total, "ids": refs }),
        json!({}),
    ))
}
