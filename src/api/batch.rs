//! Batch ingest and cancellation endpoints.
//!
//! `POST /batch` validates the preset and item ids, creates a job in the
//! registry (which appends `queue-start` synchronously so it is always the
//! first event in history), and spawns the batch scheduler in the
//! background so the HTTP response returns immediately with the `job_id`.

use std::collections::HashSet;
use std::path::PathBuf;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ItemOutcome, ProcessingPreset, TrackRequest};
use crate::scheduler::BatchScheduler;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct StartBatchRequest {
    #[serde(default)]
    pub inbox_dir: Option<String>,
    pub preset: ProcessingPreset,
    pub items: Vec<TrackRequest>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct StartBatchResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// `POST /batch`. Zero items is valid: the job still runs to a
/// `queue-start`/`queue-done` pair with no items in between.
async fn start_batch(
    State(state): State<AppState>,
    Json(req): Json<StartBatchRequest>,
) -> Result<Json<StartBatchResponse>, (StatusCode, Json<ErrorBody>)> {
    let preset = req.preset.normalized();
    preset.validate().map_err(|e| invalid(e.message()))?;

    let mut seen_ids = HashSet::with_capacity(req.items.len());
    for item in &req.items {
        if item.id.is_empty() {
            return Err(invalid("item id must not be empty".to_string()));
        }
        if !seen_ids.insert(item.id.clone()) {
            return Err(invalid(format!("duplicate item id: {}", item.id)));
        }
        if let Some(snapshot) = &item.preset_snapshot {
            snapshot
                .clone()
                .normalized()
                .validate()
                .map_err(|e| invalid(format!("item {}: {}", item.id, e.message())))?;
        }
    }

    let inbox_dir = PathBuf::from(req.inbox_dir.unwrap_or_else(|| state.config.inbox_dir.clone()));
    let max_concurrent = req
        .max_concurrent
        .unwrap_or(state.config.default_max_concurrent)
        .clamp(1, 5);
    let max_retries = req.max_retries.unwrap_or(2);

    let job_id = state.registry.create_job();

    let scheduler_state = state.clone();
    tokio::spawn(async move {
        let scheduler = BatchScheduler::new(scheduler_state);
        scheduler
            .run_batch(job_id, inbox_dir, preset, req.items, max_concurrent, max_retries)
            .await;
    });

    Ok(Json(StartBatchResponse { job_id }))
}

/// `POST /batch/{job_id}/cancel`. Idempotent: cancelling an unknown
/// or already-finished job is a silent no-op rather than a 404, so a racing
/// client can never observe an error for a job that simply finished first.
async fn cancel_batch(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> StatusCode {
    state.registry.cancel(job_id);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub items: Vec<ItemOutcome>,
}

/// `GET /batch/{job_id}` — a point-in-time snapshot of per-item status,
/// derived by folding the job's event history rather than tracked as
/// separate mutable state. Callers that want the live,
/// ordered feed should use the SSE stream instead; this is for a one-shot
/// poll.
async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, StatusCode> {
    let items = state.registry.item_outcomes(job_id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(JobStatusResponse { job_id, items }))
}

fn invalid(message: String) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: "InputInvalid".to_string(),
            details: Some(message),
        }),
    )
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/batch", post(start_batch))
        .route("/batch/{job_id}", get(job_status))
        .route("/batch/{job_id}/cancel", post(cancel_batch))
}
