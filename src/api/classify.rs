//! Synchronous classify-only endpoint.
//!
//! Wraps the metadata fetch and the heuristic/LLM classifiers for a set of
//! items without downloading or processing anything. Unlike the per-item
//! pipeline stage (which falls back to the heuristic classifier item by
//! item), this endpoint reports a single `source` for the whole call: it
//! attempts one LLM batch call over every item whose metadata fetch
//! succeeded, and falls back to the heuristic classifier for the entire
//! batch if the LLM is unavailable or that call fails.

use std::time::{Duration, Instant};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::model::{Classification, ClassificationSource, DjTags, ExtractedInfo, ItemKind};
use crate::AppState;

const METADATA_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Deserialize)]
pub struct ClassifyRequest {
    pub items: Vec<ClassifyItem>,
}

#[derive(Debug, Deserialize)]
pub struct ClassifyItem {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct ClassifyResult {
    pub id: String,
    pub classification: Classification,
}

#[derive(Debug, Serialize)]
pub struct ClassifyResponse {
    pub source: ClassificationSource,
    pub results: Vec<ClassifyResult>,
    pub ms: u128,
}

/// `POST /classify`.
async fn classify(
    State(state): State<AppState>,
    Json(req): Json<ClassifyRequest>,
) -> Json<ClassifyResponse> {
    let started = Instant::now();

    let fetches = join_all(req.items.iter().map(|item| {
        let extractor = state.extractor.clone();
        let url = item.url.clone();
        async move {
            extractor
                .fetch_info(&url, METADATA_TIMEOUT, &crate::services::process::never_cancelled)
                .await
        }
    }))
    .await;

    let mut fetched: Vec<(String, String, ExtractedInfo)> = Vec::new();
    let mut failed: Vec<(String, Classification)> = Vec::new();

    for (item, result) in req.items.iter().zip(fetches.into_iter()) {
        match result {
            Ok(info) => fetched.push((item.id.clone(), item.url.clone(), info)),
            Err(err) => failed.push((
                item.id.clone(),
                Classification {
                    kind: ItemKind::Unknown,
                    tags: DjTags::default(),
                    confidence: 0.0,
                    notes: format!("metadata fetch failed: {}", err.message()),
                    source: ClassificationSource::Heuristic,
                },
            )),
        }
    }

    let (classified, source) = if state.llm_classifier.is_available() && !fetched.is_empty() {
        match state.llm_classifier.classify(&fetched).await {
            Some(results) => (results, ClassificationSource::Llm),
            None => (heuristic_classify(&state, &fetched), ClassificationSource::Heuristic),
        }
    } else {
        (heuristic_classify(&state, &fetched), ClassificationSource::Heuristic)
    };

    let mut by_id: std::collections::HashMap<String, Classification> =
        classified.into_iter().chain(failed).collect();

    let results = req
        .items
        .iter()
        .filter_map(|item| {
            by_id
                .remove(&item.id)
                .map(|classification| ClassifyResult { id: item.id.clone(), classification })
        })
        .collect();

    Json(ClassifyResponse {
        source,
        results,
        ms: started.elapsed().as_millis(),
    })
}

fn heuristic_classify(
    state: &AppState,
    items: &[(String, String, ExtractedInfo)],
) -> Vec<(String, Classification)> {
    items
        .iter()
        .map(|(id, _, info)| (id.clone(), state.heuristic_classifier.classify(info)))
        .collect()
}

pub fn router() -> Router<AppState> {
    Router::new().route("/classify", post(classify))
}
