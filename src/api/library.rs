//! Library listing and download endpoints.
//!
//! The library has no database: listing is derived purely by scanning
//! `*.dropcrate.json` sidecars in the output directory, which are the
//! library's source of truth. Download enforces a path-containment check
//! by canonicalizing both the requested path and the configured output
//! directory and requiring one to be a prefix of the other.

use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::model::SidecarDocument;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct LibraryRow {
    pub id: String,
    pub path: String,
    pub artist: String,
    pub title: String,
    pub genre: String,
    pub downloaded_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct LibraryResponse {
    pub rows: Vec<LibraryRow>,
}

/// `GET /library`. Skips (with a log entry, never an error) any sidecar
/// that fails to parse or lacks a populated `outputs.audioPath`.
async fn list_library(State(state): State<AppState>) -> Json<LibraryResponse> {
    let inbox_dir = PathBuf::from(&state.config.inbox_dir);
    let mut rows = Vec::new();

    let mut entries = match fs::read_dir(&inbox_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %inbox_dir.display(), error = %e, "failed to read inbox directory for library listing");
            return Json(LibraryResponse { rows });
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if !path.to_string_lossy().ends_with(".dropcrate.json") {
            continue;
        }

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read sidecar");
                continue;
            }
        };
        let sidecar: SidecarDocument = match serde_json::from_slice(&bytes) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse sidecar; skipping");
                continue;
            }
        };
        let Some(audio_path) = sidecar.outputs.audio_path.clone() else {
            continue;
        };

        rows.push(LibraryRow {
            id: sidecar.source_id,
            path: audio_path,
            artist: sidecar.normalized.artist,
            title: sidecar.normalized.title,
            genre: sidecar.dj_defaults.genre,
            downloaded_at: sidecar.downloaded_at,
        });
    }

    rows.sort_by(|a, b| b.downloaded_at.cmp(&a.downloaded_at));
    Json(LibraryResponse { rows })
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    path: String,
}

/// `GET /library/download?path=...`. Resolves both the requested
/// path and the configured output directory to absolute paths and requires
/// the former to lie within the latter, returning 403 otherwise.
async fn download_file(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let inbox_dir = PathBuf::from(&state.config.inbox_dir);
    let requested = PathBuf::from(&query.path);

    let canonical_inbox = match fs::canonicalize(&inbox_dir).await {
        Ok(p) => p,
        Err(e) => {
            warn!(dir = %inbox_dir.display(), error = %e, "failed to canonicalize inbox directory");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let canonical_requested = match fs::canonicalize(&requested).await {
        Ok(p) => p,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    if !is_contained(&canonical_requested, &canonical_inbox) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let file = match tokio::fs::File::open(&canonical_requested).await {
        Ok(file) => file,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let filename = canonical_requested
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn is_contained(candidate: &Path, root: &Path) -> bool {
    candidate.starts_with(root)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/library", get(list_library))
        .route("/library/download", get(download_file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_rejects_paths_outside_root() {
        assert!(!is_contained(Path::new("/etc/passwd"), Path::new("/data/inbox")));
        assert!(is_contained(
            Path::new("/data/inbox/Artist - Title.aiff"),
            Path::new("/data/inbox")
        ));
    }
}
