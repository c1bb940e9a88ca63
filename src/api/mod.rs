//! Thin axum routers over the scheduler/registry/pipeline services already
//! wired onto `AppState`. One module per concern, each exposing its own
//! `router() -> Router<AppState>`, merged together by the binary that owns
//! `main`.

pub mod batch;
pub mod classify;
pub mod events;
pub mod health;
pub mod library;

use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(batch::router())
        .merge(events::router())
        .merge(classify::router())
        .merge(library::router())
}
