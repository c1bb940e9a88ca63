//! On connect, replays the job's full history and then switches to the
//! live broadcast receiver the registry handed back under the same lock —
//! so there is no gap between the last replayed event and the first live
//! one.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::http::StatusCode;
use futures::stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;
use uuid::Uuid;

use crate::AppState;

/// `GET /batch/{job_id}/events`. 404s if the job id is unknown (it was
/// never created, or it has already been reaped after its 5-minute grace
/// window).
async fn event_stream(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, StatusCode> {
    let (history, receiver) = state.registry.subscribe(job_id).ok_or(StatusCode::NOT_FOUND)?;

    let live = BroadcastStream::new(receiver).filter_map(|result| match result {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "SSE subscriber lagged; dropping missed events");
            None
        }
    });

    let stream = async_stream::stream! {
        for event in history {
            yield event;
        }
        let mut live = Box::pin(live);
        while let Some(event) = live.next().await {
            yield event;
        }
    }
    .map(|event| {
        let json = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(SseEvent::default().data(json))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive")))
}

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route("/batch/{job_id}/events", axum::routing::get(event_stream))
}
