//! dropcrate server binary: wires configuration, the job registry, and the
//! SSE/REST surface together and serves them over HTTP.
//!
//! Wiring order is config → services → router → `axum::serve`, with
//! `tracing_subscriber::registry()` set up first so every later step logs
//! structured output. `ctrlc` installs a synchronous signal handler that
//! flips a oneshot so the async shutdown future can cancel every
//! still-running job before axum stops accepting connections.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use dropcrate::registry::JobRegistry;
use dropcrate::{api, config::Config, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dropcrate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Unhandled panics in spawned tasks must never take the process down:
    // log and continue rather than letting one bad task or response body
    // abort the listener.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(%info, "panic caught by top-level hook");
        default_hook(info);
    }));

    let config = Config::from_env()?;
    tracing::info!(port = config.port, inbox_dir = %config.inbox_dir, "configuration loaded");

    let state = AppState::initialize(config).await?;
    tracing::info!("tool paths resolved, application state initialized");

    let port = state.config.port;
    let registry = state.registry.clone();

    let app = axum::Router::new()
        .merge(api::router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    let (ctrlc_tx, ctrlc_rx) = oneshot::channel();
    let ctrlc_tx = std::sync::Mutex::new(Some(ctrlc_tx));
    ctrlc::set_handler(move || {
        if let Some(tx) = ctrlc_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    })
    .expect("failed to install ctrl-c handler");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry, ctrlc_rx))
        .await?;

    Ok(())
}

/// Waits for the ctrl-c signal, cancels every job still running, then
/// returns so axum stops accepting new connections. Flipping the per-job
/// cancellation flag stops the next pipeline stage from starting and, for
/// any external process already running, is also polled by the process
/// runner racing that invocation — so an in-flight extractor/ffmpeg/fpcalc
/// child is killed rather than left orphaned once its stage loses the race.
async fn shutdown_signal(registry: Arc<JobRegistry>, ctrlc_rx: oneshot::Receiver<()>) {
    let _ = ctrlc_rx.await;
    tracing::info!("shutdown signal received, cancelling live jobs");

    for job_id in registry.active_job_ids() {
        registry.cancel(job_id);
    }
}
