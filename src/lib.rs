//! dropcrate: media acquisition and finalization pipeline for a DJ
//! watch-folder.
//!
//! Ingests source media URLs, classifies them into DJ tags, downloads and
//! normalizes the audio, and publishes the result plus a provenance sidecar
//! into an output directory. A bounded-concurrency batch scheduler drives
//! many items at once and streams structured progress events to
//! subscribers over SSE.

pub mod api;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod services;

pub use config::Config;
pub use error::DropcrateError;

use std::sync::Arc;

use crate::registry::JobRegistry;
use crate::services::{
    classifier_heuristic::HeuristicClassifier, classifier_llm::LlmClassifier,
    extractor::ExtractorDriver, fingerprint::FingerprintMatcher, media_processor::MediaProcessor,
    tools::ToolProvisioner,
};

/// Process-wide state shared by the HTTP surface and the CLI entry point.
///
/// Services are resolved once at startup and injected by reference into
/// every request/pipeline run, rather than re-initialized per call.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Config>,
    pub tools: Arc<ToolProvisioner>,
    pub extractor: Arc<ExtractorDriver>,
    pub media_processor: Arc<MediaProcessor>,
    pub heuristic_classifier: Arc<HeuristicClassifier>,
    pub llm_classifier: Arc<LlmClassifier>,
    pub fingerprint_matcher: Arc<FingerprintMatcher>,
    pub registry: Arc<JobRegistry>,
}

impl AppState {
    pub async fn initialize(config: config::Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let tools = Arc::new(ToolProvisioner::new(config.clone()));
        let resolved = tools.resolve().await?;

        let extractor = Arc::new(ExtractorDriver::new(resolved.extractor_path.clone(), config.clone()));
        let media_processor = Arc::new(MediaProcessor::new(resolved.ffmpeg_path.clone()));
        let heuristic_classifier = Arc::new(HeuristicClassifier::new());
        let llm_classifier = Arc::new(LlmClassifier::new(config.clone()));
        let fingerprint_matcher = Arc::new(FingerprintMatcher::new(
            resolved.fingerprint_calc_path.clone(),
            config.clone(),
        )?);
        let registry = Arc::new(JobRegistry::new());

        Ok(AppState {
            config,
            tools,
            extractor,
            media_processor,
            heuristic_classifier,
            llm_classifier,
            fingerprint_matcher,
            registry,
        })
    }
}
