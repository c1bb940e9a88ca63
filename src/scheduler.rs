//! Batch scheduler.
//!
//! Runs a batch's items with bounded concurrency, retries transient
//! extractor failures with exponential backoff, and isolates one item's
//! failure from the rest. A semaphore-bounded `tokio::spawn` fan-out over
//! the batch's items, with a per-item retry/backoff loop and cancellation
//! checks layered on top.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DropcrateError;
use crate::model::{Event, ProcessingPreset, Stage, TrackRequest};
use crate::pipeline;
use crate::AppState;

/// `2^attempt * 1s`, attempt counting from 0 for the first retry.
fn backoff_duration(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

pub struct BatchScheduler {
    state: AppState,
}

impl BatchScheduler {
    pub fn new(state: AppState) -> Self {
        BatchScheduler { state }
    }

    /// Runs a batch to completion. Progress fans out to every current and
    /// future subscriber via `JobRegistry::emit`.
    ///
    /// A batch of zero items still runs to completion: `queue-start` was
    /// already appended by `JobRegistry::create_job`, so this immediately
    /// emits `queue-done` with no items in between.
    pub async fn run_batch(
        &self,
        job_id: Uuid,
        inbox_dir: PathBuf,
        preset: ProcessingPreset,
        items: Vec<TrackRequest>,
        max_concurrent: usize,
        max_retries: u32,
    ) {
        let max_concurrent = max_concurrent.clamp(1, 5);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut handles = Vec::with_capacity(items.len());

        for item in items {
            let effective_preset = item
                .preset_snapshot
                .clone()
                .map(|p| p.normalized())
                .unwrap_or_else(|| preset.clone());
            let permit = semaphore.clone();
            let state = self.state.clone();
            let inbox_dir = inbox_dir.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit
                    .acquire_owned()
                    .await
                    .expect("batch semaphore closed while items remained");
                run_item_with_retry(&state, job_id, &inbox_dir, &item, &effective_preset, max_retries)
                    .await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(job_id = %job_id, error = %e, "item task panicked");
            }
        }

        // Every affected item has now emitted its terminal `item-error{Cancelled}`
        // (or `item-done`, if it finished before the cancel flag was observed),
        // so `queue-cancelled` is safe to emit here — never before all item
        // tasks have joined.
        self.state.registry.emit_queue_cancelled_if_requested(job_id);
        self.state.registry.finish(job_id);
        self.state.registry.schedule_reap(job_id);
        info!(job_id = %job_id, "batch finished");
    }
}

/// One item's full lifecycle. Emits exactly one terminal `item-*` event per
/// item: `item-done` on success, or a single `item-error` once retries (if
/// any) are exhausted. Intermediate failed attempts are logged but never
/// surfaced as events, since only the final outcome is observable.
async fn run_item_with_retry(
    state: &AppState,
    job_id: Uuid,
    inbox_dir: &Path,
    item: &TrackRequest,
    preset: &ProcessingPreset,
    max_retries: u32,
) {
    let registry = &state.registry;

    if registry.is_cancelled(job_id) {
        registry.emit(
            job_id,
            Event::ItemError {
                id: item.id.clone(),
                kind: (&DropcrateError::Cancelled).into(),
                message: "cancelled before starting".to_string(),
                hint: None,
            },
        );
        return;
    }

    registry.emit(job_id, Event::ItemStart { id: item.id.clone() });

    let mut attempt: u32 = 0;
    loop {
        let is_cancelled = || registry.is_cancelled(job_id);
        let on_stage = {
            let item_id = item.id.clone();
            move |stage: Stage| {
                registry.emit(
                    job_id,
                    Event::ItemProgress {
                        id: item_id.clone(),
                        stage,
                    },
                );
            }
        };

        let result = pipeline::run_item(state, inbox_dir, item, preset, &is_cancelled, on_stage).await;

        match result {
            Ok(outputs) => {
                registry.emit(
                    job_id,
                    Event::ItemDone {
                        id: item.id.clone(),
                        outputs,
                    },
                );
                return;
            }
            Err(DropcrateError::Cancelled) => {
                registry.emit(
                    job_id,
                    Event::ItemError {
                        id: item.id.clone(),
                        kind: (&DropcrateError::Cancelled).into(),
                        message: "cancelled".to_string(),
                        hint: None,
                    },
                );
                return;
            }
            Err(err) => {
                let retryable = matches!(
                    &err,
                    DropcrateError::ExtractorError { kind, .. } if kind.retryable()
                );
                if retryable && attempt < max_retries {
                    let wait = backoff_duration(attempt);
                    warn!(
                        job_id = %job_id, id = %item.id, attempt, ?wait,
                        "retrying item after transient extractor error"
                    );
                    attempt += 1;
                    tokio::time::sleep(wait).await;
                    continue;
                }
                registry.emit(
                    job_id,
                    Event::ItemError {
                        id: item.id.clone(),
                        kind: (&err).into(),
                        message: err.message(),
                        hint: err.hint(),
                    },
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{AudioFormat, LoudnessTarget, ProcessingMode};
    use crate::registry::JobRegistry;
    use crate::services::classifier_heuristic::HeuristicClassifier;
    use crate::services::classifier_llm::LlmClassifier;
    use crate::services::extractor::ExtractorDriver;
    use crate::services::fingerprint::FingerprintMatcher;
    use crate::services::media_processor::MediaProcessor;
    use crate::services::tools::ToolProvisioner;
    use crate::model::Event;

    #[test]
    fn backoff_doubles_each_attempt() {
        assert_eq!(backoff_duration(0), Duration::from_secs(1));
        assert_eq!(backoff_duration(1), Duration::from_secs(2));
        assert_eq!(backoff_duration(2), Duration::from_secs(4));
    }

    // A zero-item batch never touches the extractor, ffmpeg or fingerprint
    // services, so the scheduler can be exercised end-to-end with fake tool
    // paths and no network or subprocess access.
    fn fake_state() -> AppState {
        let config = Arc::new(Config {
            port: 8787,
            inbox_dir: "./inbox".to_string(),
            extractor_path: Some("true".to_string()),
            ffmpeg_path: Some("true".to_string()),
            fpcalc_path: None,
            extractor_cookies_from_browser: None,
            extractor_cookies_path: None,
            acoustid_key: None,
            musicbrainz_ua: "dropcrate-test".to_string(),
            openai_api_key: None,
            llm_model: None,
            default_max_concurrent: 3,
            default_preset: ProcessingPreset {
                mode: ProcessingMode::DjSafe,
                audio_format: AudioFormat::Aiff,
                normalize_enabled: true,
                loudness: LoudnessTarget::default(),
            },
        });
        AppState {
            tools: Arc::new(ToolProvisioner::new(config.clone())),
            extractor: Arc::new(ExtractorDriver::new("true".to_string(), config.clone())),
            media_processor: Arc::new(MediaProcessor::new("true".to_string())),
            heuristic_classifier: Arc::new(HeuristicClassifier::new()),
            llm_classifier: Arc::new(LlmClassifier::new(config.clone())),
            fingerprint_matcher: Arc::new(
                FingerprintMatcher::new(None, config.clone()).expect("client builds"),
            ),
            registry: Arc::new(JobRegistry::new()),
            config,
        }
    }

    #[tokio::test]
    async fn empty_batch_emits_only_queue_start_then_queue_done() {
        let state = fake_state();
        let job_id = state.registry.create_job();
        let scheduler = BatchScheduler::new(state.clone());

        scheduler
            .run_batch(
                job_id,
                PathBuf::from("/tmp/dropcrate-test-inbox"),
                ProcessingPreset::default(),
                vec![],
                3,
                2,
            )
            .await;

        let (history, _rx) = state.registry.subscribe(job_id).unwrap();
        assert_eq!(history.len(), 2);
        assert!(matches!(history[0], Event::QueueStart { .. }));
        assert!(matches!(history[1], Event::QueueDone { .. }));
    }

    #[tokio::test]
    async fn cancelling_before_start_skips_the_item_without_item_start() {
        let state = fake_state();
        let job_id = state.registry.create_job();
        state.registry.cancel(job_id);
        let scheduler = BatchScheduler::new(state.clone());

        let item = TrackRequest {
            id: "a".to_string(),
            url: "https://example.invalid/a".to_string(),
            preset_snapshot: None,
        };

        scheduler
            .run_batch(
                job_id,
                PathBuf::from("/tmp/dropcrate-test-inbox"),
                ProcessingPreset::default(),
                vec![item],
                3,
                2,
            )
            .await;

        let (history, _rx) = state.registry.subscribe(job_id).unwrap();
        assert!(!history.iter().any(|e| matches!(e, Event::ItemStart { .. })));
        assert!(history.iter().any(|e| matches!(e, Event::ItemError { .. })));
        assert!(matches!(history.last(), Some(Event::QueueDone { .. })));
    }
}
