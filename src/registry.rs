//! Job registry & event bus.
//!
//! A single process-wide broadcast channel with no replay would mean a
//! subscriber that attaches mid-job misses everything already emitted.
//! Instead each job gets its own bounded history plus its own broadcast
//! channel, and `subscribe` hands back the history snapshot and a live
//! receiver taken under the same lock `emit` writes under, so a subscriber
//! sees the full ordered sequence from `queue-start` regardless of when it
//! attaches.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::model::{Event, ItemOutcome};

const HISTORY_CAPACITY: usize = 250;
const BROADCAST_CAPACITY: usize = 256;
const REAP_DELAY: Duration = Duration::from_secs(300);

struct JobState {
    history: VecDeque<Event>,
    sender: broadcast::Sender<Event>,
}

struct JobHandle {
    cancel_requested: AtomicBool,
    cancel_emitted: AtomicBool,
    state: RwLock<JobState>,
}

/// Owns every in-flight (and recently finished) job's event history and
/// cancellation flag. One instance lives for the process's lifetime.
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, Arc<JobHandle>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        JobRegistry {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Create a job and append its opening `queue-start` event in the same
    /// step, so no caller can observe a job whose history doesn't already
    /// start with it.
    pub fn create_job(&self) -> Uuid {
        let job_id = Uuid::new_v4();
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        let mut history = VecDeque::with_capacity(HISTORY_CAPACITY);
        history.push_back(Event::QueueStart { job_id });
        let handle = Arc::new(JobHandle {
            cancel_requested: AtomicBool::new(false),
            cancel_emitted: AtomicBool::new(false),
            state: RwLock::new(JobState { history, sender }),
        });
        self.jobs.write().insert(job_id, handle);
        job_id
    }

    pub fn exists(&self, job_id: Uuid) -> bool {
        self.jobs.read().contains_key(&job_id)
    }

    /// Append an event to the job's bounded history and fan it out to
    /// current subscribers. A no-op if the job has already been reaped.
    pub fn emit(&self, job_id: Uuid, event: Event) {
        let Some(handle) = self.jobs.read().get(&job_id).cloned() else {
            return;
        };
        let mut state = handle.state.write();
        if state.history.len() >= HISTORY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());
        let _ = state.sender.send(event);
    }

    /// Snapshot the history so far and attach a live receiver, both under
    /// the one lock `emit` also takes, so the pair is gap-free: any event
    /// not in the snapshot is guaranteed to arrive on the receiver.
    pub fn subscribe(&self, job_id: Uuid) -> Option<(Vec<Event>, broadcast::Receiver<Event>)> {
        let handle = self.jobs.read().get(&job_id).cloned()?;
        let state = handle.state.write();
        let history = state.history.iter().cloned().collect();
        let receiver = state.sender.subscribe();
        Some((history, receiver))
    }

    /// Request cancellation. Only flips the flag: `queue-cancelled` must not
    /// appear in history until every item affected by the cancellation has
    /// already emitted its own terminal `item-error{Cancelled}`, and the
    /// pipeline only observes the flag cooperatively between stages.
    /// The scheduler emits `queue-cancelled` itself, via
    /// `emit_queue_cancelled_if_requested`, once every item task has joined.
    pub fn cancel(&self, job_id: Uuid) {
        let Some(handle) = self.jobs.read().get(&job_id).cloned() else {
            return;
        };
        handle.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Emit `queue-cancelled` if (and only if) `cancel` was called for this
    /// job, exactly once no matter how many times this is called. Intended
    /// to be called by the batch scheduler after every item task has
    /// joined, so `queue-cancelled` lands after every affected item's
    /// `item-error{Cancelled}` and before `queue-done`.
    pub fn emit_queue_cancelled_if_requested(&self, job_id: Uuid) {
        let Some(handle) = self.jobs.read().get(&job_id).cloned() else {
            return;
        };
        if !handle.cancel_requested.load(Ordering::SeqCst) {
            return;
        }
        if handle
            .cancel_emitted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.emit(job_id, Event::QueueCancelled { job_id });
        }
    }

    /// Derive the current per-item `ItemOutcome` list by folding the job's
    /// history in order. `None` if the job is unknown.
    /// Items appear in first-seen order (their `item-start`, or first
    /// `item-error` for items cancelled before starting).
    pub fn item_outcomes(&self, job_id: Uuid) -> Option<Vec<ItemOutcome>> {
        let handle = self.jobs.read().get(&job_id).cloned()?;
        let history = handle.state.read().history.clone();

        let mut order = Vec::new();
        let mut by_id: HashMap<String, ItemOutcome> = HashMap::new();
        for event in &history {
            let id = match event {
                Event::ItemStart { id }
                | Event::ItemProgress { id, .. }
                | Event::ItemDone { id, .. }
                | Event::ItemError { id, .. } => Some(id.clone()),
                _ => None,
            };
            if let Some(id) = id {
                let outcome = by_id.entry(id.clone()).or_insert_with(|| {
                    order.push(id.clone());
                    ItemOutcome::queued(id)
                });
                outcome.apply_event(event);
            }
        }

        Some(order.into_iter().map(|id| by_id.remove(&id).expect("just inserted")).collect())
    }

    /// Job ids that have not yet emitted `queue-done`. Used by the server's
    /// shutdown hook to cancel every still-running job rather than leaving
    /// external processes orphaned.
    pub fn active_job_ids(&self) -> Vec<Uuid> {
        self.jobs
            .read()
            .iter()
            .filter(|(_, handle)| {
                !matches!(handle.state.read().history.back(), Some(Event::QueueDone { .. }))
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_cancelled(&self, job_id: Uuid) -> bool {
        self.jobs
            .read()
            .get(&job_id)
            .map(|h| h.cancel_requested.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Emit the terminal `queue-done` event. Always called last for a job.
    pub fn finish(&self, job_id: Uuid) {
        self.emit(job_id, Event::QueueDone { job_id });
    }

    /// Remove the job `REAP_DELAY` after it terminates, so a slow client
    /// still has a window to finish replaying history.
    pub fn schedule_reap(self: &Arc<Self>, job_id: Uuid) {
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REAP_DELAY).await;
            registry.jobs.write().remove(&job_id);
            info!(job_id = %job_id, "reaped job");
        });
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn create_job_seeds_history_with_queue_start() {
        let registry = JobRegistry::new();
        let job_id = registry.create_job();
        let (history, _rx) = registry.subscribe(job_id).unwrap();
        assert_eq!(history.len(), 1);
        assert_matches!(history[0], Event::QueueStart { job_id: id } if id == job_id);
    }

    #[test]
    fn subscribe_unknown_job_returns_none() {
        let registry = JobRegistry::new();
        assert!(registry.subscribe(Uuid::new_v4()).is_none());
    }

    #[test]
    fn emit_is_observed_by_late_subscriber() {
        let registry = JobRegistry::new();
        let job_id = registry.create_job();
        registry.emit(job_id, Event::ItemStart { id: "a".to_string() });
        registry.emit(
            job_id,
            Event::ItemDone {
                id: "a".to_string(),
                outputs: crate::model::Outputs::default(),
            },
        );
        let (history, _rx) = registry.subscribe(job_id).unwrap();
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn history_is_capped_dropping_oldest() {
        let registry = JobRegistry::new();
        let job_id = registry.create_job();
        for i in 0..(HISTORY_CAPACITY + 10) {
            registry.emit(job_id, Event::ItemStart { id: i.to_string() });
        }
        let (history, _rx) = registry.subscribe(job_id).unwrap();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert!(matches!(history[0], Event::ItemStart { ref id } if id == "10"));
    }

    #[test]
    fn cancel_alone_does_not_emit_queue_cancelled() {
        let registry = JobRegistry::new();
        let job_id = registry.create_job();
        registry.cancel(job_id);
        let (history, _rx) = registry.subscribe(job_id).unwrap();
        assert!(!history.iter().any(|e| matches!(e, Event::QueueCancelled { .. })));
        assert!(registry.is_cancelled(job_id));
    }

    #[test]
    fn emit_queue_cancelled_if_requested_is_a_no_op_without_cancel() {
        let registry = JobRegistry::new();
        let job_id = registry.create_job();
        registry.emit_queue_cancelled_if_requested(job_id);
        let (history, _rx) = registry.subscribe(job_id).unwrap();
        assert!(!history.iter().any(|e| matches!(e, Event::QueueCancelled { .. })));
    }

    #[test]
    fn emit_queue_cancelled_if_requested_emits_exactly_once() {
        let registry = JobRegistry::new();
        let job_id = registry.create_job();
        registry.cancel(job_id);
        registry.emit_queue_cancelled_if_requested(job_id);
        registry.emit_queue_cancelled_if_requested(job_id);
        registry.emit_queue_cancelled_if_requested(job_id);
        let (history, _rx) = registry.subscribe(job_id).unwrap();
        let cancelled_count = history
            .iter()
            .filter(|e| matches!(e, Event::QueueCancelled { .. }))
            .count();
        assert_eq!(cancelled_count, 1);
    }

    #[test]
    fn finish_emits_queue_done_last() {
        let registry = JobRegistry::new();
        let job_id = registry.create_job();
        registry.emit(job_id, Event::ItemStart { id: "a".to_string() });
        registry.finish(job_id);
        let (history, _rx) = registry.subscribe(job_id).unwrap();
        assert!(matches!(history.last(), Some(Event::QueueDone { .. })));
    }

    #[tokio::test]
    async fn live_receiver_gets_events_emitted_after_subscribe() {
        let registry = JobRegistry::new();
        let job_id = registry.create_job();
        let (_history, mut rx) = registry.subscribe(job_id).unwrap();
        registry.emit(job_id, Event::ItemStart { id: "a".to_string() });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::ItemStart { ref id } if id == "a"));
    }

    #[test]
    fn item_outcomes_folds_history_in_first_seen_order() {
        use crate::model::{ItemStatus, Outputs};
        use pretty_assertions::assert_eq;

        let registry = JobRegistry::new();
        let job_id = registry.create_job();
        registry.emit(job_id, Event::ItemStart { id: "b".to_string() });
        registry.emit(job_id, Event::ItemStart { id: "a".to_string() });
        registry.emit(
            job_id,
            Event::ItemDone {
                id: "b".to_string(),
                outputs: Outputs {
                    audio_path: Some("out/b.aiff".to_string()),
                    video_path: None,
                },
            },
        );
        registry.emit(
            job_id,
            Event::ItemError {
                id: "a".to_string(),
                kind: (&crate::error::DropcrateError::Cancelled).into(),
                message: "cancelled".to_string(),
                hint: None,
            },
        );

        let outcomes = registry.item_outcomes(job_id).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].id, "b");
        assert_eq!(outcomes[0].status, ItemStatus::Done);
        assert_eq!(outcomes[0].outputs.as_ref().unwrap().audio_path.as_deref(), Some("out/b.aiff"));
        assert_eq!(outcomes[1].id, "a");
        assert_eq!(outcomes[1].status, ItemStatus::Error);
    }

    #[test]
    fn item_outcomes_unknown_job_returns_none() {
        let registry = JobRegistry::new();
        assert!(registry.item_outcomes(Uuid::new_v4()).is_none());
    }
}
