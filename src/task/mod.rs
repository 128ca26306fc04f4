//! Task manager: background translation of the segments a hover could not
//! serve from cache.
//!
//! Work is deduplicated against the in-flight set, run under a concurrency
//! bound (serial with spacing, or capped parallel), and reported through a
//! broadcast channel as one event per settled segment plus one per finished
//! batch. A new foreground batch supersedes the previous one: hashes only the
//! old batch still wanted are cancelled and their late results discarded.

pub mod inflight;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ContentHash, ContentStore};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::segment::Segment;
use crate::translate::{TranslateError, TranslationBackend};
use inflight::InFlightSet;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// One backend call at a time with a fixed gap between calls.
    Serial { delay: Duration },
    /// Up to `max` simultaneous backend calls.
    Parallel { max: usize },
}

impl ExecutionPolicy {
    fn permits(&self) -> usize {
        match self {
            ExecutionPolicy::Serial { .. } => 1,
            ExecutionPolicy::Parallel { max } => (*max).max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOptions {
    pub policy: ExecutionPolicy,
    /// Hard limit per backend call.
    pub request_timeout: Duration,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            policy: ExecutionPolicy::Serial {
                delay: Duration::from_millis(200),
            },
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(u64);

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// Exactly one segment settled. Cancelled work never produces this.
    SegmentSettled {
        hash: ContentHash,
        result: Result<String, TranslateError>,
    },
    /// Every segment of the batch has settled.
    BatchCompleted { batch: BatchId },
}

/// What `submit` did with each segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub batch: BatchId,
    /// Claimed by this batch; a backend call is queued.
    pub started: Vec<ContentHash>,
    /// Already in flight elsewhere; no second call was made.
    pub pending: Vec<ContentHash>,
    /// Settled without a backend call (code pass-through, or already cached).
    pub resolved: Vec<ContentHash>,
}

impl SubmitReceipt {
    pub fn is_pending(&self, hash: &ContentHash) -> bool {
        self.started.contains(hash) || self.pending.contains(hash)
    }
}

struct BatchState {
    remaining: HashSet<ContentHash>,
}

#[derive(Default)]
struct ManagerState {
    in_flight: InFlightSet,
    batches: HashMap<BatchId, BatchState>,
    /// Latest foreground batch; the next `submit` supersedes it.
    current: Option<BatchId>,
    next_batch: u64,
}

impl ManagerState {
    fn next_batch_id(&mut self) -> BatchId {
        self.next_batch += 1;
        BatchId(self.next_batch)
    }

    /// Drop `prev` and cancel the hashes nobody else still wants.
    fn supersede(&mut self, prev: BatchId, next: &HashSet<ContentHash>) -> Vec<ContentHash> {
        let Some(old) = self.batches.remove(&prev) else {
            return Vec::new();
        };
        let wanted_elsewhere: HashSet<ContentHash> = self
            .batches
            .values()
            .flat_map(|b| b.remaining.iter().copied())
            .collect();
        let stale: Vec<ContentHash> = old
            .remaining
            .into_iter()
            .filter(|h| !next.contains(h) && !wanted_elsewhere.contains(h))
            .collect();
        for hash in &stale {
            self.in_flight.cancel(hash);
        }
        stale
    }

    /// Remove a settled hash from every batch. Returns batches now complete.
    fn finish_hash(&mut self, hash: &ContentHash) -> Vec<BatchId> {
        let mut done = Vec::new();
        self.batches.retain(|id, batch| {
            batch.remaining.remove(hash);
            if batch.remaining.is_empty() {
                done.push(*id);
                false
            } else {
                true
            }
        });
        if self.current.is_some_and(|c| done.contains(&c)) {
            self.current = None;
        }
        done
    }
}

struct Shared {
    state: Mutex<ManagerState>,
    store: Arc<ContentStore>,
    backend: RwLock<Arc<dyn TranslationBackend>>,
    permits: Semaphore,
    options: TaskOptions,
    events: broadcast::Sender<TaskEvent>,
    metrics: Arc<MetricsRegistry>,
}

impl Shared {
    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine: the cache already holds the result.
        let _ = self.events.send(event);
    }

    /// Write the outcome and release the claim in one critical section, so
    /// a hover never sees the hash both absent from cache and not in flight.
    fn settle(&self, hash: ContentHash, text: &str, ticket: u64, result: Result<String, TranslateError>) {
        let mut state = self.state.lock();
        if !state.in_flight.release(&hash, ticket) {
            debug!(?hash, "discarding result of cancelled translation");
            return;
        }
        match &result {
            Ok(translated) => self.store.set(hash, text, translated),
            Err(e) if e.is_user_visible() => self.store.set_error(hash, text, &e.to_string()),
            Err(_) => {}
        }
        if result.as_ref().err().map_or(true, TranslateError::is_user_visible) {
            self.emit(TaskEvent::SegmentSettled { hash, result });
        }
        for batch in state.finish_hash(&hash) {
            debug!(?batch, "batch completed");
            self.emit(TaskEvent::BatchCompleted { batch });
        }
    }
}

struct Job {
    hash: ContentHash,
    text: String,
    ticket: u64,
    token: CancellationToken,
    enqueued_at: Instant,
}

/// Cheap to clone; clones share the same queue and in-flight set.
#[derive(Clone)]
pub struct TaskManager {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl TaskManager {
    /// Must be called within a Tokio runtime; jobs are spawned on it.
    pub fn new(
        store: Arc<ContentStore>,
        backend: Arc<dyn TranslationBackend>,
        options: TaskOptions,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(policy = ?options.policy, backend = backend.name(), "task manager ready");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ManagerState::default()),
                store,
                backend: RwLock::new(backend),
                permits: Semaphore::new(options.policy.permits()),
                options,
                events,
                metrics,
            }),
            runtime: Handle::current(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.shared.events.subscribe()
    }

    /// Submit the segments of one hover request. Supersedes the previous
    /// foreground batch.
    pub fn submit(&self, segments: &[Segment]) -> SubmitReceipt {
        self.enqueue(segments, true)
    }

    /// Submit without superseding anything (manual retranslation).
    pub fn submit_detached(&self, segments: &[Segment]) -> SubmitReceipt {
        self.enqueue(segments, false)
    }

    fn enqueue(&self, segments: &[Segment], foreground: bool) -> SubmitReceipt {
        let mut seen = HashSet::new();
        let wanted: Vec<(ContentHash, &Segment)> = segments
            .iter()
            .map(|s| (ContentHash::of(&s.content), s))
            .filter(|(h, _)| seen.insert(*h))
            .collect();

        let mut state = self.shared.state.lock();
        let batch = state.next_batch_id();
        if foreground {
            if let Some(prev) = state.current.take() {
                let stale = state.supersede(prev, &seen);
                if !stale.is_empty() {
                    debug!(?prev, cancelled = stale.len(), "superseded batch");
                }
            }
        }

        let mut receipt = SubmitReceipt {
            batch,
            started: Vec::new(),
            pending: Vec::new(),
            resolved: Vec::new(),
        };
        let mut remaining = HashSet::new();
        let mut jobs = Vec::new();
        for (hash, segment) in wanted {
            if segment.is_code() {
                self.shared.store.set(hash, &segment.content, &segment.content);
                receipt.resolved.push(hash);
            } else if state.in_flight.contains(&hash) {
                remaining.insert(hash);
                receipt.pending.push(hash);
            } else if self.shared.store.peek(&hash).is_some() {
                // Settled since the caller's lookup.
                receipt.resolved.push(hash);
            } else {
                let (ticket, token) = state.in_flight.claim(hash);
                remaining.insert(hash);
                receipt.started.push(hash);
                jobs.push(Job {
                    hash,
                    text: segment.content.clone(),
                    ticket,
                    token,
                    enqueued_at: Instant::now(),
                });
            }
        }

        if remaining.is_empty() {
            self.shared.emit(TaskEvent::BatchCompleted { batch });
        } else {
            state.batches.insert(batch, BatchState { remaining });
            if foreground {
                state.current = Some(batch);
            }
        }
        drop(state);

        debug!(
            ?batch,
            started = receipt.started.len(),
            pending = receipt.pending.len(),
            resolved = receipt.resolved.len(),
            "batch submitted"
        );
        for job in jobs {
            self.runtime.spawn(run_job(Arc::clone(&self.shared), job));
        }
        receipt
    }

    pub fn is_in_flight(&self, hash: &ContentHash) -> bool {
        self.shared.state.lock().in_flight.contains(hash)
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.state.lock().in_flight.len()
    }

    /// Cancel every in-flight translation and forget all batches.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.shared.state.lock();
        let cancelled = state.in_flight.cancel_all();
        state.batches.clear();
        state.current = None;
        if !cancelled.is_empty() {
            info!(cancelled = cancelled.len(), "cancelled all translations");
        }
        cancelled.len()
    }

    /// Replace the backend. Work started against the old one is cancelled.
    pub fn set_backend(&self, backend: Arc<dyn TranslationBackend>) {
        info!(backend = backend.name(), "switching translation backend");
        *self.shared.backend.write() = backend;
        self.cancel_all();
    }
}

async fn run_job(shared: Arc<Shared>, job: Job) {
    let Job {
        hash,
        text,
        ticket,
        token,
        enqueued_at,
    } = job;

    let _permit = tokio::select! {
        permit = shared.permits.acquire() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
        _ = token.cancelled() => {
            debug!(?hash, "translation cancelled while queued");
            return;
        }
    };
    shared
        .metrics
        .record(metric_names::QUEUE_WAIT, enqueued_at.elapsed().as_micros() as f64);

    let backend = Arc::clone(&*shared.backend.read());
    let timeout = shared.options.request_timeout;
    let start = Instant::now();
    let result = tokio::select! {
        r = tokio::time::timeout(timeout, backend.translate(&text, &token)) => {
            r.unwrap_or(Err(TranslateError::Timeout))
        }
        _ = token.cancelled() => Err(TranslateError::Cancelled),
    };
    let elapsed_us = start.elapsed().as_micros() as f64;

    match &result {
        Ok(_) => shared.metrics.record(metric_names::TRANSLATE_DONE, elapsed_us),
        Err(TranslateError::Cancelled) => {}
        Err(e) => {
            warn!(?hash, backend = backend.name(), error = %e, "segment translation failed");
            shared.metrics.record(metric_names::TRANSLATE_FAILED, elapsed_us);
        }
    }
    let called = !matches!(result, Err(TranslateError::Cancelled));
    shared.settle(hash, &text, ticket, result);

    if let ExecutionPolicy::Serial { delay } = shared.options.policy {
        if called && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{SystemClock, DEFAULT_TTL};
    use crate::testing::{next_event, FakeBackend};

    fn parallel(max: usize) -> TaskOptions {
        TaskOptions {
            policy: ExecutionPolicy::Parallel { max },
            request_timeout: Duration::from_secs(30),
        }
    }

    fn manager(backend: Arc<FakeBackend>, options: TaskOptions) -> (TaskManager, Arc<ContentStore>) {
        let store = ContentStore::in_memory(DEFAULT_TTL, Arc::new(SystemClock));
        let tasks = TaskManager::new(
            Arc::clone(&store),
            backend,
            options,
            Arc::new(MetricsRegistry::new()),
        );
        (tasks, store)
    }

    async fn settled(rx: &mut broadcast::Receiver<TaskEvent>) -> (ContentHash, Result<String, TranslateError>) {
        loop {
            if let TaskEvent::SegmentSettled { hash, result } = next_event(rx).await {
                return (hash, result);
            }
        }
    }

    #[tokio::test]
    async fn same_hash_twice_calls_backend_once() {
        let backend = Arc::new(FakeBackend::new().gated());
        let (tasks, store) = manager(backend.clone(), parallel(3));
        let mut rx = tasks.subscribe();
        let seg = Segment::text("Returns the length of the slice.");

        let first = tasks.submit_detached(&[seg.clone()]);
        let second = tasks.submit_detached(&[seg.clone()]);
        assert_eq!(first.started.len(), 1);
        assert_eq!(second.pending, first.started);

        backend.open_gate(10);
        let (hash, result) = settled(&mut rx).await;
        assert_eq!(hash, ContentHash::of(&seg.content));
        assert_eq!(result.as_deref(), Ok("译:Returns the length of the slice."));
        assert_eq!(backend.calls().len(), 1);
        assert!(!tasks.is_in_flight(&hash));
        assert!(store.peek(&hash).is_some());
    }

    #[tokio::test]
    async fn only_new_segment_starts_when_other_is_in_flight() {
        let backend = Arc::new(FakeBackend::new().gated());
        let (tasks, _) = manager(backend.clone(), parallel(3));
        let mut rx = tasks.subscribe();
        let seg_a = Segment::text("Segment A.");
        let seg_b = Segment::text("Segment B.");
        tasks.submit(&[seg_a.clone()]);

        let receipt = tasks.submit(&[seg_a.clone(), seg_b.clone()]);
        assert_eq!(receipt.pending, vec![ContentHash::of("Segment A.")]);
        assert_eq!(receipt.started, vec![ContentHash::of("Segment B.")]);
        assert!(tasks.is_in_flight(&ContentHash::of("Segment A.")));

        backend.open_gate(10);
        settled(&mut rx).await;
        settled(&mut rx).await;
        let mut calls = backend.calls();
        calls.sort();
        assert_eq!(calls, vec!["Segment A.".to_string(), "Segment B.".to_string()]);
    }

    #[tokio::test]
    async fn code_segments_pass_through_without_backend() {
        let backend = Arc::new(FakeBackend::new());
        let (tasks, store) = manager(backend.clone(), parallel(3));
        let code = Segment::code("rust", "let x = 1;");
        let receipt = tasks.submit(&[code]);

        let hash = ContentHash::of("let x = 1;");
        assert_eq!(receipt.resolved, vec![hash]);
        assert_eq!(store.peek(&hash).map(|e| e.translated_text), Some("let x = 1;".to_string()));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn failure_is_isolated_to_its_segment() {
        let backend = Arc::new(FakeBackend::new().failing_on("Broken."));
        let (tasks, store) = manager(backend.clone(), parallel(3));
        let mut rx = tasks.subscribe();
        tasks.submit(&[Segment::text("Broken."), Segment::text("Fine.")]);

        let mut outcomes = HashMap::new();
        for _ in 0..2 {
            let (hash, result) = settled(&mut rx).await;
            outcomes.insert(hash, result);
        }
        assert!(matches!(
            outcomes[&ContentHash::of("Broken.")],
            Err(TranslateError::Transport { .. })
        ));
        assert_eq!(outcomes[&ContentHash::of("Fine.")].as_deref(), Ok("译:Fine."));
        assert!(store.peek(&ContentHash::of("Broken.")).is_some_and(|e| e.is_error()));
        assert!(store.peek(&ContentHash::of("Fine.")).is_some_and(|e| !e.is_error()));
    }

    #[tokio::test]
    async fn disjoint_batch_cancels_previous_without_events() {
        let backend = Arc::new(FakeBackend::new().gated());
        let (tasks, store) = manager(backend.clone(), parallel(3));
        let mut rx = tasks.subscribe();
        let a = tasks.submit(&[Segment::text("Old one."), Segment::text("Old two.")]);
        tokio::task::yield_now().await;

        let b = tasks.submit(&[Segment::text("New one.")]);
        for hash in &a.started {
            assert!(!tasks.is_in_flight(hash));
        }
        assert_eq!(tasks.in_flight_count(), 1);

        backend.open_gate(10);
        let (hash, _) = settled(&mut rx).await;
        assert_eq!(hash, b.started[0]);
        assert_eq!(next_event(&mut rx).await, TaskEvent::BatchCompleted { batch: b.batch });
        assert!(rx.try_recv().is_err());
        assert!(store.peek(&ContentHash::of("Old one.")).is_none());
    }

    #[tokio::test]
    async fn overlapping_hashes_survive_supersession() {
        let backend = Arc::new(FakeBackend::new().gated());
        let (tasks, _) = manager(backend.clone(), parallel(3));
        tasks.submit(&[Segment::text("Shared."), Segment::text("Dropped.")]);
        let b = tasks.submit(&[Segment::text("Shared.")]);
        assert_eq!(b.pending, vec![ContentHash::of("Shared.")]);
        assert!(tasks.is_in_flight(&ContentHash::of("Shared.")));
        assert!(!tasks.is_in_flight(&ContentHash::of("Dropped.")));
    }

    #[tokio::test]
    async fn batch_completes_after_every_segment_settles() {
        let backend = Arc::new(FakeBackend::new());
        let (tasks, _) = manager(backend, parallel(2));
        let mut rx = tasks.subscribe();
        let receipt = tasks.submit(&[Segment::text("One."), Segment::text("Two."), Segment::text("Three.")]);

        let mut settled_count = 0;
        loop {
            match next_event(&mut rx).await {
                TaskEvent::SegmentSettled { .. } => settled_count += 1,
                TaskEvent::BatchCompleted { batch } => {
                    assert_eq!(batch, receipt.batch);
                    break;
                }
            }
        }
        assert_eq!(settled_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_backend_times_out() {
        let backend = Arc::new(FakeBackend::new().hanging());
        let (tasks, store) = manager(
            backend,
            TaskOptions {
                policy: ExecutionPolicy::Serial { delay: Duration::ZERO },
                request_timeout: Duration::from_secs(30),
            },
        );
        let mut rx = tasks.subscribe();
        tasks.submit(&[Segment::text("Never answered.")]);

        let (_, result) = settled(&mut rx).await;
        assert_eq!(result, Err(TranslateError::Timeout));
        let entry = store.peek(&ContentHash::of("Never answered.")).expect("error entry");
        assert_eq!(entry.error.as_deref(), Some("translation request timed out"));
    }

    #[tokio::test]
    async fn parallel_policy_bounds_concurrency() {
        let backend = Arc::new(FakeBackend::new().with_delay(Duration::from_millis(20)));
        let (tasks, _) = manager(backend.clone(), parallel(2));
        let mut rx = tasks.subscribe();
        let segments: Vec<Segment> = (0..6).map(|i| Segment::text(format!("Line {i}."))).collect();
        tasks.submit(&segments);

        for _ in 0..6 {
            settled(&mut rx).await;
        }
        assert_eq!(backend.max_active(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn serial_policy_spaces_calls() {
        let backend = Arc::new(FakeBackend::new());
        let (tasks, _) = manager(
            backend.clone(),
            TaskOptions {
                policy: ExecutionPolicy::Serial {
                    delay: Duration::from_millis(200),
                },
                request_timeout: Duration::from_secs(30),
            },
        );
        let mut rx = tasks.subscribe();
        let start = tokio::time::Instant::now();
        tasks.submit(&[Segment::text("First."), Segment::text("Second."), Segment::text("Third.")]);
        for _ in 0..3 {
            settled(&mut rx).await;
        }
        assert_eq!(backend.max_active(), 1);
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn switching_backend_cancels_in_flight() {
        let old = Arc::new(FakeBackend::new().gated());
        let (tasks, _) = manager(old, parallel(3));
        tasks.submit(&[Segment::text("Pending forever.")]);
        assert_eq!(tasks.in_flight_count(), 1);

        tasks.set_backend(Arc::new(FakeBackend::new()));
        assert_eq!(tasks.in_flight_count(), 0);
    }
}
