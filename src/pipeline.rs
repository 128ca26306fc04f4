//! Hover pipeline: the per-request entry point plus the outward commands.
//!
//! `handle` never waits on the network. It answers from the content store,
//! shows a placeholder for every miss, and hands the misses to the task
//! manager; completed translations reach the screen through the refresh
//! orchestrator asking the host to re-render.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheStats, ContentHash, ContentStore};
use crate::config::Config;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::refresh::{HoverDisplay, RefreshOrchestrator, RefreshPolicy};
use crate::segment::{Segment, Segmenter};
use crate::task::{SubmitReceipt, TaskManager, TaskOptions};
use crate::translate::TranslationBackend;

/// Shown in place of a translation that has not arrived yet.
pub const PLACEHOLDER: &str = "translating…";

/// Setting key of the "show translated vs original" preference.
pub const SHOW_TRANSLATED_KEY: &str = "showTranslated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    Resolved,
    Pending,
    Error,
}

/// Per-segment view, rebuilt on every hover request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParagraphState {
    pub hash: String,
    pub segment: Segment,
    pub translated: Option<String>,
    pub error: Option<String>,
    pub is_translating: bool,
}

impl ParagraphState {
    fn from_entry(hash: ContentHash, segment: Segment, entry: CacheEntry) -> Self {
        let (translated, error) = match entry.error {
            Some(error) => (None, Some(error)),
            None => (Some(entry.translated_text), None),
        };
        Self {
            hash: hash.to_hex(),
            segment,
            translated,
            error,
            is_translating: false,
        }
    }

    fn pending(hash: ContentHash, segment: Segment) -> Self {
        Self {
            hash: hash.to_hex(),
            segment,
            translated: None,
            error: None,
            is_translating: true,
        }
    }

    /// Code is never translated; it renders as itself.
    fn passthrough(hash: ContentHash, segment: Segment) -> Self {
        let translated = Some(segment.content.clone());
        Self {
            hash: hash.to_hex(),
            segment,
            translated,
            error: None,
            is_translating: false,
        }
    }

    pub fn original(&self) -> &str {
        &self.segment.content
    }

    pub fn status(&self) -> SegmentStatus {
        if self.error.is_some() {
            SegmentStatus::Error
        } else if self.is_translating {
            SegmentStatus::Pending
        } else {
            SegmentStatus::Resolved
        }
    }

    fn to_markdown(&self, show_translated: bool) -> String {
        if self.segment.is_code() {
            return self.segment.to_source();
        }
        if !show_translated {
            return self.segment.content.clone();
        }
        match (&self.translated, &self.error) {
            (Some(translated), _) => translated.clone(),
            (None, Some(error)) => format!("{}\n\n> ⚠ {error}", self.segment.content),
            (None, None) => format!("*{PLACEHOLDER}*"),
        }
    }
}

/// Everything the host needs to draw one hover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoverRender {
    pub paragraphs: Vec<ParagraphState>,
    pub show_translated: bool,
}

impl HoverRender {
    /// No segment is waiting on a translation.
    pub fn is_settled(&self) -> bool {
        self.paragraphs.iter().all(|p| !p.is_translating)
    }

    pub fn count(&self, status: SegmentStatus) -> usize {
        self.paragraphs.iter().filter(|p| p.status() == status).count()
    }

    pub fn to_markdown(&self) -> String {
        self.paragraphs
            .iter()
            .map(|p| p.to_markdown(self.show_translated))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Single-slot request token. Entering while a request holds the slot fails.
#[derive(Default)]
struct RequestSlot {
    holder: AtomicU64,
    next: AtomicU64,
}

struct RequestGuard<'a> {
    slot: &'a RequestSlot,
    token: u64,
}

impl RequestSlot {
    fn try_enter(&self) -> Option<RequestGuard<'_>> {
        let token = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.holder
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RequestGuard { slot: self, token })
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .slot
            .holder
            .compare_exchange(self.token, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// Pipeline context: owns every component for one activation.
pub struct Pipeline {
    segmenter: Segmenter,
    store: Arc<ContentStore>,
    tasks: TaskManager,
    refresh: RefreshOrchestrator,
    metrics: Arc<MetricsRegistry>,
    show_translated: AtomicBool,
    slot: RequestSlot,
}

impl Pipeline {
    /// Wire the components together. Must be called within a Tokio runtime.
    pub fn new(
        config: &Config,
        store: Arc<ContentStore>,
        backend: Arc<dyn TranslationBackend>,
        display: Arc<dyn HoverDisplay>,
    ) -> Self {
        Self::with_parts(
            Segmenter::new(config.segment.target_size),
            store,
            backend,
            display,
            TaskOptions::from(&config.tasks),
            RefreshPolicy::from(&config.refresh),
        )
    }

    pub fn with_parts(
        segmenter: Segmenter,
        store: Arc<ContentStore>,
        backend: Arc<dyn TranslationBackend>,
        display: Arc<dyn HoverDisplay>,
        options: TaskOptions,
        refresh_policy: RefreshPolicy,
    ) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let tasks = TaskManager::new(Arc::clone(&store), backend, options, Arc::clone(&metrics));
        let refresh = RefreshOrchestrator::spawn(refresh_policy, display, Arc::clone(&metrics));
        // Detached; ends when the task manager is dropped.
        let _ = refresh.forward(tasks.subscribe());

        let show_translated = store
            .setting(SHOW_TRANSLATED_KEY)
            .map_or(true, |v| v != "false");
        info!(show_translated, persistent = store.is_persistent(), "hover pipeline ready");

        Self {
            segmenter,
            store,
            tasks,
            refresh,
            metrics,
            show_translated: AtomicBool::new(show_translated),
            slot: RequestSlot::default(),
        }
    }

    /// Answer one hover request from cache and queue the misses. Returns
    /// `None` when called while another request is being handled.
    pub fn handle(&self, raw: &str) -> Option<HoverRender> {
        let Some(_guard) = self.slot.try_enter() else {
            debug!("nested hover request ignored");
            return None;
        };
        let span = self.metrics.span(metric_names::HOVER_HANDLED);

        let segments = self.segmenter.segment(raw);
        let mut paragraphs = Vec::with_capacity(segments.len());
        let mut misses = Vec::new();
        for segment in segments {
            let hash = ContentHash::of(&segment.content);
            let paragraph = match self.store.get(&hash) {
                Some(entry) => ParagraphState::from_entry(hash, segment, entry),
                None => {
                    misses.push(segment.clone());
                    if segment.is_code() {
                        ParagraphState::passthrough(hash, segment)
                    } else {
                        ParagraphState::pending(hash, segment)
                    }
                }
            };
            paragraphs.push(paragraph);
        }

        if !misses.is_empty() {
            let receipt = self.tasks.submit(&misses);
            self.reconcile(&mut paragraphs, &receipt);
        }

        let render = HoverRender {
            paragraphs,
            show_translated: self.show_translated(),
        };
        span.finish();
        Some(render)
    }

    /// Misses that settled between lookup and submit render from the store.
    fn reconcile(&self, paragraphs: &mut [ParagraphState], receipt: &SubmitReceipt) {
        for paragraph in paragraphs.iter_mut().filter(|p| p.is_translating) {
            let hash = ContentHash::of(&paragraph.segment.content);
            if receipt.is_pending(&hash) {
                continue;
            }
            if let Some(entry) = self.store.peek(&hash) {
                *paragraph = ParagraphState::from_entry(hash, paragraph.segment.clone(), entry);
            }
        }
    }

    pub fn show_translated(&self) -> bool {
        self.show_translated.load(Ordering::SeqCst)
    }

    /// Flip between translated and original text. Persisted.
    pub fn toggle_show_translation(&self) -> bool {
        let show = !self.show_translated.fetch_xor(true, Ordering::SeqCst);
        self.store
            .set_setting(SHOW_TRANSLATED_KEY, if show { "true" } else { "false" });
        self.refresh.notify();
        info!(show_translated = show, "display preference changed");
        show
    }

    /// Drop the cached translation of `original` and translate it again.
    pub fn retranslate(&self, original: &str) -> SubmitReceipt {
        let hash = ContentHash::of(original);
        self.store.delete(&hash);
        self.refresh.reset_session();
        info!(?hash, "retranslation requested");
        self.tasks.submit_detached(&[Segment::text(original)])
    }

    /// Use another backend from now on. Every cached translation and all
    /// in-flight work belonged to the old backend and is discarded.
    pub fn switch_backend(&self, backend: Arc<dyn TranslationBackend>) -> usize {
        self.tasks.set_backend(backend);
        let cleared = self.store.clear();
        self.refresh.reset_session();
        info!(cleared, "cache cleared after backend switch");
        cleared
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.store.stats()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// Cancel outstanding work and persist everything.
    pub async fn shutdown(&self) {
        self.tasks.cancel_all();
        self.store.flush().await;
        info!("hover pipeline shut down");
    }
}
