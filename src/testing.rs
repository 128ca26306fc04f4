//! Test doubles shared by the module tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::refresh::{DisplayError, HoverDisplay};
use crate::task::TaskEvent;
use crate::translate::{TranslateError, TranslationBackend};

/// Scripted backend: answers `译:{text}` unless told otherwise.
#[derive(Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<String>>,
    failing: HashSet<String>,
    gate: Option<Arc<Semaphore>>,
    delay: Option<Duration>,
    hang: bool,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

struct Active<'a>(&'a AtomicUsize);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls block until [`open_gate`](Self::open_gate) releases them.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn failing_on(mut self, text: &str) -> Self {
        self.failing.insert(text.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Calls never answer; only cancellation ends them.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn open_gate(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn respond(&self, text: &str, cancel: &CancellationToken) -> Result<String, TranslateError> {
        if let Some(gate) = &self.gate {
            tokio::select! {
                permit = gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
            }
        }
        if self.hang {
            cancel.cancelled().await;
            return Err(TranslateError::Cancelled);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(text) {
            return Err(TranslateError::transport(Some(503), "HTTP 503: service unavailable"));
        }
        Ok(format!("译:{text}"))
    }
}

impl TranslationBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn translate<'a>(
        &'a self,
        text: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<String, TranslateError>> {
        Box::pin(async move {
            self.calls.lock().push(text.to_string());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            let _active = Active(&self.active);
            self.respond(text, cancel).await
        })
    }
}

/// Display sink that counts re-render requests.
#[derive(Default)]
pub struct RecordingDisplay {
    rerenders: AtomicUsize,
    failing: std::sync::atomic::AtomicBool,
}

impl RecordingDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rerenders(&self) -> usize {
        self.rerenders.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl HoverDisplay for RecordingDisplay {
    fn request_rerender(&self) -> Result<(), DisplayError> {
        self.rerenders.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DisplayError::Failed("hover widget disposed".into()));
        }
        Ok(())
    }
}

/// Next task event, failing the test instead of hanging forever.
pub async fn next_event(rx: &mut broadcast::Receiver<TaskEvent>) -> TaskEvent {
    tokio::time::timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("timed out waiting for task event")
        .expect("task event channel closed")
}
