//! Refresh orchestrator: turns a stream of "a segment settled" signals into a
//! small number of re-render requests to whatever is showing the hover.
//!
//! Bursts are coalesced by a trailing debounce. After each re-render a
//! cooldown applies; signals arriving during it are folded into one re-render
//! fired when the cooldown ends. A session may trigger at most
//! `max_per_session` re-renders; the count resets after `quiet_reset` without
//! signals, or explicitly via [`RefreshOrchestrator::reset_session`]. Signals
//! absorbed by the cap are owed one re-render, fired once the budget resets.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::{metric_names, MetricsRegistry};
use crate::task::TaskEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub debounce: Duration,
    pub cooldown: Duration,
    pub max_per_session: u32,
    pub quiet_reset: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            cooldown: Duration::from_secs(1),
            max_per_session: 10,
            quiet_reset: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    #[error("no hover is currently displayed")]
    NotShown,
    #[error("display refresh failed: {0}")]
    Failed(String),
}

/// The host's hover surface. `request_rerender` is fire-and-forget; the host
/// is expected to call back into the pipeline to fetch fresh content.
pub trait HoverDisplay: Send + Sync {
    fn request_rerender(&self) -> Result<(), DisplayError>;
}

#[derive(Debug)]
enum Signal {
    Notify,
    ResetSession,
}

/// Handle to the refresh driver task. Clones feed the same driver; the driver
/// exits once every handle is dropped.
#[derive(Clone)]
pub struct RefreshOrchestrator {
    tx: mpsc::UnboundedSender<Signal>,
    issued: Arc<AtomicU32>,
}

impl RefreshOrchestrator {
    /// Spawn the driver on the current runtime.
    pub fn spawn(
        policy: RefreshPolicy,
        display: Arc<dyn HoverDisplay>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let issued = Arc::new(AtomicU32::new(0));
        let driver = Driver {
            policy,
            display,
            metrics,
            issued: Arc::clone(&issued),
            session_count: 0,
            last_render: None,
            last_signal: Instant::now(),
        };
        tokio::spawn(driver.run(rx));
        Self { tx, issued }
    }

    /// One settled segment. Cheap; never blocks.
    pub fn notify(&self) {
        let _ = self.tx.send(Signal::Notify);
    }

    /// Start a fresh re-render budget.
    pub fn reset_session(&self) {
        let _ = self.tx.send(Signal::ResetSession);
    }

    /// Total re-render requests issued so far.
    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::SeqCst)
    }

    /// Forward task events into `notify` until the task manager goes away.
    pub fn forward(&self, mut events: broadcast::Receiver<TaskEvent>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TaskEvent::SegmentSettled { .. }) => this.notify(),
                    Ok(TaskEvent::BatchCompleted { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "refresh bridge lagged");
                        this.notify();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

struct Driver {
    policy: RefreshPolicy,
    display: Arc<dyn HoverDisplay>,
    metrics: Arc<MetricsRegistry>,
    issued: Arc<AtomicU32>,
    session_count: u32,
    last_render: Option<Instant>,
    last_signal: Instant,
}

impl Driver {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Signal>) {
        while let Some(signal) = rx.recv().await {
            if matches!(signal, Signal::ResetSession) {
                self.session_count = 0;
                continue;
            }
            self.observe_notify();

            // Trailing debounce: wait until the burst goes quiet.
            loop {
                match tokio::time::timeout(self.policy.debounce, rx.recv()).await {
                    Ok(Some(Signal::Notify)) => self.observe_notify(),
                    Ok(Some(Signal::ResetSession)) => self.session_count = 0,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            // Cooldown: absorb everything until it ends, then fire once.
            if let Some(last) = self.last_render {
                let ready_at = last + self.policy.cooldown;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep_until(ready_at) => break,
                        signal = rx.recv() => match signal {
                            Some(Signal::Notify) => self.observe_notify(),
                            Some(Signal::ResetSession) => self.session_count = 0,
                            None => return,
                        },
                    }
                }
            }

            if self.session_count >= self.policy.max_per_session {
                debug!(cap = self.policy.max_per_session, "refresh cap reached, deferring to quiet reset");
                loop {
                    let quiet_at = self.last_signal + self.policy.quiet_reset;
                    tokio::select! {
                        _ = tokio::time::sleep_until(quiet_at) => {
                            self.session_count = 0;
                            break;
                        }
                        signal = rx.recv() => match signal {
                            Some(Signal::Notify) => self.observe_notify(),
                            Some(Signal::ResetSession) => {
                                self.session_count = 0;
                                break;
                            }
                            None => return,
                        },
                    }
                }
            }
            self.fire();
        }
        debug!("refresh driver exiting");
    }

    fn observe_notify(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_signal) >= self.policy.quiet_reset {
            self.session_count = 0;
        }
        self.last_signal = now;
    }

    fn fire(&mut self) {
        self.session_count += 1;
        self.last_render = Some(Instant::now());
        self.issued.fetch_add(1, Ordering::SeqCst);
        let lag = Instant::now().duration_since(self.last_signal);
        self.metrics.record(metric_names::REFRESH_LAG, lag.as_micros() as f64);
        match self.display.request_rerender() {
            Ok(()) => debug!(session_count = self.session_count, "hover re-render requested"),
            Err(e) => warn!(error = %e, "hover re-render failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDisplay;
    use tokio::time::sleep;

    fn orchestrator(policy: RefreshPolicy) -> (RefreshOrchestrator, Arc<RecordingDisplay>) {
        let display = Arc::new(RecordingDisplay::new());
        let refresh = RefreshOrchestrator::spawn(policy, display.clone(), Arc::new(MetricsRegistry::new()));
        (refresh, display)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_into_one_rerender() {
        let (refresh, display) = orchestrator(RefreshPolicy::default());
        for _ in 0..8 {
            refresh.notify();
            sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(display.rerenders(), 0);
        sleep(Duration::from_millis(600)).await;
        assert_eq!(display.rerenders(), 1);
        assert_eq!(refresh.issued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_during_cooldown_fires_when_it_ends() {
        let (refresh, display) = orchestrator(RefreshPolicy::default());
        refresh.notify();
        sleep(Duration::from_millis(600)).await;
        assert_eq!(display.rerenders(), 1);

        // First render at t=500; cooldown runs until t=1500.
        refresh.notify();
        sleep(Duration::from_millis(600)).await;
        assert_eq!(display.rerenders(), 1);
        sleep(Duration::from_millis(400)).await;
        assert_eq!(display.rerenders(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn session_cap_then_quiet_reset() {
        let (refresh, display) = orchestrator(RefreshPolicy {
            max_per_session: 2,
            ..RefreshPolicy::default()
        });
        for _ in 0..4 {
            refresh.notify();
            sleep(Duration::from_secs(2)).await;
        }
        assert_eq!(display.rerenders(), 2);

        // The absorbed signals are owed one re-render once the session is quiet.
        sleep(Duration::from_secs(6)).await;
        assert_eq!(display.rerenders(), 3);

        refresh.notify();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(display.rerenders(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn last_burst_after_cap_is_not_lost() {
        let (refresh, display) = orchestrator(RefreshPolicy {
            max_per_session: 2,
            ..RefreshPolicy::default()
        });
        refresh.notify();
        sleep(Duration::from_secs(2)).await;
        refresh.notify();
        sleep(Duration::from_secs(1)).await;
        refresh.notify();

        sleep(Duration::from_secs(4)).await;
        assert_eq!(display.rerenders(), 2);
        sleep(Duration::from_secs(56)).await;
        assert_eq!(display.rerenders(), 3);
        assert_eq!(refresh.issued(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rerender_lag_is_recorded_as_latency() {
        let display = Arc::new(RecordingDisplay::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let refresh = RefreshOrchestrator::spawn(RefreshPolicy::default(), display.clone(), Arc::clone(&metrics));
        refresh.notify();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(metrics.count(metric_names::REFRESH_LAG), 1);
        let p50 = metrics.percentile(metric_names::REFRESH_LAG, 50.0);
        assert!(p50 >= 500_000.0, "lag covers the debounce, got {p50}");
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_reset_restores_budget() {
        let (refresh, display) = orchestrator(RefreshPolicy {
            max_per_session: 1,
            ..RefreshPolicy::default()
        });
        refresh.notify();
        sleep(Duration::from_secs(2)).await;
        refresh.notify();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(display.rerenders(), 1);

        refresh.reset_session();
        refresh.notify();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(display.rerenders(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn display_errors_are_swallowed() {
        let (refresh, display) = orchestrator(RefreshPolicy::default());
        display.set_failing(true);
        refresh.notify();
        sleep(Duration::from_secs(2)).await;
        display.set_failing(false);
        refresh.notify();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(display.rerenders(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bridge_notifies_on_settled_segments() {
        let (refresh, display) = orchestrator(RefreshPolicy::default());
        let (tx, rx) = broadcast::channel(16);
        let bridge = refresh.forward(rx);
        tx.send(TaskEvent::SegmentSettled {
            hash: crate::cache::ContentHash::of("x"),
            result: Ok("y".into()),
        })
        .expect("subscriber");
        sleep(Duration::from_secs(1)).await;
        assert_eq!(display.rerenders(), 1);

        drop(tx);
        bridge.await.expect("bridge exits when sender drops");
    }
}
