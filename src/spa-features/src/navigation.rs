//! Navigation detection.
//!
//! Single-page applications change the URL without reloading, so the
//! watcher listens to two independent triggers: DOM mutation notifications
//! and a fixed-interval poll for `history` navigations that mutate nothing.
//! Whatever fires, the current URL is compared against the last one seen,
//! and the callback runs once per actual change.

use async_trait::async_trait;
use futures::future::select_all;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Where the current page URL comes from.
pub trait UrlSource: Send + Sync {
    /// The current URL.
    fn current_url(&self) -> String;
}

impl<F> UrlSource for F
where
    F: Fn() -> String + Send + Sync,
{
    fn current_url(&self) -> String {
        self()
    }
}

/// In-memory location, updated by the host.
#[derive(Debug, Default)]
pub struct StaticUrl {
    url: RwLock<String>,
}

impl StaticUrl {
    /// Create a location pointing at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: RwLock::new(url.into()),
        }
    }

    /// Navigate to `url`.
    pub fn set(&self, url: impl Into<String>) {
        *self.url.write() = url.into();
    }
}

impl UrlSource for StaticUrl {
    fn current_url(&self) -> String {
        self.url.read().clone()
    }
}

/// What woke the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// The document changed
    Mutation,
    /// The poll interval elapsed
    Poll,
}

/// A source of "the URL may have changed" signals.
#[async_trait]
pub trait NavigationTrigger: Send {
    /// Wait for the next signal. `None` means the trigger is exhausted.
    ///
    /// Must be cancel safe: the watcher races all triggers and drops the
    /// losers.
    async fn wait(&mut self) -> Option<TriggerKind>;
}

/// Handle the host uses to report DOM mutations.
///
/// At most one signal is buffered: mutations reported while one is already
/// pending coalesce into it.
#[derive(Debug, Clone)]
pub struct MutationNotifier {
    tx: mpsc::Sender<()>,
}

impl MutationNotifier {
    /// Report a mutation. Never blocks. Returns `false` once the watcher is
    /// gone.
    pub fn notify(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Closed(())) => false,
        }
    }
}

/// Trigger fed by [`MutationNotifier`]s.
#[derive(Debug)]
pub struct MutationTrigger {
    rx: mpsc::Receiver<()>,
}

/// Create a connected notifier/trigger pair.
pub fn mutation_channel() -> (MutationNotifier, MutationTrigger) {
    let (tx, rx) = mpsc::channel(1);
    (MutationNotifier { tx }, MutationTrigger { rx })
}

#[async_trait]
impl NavigationTrigger for MutationTrigger {
    async fn wait(&mut self) -> Option<TriggerKind> {
        self.rx.recv().await?;
        // A burst of mutations is one signal.
        while self.rx.try_recv().is_ok() {}
        Some(TriggerKind::Mutation)
    }
}

/// Fixed-interval poll trigger.
#[derive(Debug)]
pub struct PollTrigger {
    interval: Interval,
}

impl PollTrigger {
    /// Poll every `period`, first tick one period from now.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl NavigationTrigger for PollTrigger {
    async fn wait(&mut self) -> Option<TriggerKind> {
        self.interval.tick().await;
        Some(TriggerKind::Poll)
    }
}

/// Detects URL changes and reports each one exactly once.
pub struct NavigationWatcher {
    source: Arc<dyn UrlSource>,
    last_url: String,
    triggers: Vec<Box<dyn NavigationTrigger>>,
    debounce: Duration,
}

impl NavigationWatcher {
    /// Create a watcher; the current URL is the baseline.
    pub fn new(source: Arc<dyn UrlSource>) -> Self {
        let last_url = source.current_url();
        Self {
            source,
            last_url,
            triggers: Vec::new(),
            debounce: Duration::ZERO,
        }
    }

    /// Add a trigger.
    pub fn with_trigger(mut self, trigger: Box<dyn NavigationTrigger>) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Wait this long after a signal before comparing URLs.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Last URL observed.
    pub fn last_url(&self) -> &str {
        &self.last_url
    }

    /// Number of live triggers.
    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }

    /// Compare the current URL with the last one seen.
    ///
    /// Returns the new URL if it changed, updating the baseline.
    pub fn check(&mut self) -> Option<String> {
        let current = self.source.current_url();
        if current == self.last_url {
            return None;
        }

        debug!(from = %self.last_url, to = %current, "URL changed");
        self.last_url = current.clone();
        Some(current)
    }

    /// Run until cancelled or until every trigger is exhausted.
    pub async fn run<F, Fut>(mut self, cancel: CancellationToken, mut on_change: F)
    where
        F: FnMut(String) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        info!(triggers = self.triggers.len(), "Navigation watcher started");

        loop {
            if self.triggers.is_empty() {
                debug!("All navigation triggers exhausted");
                break;
            }

            let fired = {
                let waits = select_all(self.triggers.iter_mut().map(|t| t.wait()));
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    (signal, index, _pending) = waits => Some((signal, index)),
                }
            };

            let kind = match fired {
                None => break,
                Some((None, index)) => {
                    self.triggers.remove(index);
                    continue;
                }
                Some((Some(kind), _)) => kind,
            };

            if !self.debounce.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.debounce) => {}
                }
            }

            if let Some(url) = self.check() {
                info!(url = %url, trigger = ?kind, "Navigation detected");
                on_change(url).await;
            }
        }

        info!("Navigation watcher stopped");
    }
}
