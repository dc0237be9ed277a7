//! Activation engine - the main interface of the crate.
//!
//! Two locks guard the engine. The state lock protects the registry, the
//! lifecycle bookkeeping and the last URL; it is only held for bookkeeping,
//! never across a feature callback or an event handler. The gate serializes
//! the deactivate, match and initiate phase of each evaluation together with
//! the other operations that run `cleanup` (replace, unregister, shutdown).
//! `init` calls run after the gate is released, so a pending `init` never
//! holds up navigation, and callbacks and handlers may call back into the
//! engine.

use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ReregisterPolicy};
use crate::events::{EngineEvent, EventBus, EventRecord};
use crate::feature::{FeatureDescriptor, FeatureState, FeatureStatus};
use crate::lifecycle::{
    ActivationOutcome, DeactivationOutcome, LifecycleController, PendingActivation,
    PendingDeactivation,
};
use crate::navigation::{
    MutationTrigger, NavigationTrigger, NavigationWatcher, PollTrigger, UrlSource,
};
use crate::registry::FeatureRegistry;
use crate::resolver::{Exclusion, MatchCandidate, resolve};
use crate::{FeatureError, Result};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Engines whose gate the current task holds.
    static HELD_GATES: Vec<u64>;
}

/// A feature whose `init` failed during an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedActivation {
    /// Feature name
    pub feature: String,

    /// Error message
    pub error: String,
}

/// What one evaluation pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationReport {
    /// URL the pass evaluated
    pub url: String,

    /// Whether the URL differed from the previous pass
    pub navigated: bool,

    /// Features deactivated because of the navigation, including features
    /// whose `init` was still pending
    pub deactivated: Vec<String>,

    /// Features activated, in resolution order
    pub activated: Vec<String>,

    /// Features whose activation failed
    pub failed: Vec<FailedActivation>,

    /// Features this pass started that were deactivated before `init` settled
    pub cancelled: Vec<String>,

    /// Matching features silenced by exclusions
    pub excluded: Vec<Exclusion>,

    /// The pass did not run: it was requested from a `cleanup` callback, or
    /// after the watcher that requested it was stopped
    pub skipped: bool,
}

/// Running navigation watcher.
pub struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Ask the watcher to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the watcher task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the watcher and wait for it to exit.
    pub async fn join(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Navigation watcher task failed: {}", e);
        }
    }
}

struct EngineState {
    registry: FeatureRegistry,
    lifecycle: LifecycleController,
    /// URL of the previous evaluation
    last_url: Option<String>,
}

/// Feature activation engine.
///
/// The engine handles:
/// - Feature registration
/// - Matching the current URL and resolving exclusions
/// - Feature lifecycle (init, cleanup) with error isolation
/// - Navigation watching and event distribution
///
/// Evaluations queue on an internal gate for their deactivate and match
/// phase only. `init` calls are started in resolution order and awaited
/// concurrently once the gate is released; a feature whose `init` is still
/// pending is `Activating`, and a later evaluation treats it as in flight.
pub struct ActivationEngine {
    /// Key of this engine in the task-local gate set
    id: u64,

    /// Configuration
    config: EngineConfig,

    /// Current page location
    location: Arc<dyn UrlSource>,

    /// Event bus
    events: Arc<EventBus>,

    /// Registry, lifecycle and last URL
    state: Mutex<EngineState>,

    /// Serializes everything that runs `cleanup` or starts `init`
    gate: Mutex<()>,

    /// Navigation watcher, once started
    watch: parking_lot::Mutex<Option<WatchHandle>>,
}

impl ActivationEngine {
    /// Create a new engine.
    pub fn new(config: EngineConfig, location: Arc<dyn UrlSource>) -> Self {
        let events = Arc::new(EventBus::with_capacity(config.event_buffer));

        Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            config,
            location,
            events,
            state: Mutex::new(EngineState {
                registry: FeatureRegistry::new(),
                lifecycle: LifecycleController::new(),
                last_url: None,
            }),
            gate: Mutex::new(()),
            watch: parking_lot::Mutex::new(None),
        }
    }

    /// Create an engine with default configuration.
    pub fn with_defaults(location: Arc<dyn UrlSource>) -> Self {
        Self::new(EngineConfig::default(), location)
    }

    // ========== Registration ==========

    /// Register a feature.
    ///
    /// On a name collision the configured [`ReregisterPolicy`] decides:
    /// `Reject` returns [`FeatureError::AlreadyExists`], `Replace` behaves
    /// like [`replace`](Self::replace).
    pub async fn register(&self, descriptor: FeatureDescriptor) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.registry.contains(descriptor.name()) {
            match self.config.reregister {
                ReregisterPolicy::Reject => {
                    return Err(FeatureError::AlreadyExists(descriptor.name().to_string()));
                }
                ReregisterPolicy::Replace => {
                    drop(state);
                    self.replace(descriptor).await;
                    return Ok(());
                }
            }
        }

        let descriptor = state.registry.register(descriptor)?;
        drop(state);

        info!(feature = %descriptor.name(), "Registered feature");
        self.events
            .publish(EngineEvent::FeatureRegistered {
                feature: descriptor.name().to_string(),
                pattern: descriptor.pattern().as_str().to_string(),
            })
            .await;

        Ok(())
    }

    /// Register or overwrite a feature.
    ///
    /// If the old descriptor is active (or still activating) it is
    /// deactivated first, so its own `cleanup` runs. The new descriptor is
    /// picked up by the next evaluation.
    pub async fn replace(&self, descriptor: FeatureDescriptor) {
        let events = self.with_gate(self.replace_gated(descriptor)).await;
        self.publish_all(events).await;
    }

    async fn replace_gated(&self, descriptor: FeatureDescriptor) -> Vec<EngineEvent> {
        let name = descriptor.name().to_string();
        let mut events = Vec::new();

        let deactivation = self.state.lock().await.lifecycle.begin_deactivation(&name);
        if let Some(deactivation) = deactivation {
            info!(feature = %name, "Deactivating feature before replacement");
            self.run_deactivations(vec![deactivation], &mut events).await;
        }

        let (descriptor, previous) = self.state.lock().await.registry.replace(descriptor);
        let pattern = descriptor.pattern().as_str().to_string();

        events.push(if previous.is_some() {
            info!(feature = %name, "Replaced feature");
            EngineEvent::FeatureReplaced {
                feature: name,
                pattern,
            }
        } else {
            info!(feature = %name, "Registered feature");
            EngineEvent::FeatureRegistered {
                feature: name,
                pattern,
            }
        });
        events
    }

    /// Deactivate (if active) and remove a feature.
    pub async fn unregister(&self, name: &str) -> Result<()> {
        let events = self.with_gate(self.unregister_gated(name)).await?;
        self.publish_all(events).await;
        Ok(())
    }

    async fn unregister_gated(&self, name: &str) -> Result<Vec<EngineEvent>> {
        let deactivation = {
            let mut state = self.state.lock().await;
            if !state.registry.contains(name) {
                return Err(FeatureError::NotFound(name.to_string()));
            }
            state.lifecycle.begin_deactivation(name)
        };

        let mut events = Vec::new();
        if let Some(deactivation) = deactivation {
            self.run_deactivations(vec![deactivation], &mut events).await;
        }

        {
            let mut state = self.state.lock().await;
            state.registry.unregister(name);
            state.lifecycle.forget(name);
        }

        info!(feature = %name, "Unregistered feature");
        events.push(EngineEvent::FeatureUnregistered {
            feature: name.to_string(),
        });
        Ok(events)
    }

    // ========== Evaluation ==========

    /// Run one activation pass against the current URL.
    ///
    /// 1. If the URL changed since the previous pass, deactivate everything,
    ///    including features whose `init` is still pending.
    /// 2. Match every enabled feature that is not already in flight.
    /// 3. Resolve exclusions.
    /// 4. Start `init` for the winners in resolution order, then wait for
    ///    them to settle.
    ///
    /// Never fails: feature errors are recorded and published as events.
    /// Called from a `cleanup` callback, the pass is skipped and reported as
    /// such; the next trigger picks the URL up.
    pub async fn evaluate(&self) -> EvaluationReport {
        self.evaluate_until(None).await
    }

    /// [`evaluate`](Self::evaluate), skipped if `watch` is cancelled by the
    /// time the gate is acquired.
    async fn evaluate_until(&self, watch: Option<&CancellationToken>) -> EvaluationReport {
        if self.holds_gate() {
            debug!("Evaluation requested from a cleanup callback, skipping");
            return self.skipped_report();
        }

        let gate = self.gate.lock().await;
        if watch.is_some_and(CancellationToken::is_cancelled) {
            debug!("Navigation watcher stopped, skipping evaluation");
            return self.skipped_report();
        }

        let mut events = Vec::new();
        let (mut report, pending) = HELD_GATES
            .scope(self.held_gates(), self.prepare_evaluation(&mut events))
            .await;
        drop(gate);

        self.publish_all(events).await;

        let outcomes = join_all(pending.iter().map(|p| self.settle_activation(p))).await;
        for (pending, outcome) in pending.iter().zip(outcomes) {
            let name = pending.name().to_string();
            match outcome {
                ActivationOutcome::Activated => report.activated.push(name),
                ActivationOutcome::Failed(error) => report.failed.push(FailedActivation {
                    feature: name,
                    error,
                }),
                ActivationOutcome::Cancelled => report.cancelled.push(name),
            }
        }

        debug!(
            url = %report.url,
            activated = report.activated.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled.len(),
            "Evaluation completed"
        );
        self.events
            .publish(EngineEvent::EvaluationCompleted {
                url: report.url.clone(),
                activated: report.activated.clone(),
                failed: report.failed.iter().map(|f| f.feature.clone()).collect(),
            })
            .await;

        report
    }

    /// Deactivate on navigation, match and resolve, then mark the winners
    /// `Activating`. Runs under the gate.
    async fn prepare_evaluation(
        &self,
        events: &mut Vec<EngineEvent>,
    ) -> (EvaluationReport, Vec<PendingActivation>) {
        let url = self.location.current_url();
        let mut report = EvaluationReport {
            url: url.clone(),
            ..Default::default()
        };

        let deactivations = {
            let mut state = self.state.lock().await;
            if state.last_url.as_deref() == Some(url.as_str()) {
                Vec::new()
            } else {
                let from = state.last_url.replace(url.clone());
                debug!(from = ?from, to = %url, "Evaluating new URL");
                events.push(EngineEvent::NavigationDetected {
                    from,
                    to: url.clone(),
                });
                report.navigated = true;
                state.lifecycle.begin_deactivate_all()
            }
        };
        report.deactivated = self.run_deactivations(deactivations, events).await;

        let mut state = self.state.lock().await;
        let EngineState {
            registry, lifecycle, ..
        } = &mut *state;

        let candidates: Vec<MatchCandidate> = registry
            .iter()
            .filter(|d| self.config.is_feature_enabled(d.name()))
            .filter(|d| !lifecycle.state(d.name()).is_engaged())
            .filter_map(|d| MatchCandidate::evaluate(d, &url))
            .collect();

        let resolution = resolve(candidates);

        events.extend(resolution.excluded.iter().map(|exclusion| {
            EngineEvent::FeatureExcluded {
                feature: exclusion.feature.clone(),
                excluded_by: exclusion.excluded_by.clone(),
            }
        }));
        report.excluded = resolution.excluded;

        let mut pending = Vec::with_capacity(resolution.selected.len());
        for candidate in resolution.selected {
            if let Some(activation) =
                lifecycle.begin_activation(&candidate.descriptor, &url, candidate.captures)
            {
                events.push(EngineEvent::FeatureActivating {
                    feature: activation.name().to_string(),
                    url: url.clone(),
                });
                pending.push(activation);
            }
        }

        (report, pending)
    }

    /// Await one `init` and record how it settled.
    async fn settle_activation(&self, pending: &PendingActivation) -> ActivationOutcome {
        let outcome = pending.run().await;
        let result = self
            .state
            .lock()
            .await
            .lifecycle
            .finish_activation(pending, outcome);

        let feature = pending.name().to_string();
        let url = pending.url().to_string();
        match &result {
            ActivationOutcome::Activated => {
                self.events
                    .publish(EngineEvent::FeatureActivated { feature, url })
                    .await;
            }
            ActivationOutcome::Failed(error) => {
                self.events
                    .publish(EngineEvent::FeatureActivationFailed {
                        feature,
                        url,
                        error: error.clone(),
                    })
                    .await;
            }
            ActivationOutcome::Cancelled => {}
        }

        result
    }

    /// Run `cleanup` for each pending deactivation, in order, with the state
    /// lock released while each callback runs.
    async fn run_deactivations(
        &self,
        pending: Vec<PendingDeactivation>,
        events: &mut Vec<EngineEvent>,
    ) -> Vec<String> {
        let mut names = Vec::with_capacity(pending.len());

        for deactivation in pending {
            let outcome = deactivation.run().await;
            let result = self
                .state
                .lock()
                .await
                .lifecycle
                .finish_deactivation(&deactivation, outcome);

            let feature = deactivation.name().to_string();
            if let DeactivationOutcome::CleanupFailed(error) = result {
                events.push(EngineEvent::FeatureCleanupFailed {
                    feature: feature.clone(),
                    error,
                });
            }
            events.push(EngineEvent::FeatureDeactivated {
                feature: feature.clone(),
            });
            names.push(feature);
        }

        names
    }

    fn skipped_report(&self) -> EvaluationReport {
        EvaluationReport {
            url: self.location.current_url(),
            skipped: true,
            ..Default::default()
        }
    }

    // ========== Gate ==========

    /// Whether the current task holds this engine's gate.
    fn holds_gate(&self) -> bool {
        HELD_GATES
            .try_with(|ids| ids.contains(&self.id))
            .unwrap_or(false)
    }

    fn held_gates(&self) -> Vec<u64> {
        let mut ids = HELD_GATES.try_with(|ids| ids.clone()).unwrap_or_default();
        ids.push(self.id);
        ids
    }

    /// Run `fut` holding the gate. A task that already holds it runs `fut`
    /// inline.
    async fn with_gate<T>(&self, fut: impl Future<Output = T>) -> T {
        if self.holds_gate() {
            return fut.await;
        }

        let _gate = self.gate.lock().await;
        HELD_GATES.scope(self.held_gates(), fut).await
    }

    async fn publish_all(&self, events: Vec<EngineEvent>) {
        for event in events {
            self.events.publish(event).await;
        }
    }

    // ========== Watching ==========

    /// Evaluate once, then watch for navigation.
    ///
    /// Uses `mutations` (if given) plus a poll trigger when polling is
    /// enabled in the configuration.
    pub async fn start(self: &Arc<Self>, mutations: Option<MutationTrigger>) -> EvaluationReport {
        let mut triggers: Vec<Box<dyn NavigationTrigger>> = Vec::new();

        if let Some(mutations) = mutations {
            triggers.push(Box::new(mutations));
        }
        if let Some(period) = self.config.poll_interval() {
            triggers.push(Box::new(PollTrigger::new(period)));
        }

        self.start_with_triggers(triggers).await
    }

    /// Watch for navigation using the given triggers, then evaluate once.
    ///
    /// The watcher is running before the initial evaluation starts, so a
    /// pending `init` does not delay navigation handling. Each detected
    /// navigation is evaluated on its own task. A watcher that is already
    /// running is stopped first.
    pub async fn start_with_triggers(
        self: &Arc<Self>,
        triggers: Vec<Box<dyn NavigationTrigger>>,
    ) -> EvaluationReport {
        if self.stop_watcher().await {
            warn!("Navigation watcher already running, restarting");
        }

        let watcher = triggers.into_iter().fold(
            NavigationWatcher::new(Arc::clone(&self.location)).with_debounce(self.config.debounce()),
            NavigationWatcher::with_trigger,
        );

        let cancel = CancellationToken::new();
        let engine: Weak<Self> = Arc::downgrade(self);
        let token = cancel.clone();
        let task = tokio::spawn(watcher.run(cancel.clone(), move |_url| {
            if let Some(engine) = engine.upgrade() {
                let token = token.clone();
                tokio::spawn(async move {
                    engine.evaluate_until(Some(&token)).await;
                });
            }
            std::future::ready(())
        }));

        *self.watch.lock() = Some(WatchHandle { cancel, task });

        self.evaluate().await
    }

    /// Whether a navigation watcher is running.
    pub fn is_watching(&self) -> bool {
        self.watch
            .lock()
            .as_ref()
            .is_some_and(WatchHandle::is_running)
    }

    /// Stop the watcher. Returns whether one was running.
    async fn stop_watcher(&self) -> bool {
        let handle = self.watch.lock().take();
        match handle {
            Some(handle) => {
                handle.join().await;
                true
            }
            None => false,
        }
    }

    /// Stop watching and deactivate every active feature.
    ///
    /// Features whose `init` is still pending are deactivated too. A later
    /// [`evaluate`](Self::evaluate) starts from scratch.
    pub async fn shutdown(&self) -> Vec<String> {
        self.stop_watcher().await;

        let (deactivated, events) = self
            .with_gate(async {
                let pending = {
                    let mut state = self.state.lock().await;
                    state.last_url = None;
                    state.lifecycle.begin_deactivate_all()
                };
                let mut events = Vec::new();
                let names = self.run_deactivations(pending, &mut events).await;
                (names, events)
            })
            .await;
        self.publish_all(events).await;

        info!(deactivated = deactivated.len(), "Activation engine shut down");
        deactivated
    }

    // ========== Inspection ==========

    /// Lifecycle state of a feature.
    pub async fn state(&self, name: &str) -> FeatureState {
        self.state.lock().await.lifecycle.state(name)
    }

    /// Active features in activation order.
    pub async fn active_features(&self) -> Vec<String> {
        self.state.lock().await.lifecycle.active_names()
    }

    /// Status of one feature.
    pub async fn status(&self, name: &str) -> Option<FeatureStatus> {
        let state = self.state.lock().await;
        state
            .registry
            .get(name)
            .map(|descriptor| state.lifecycle.status(descriptor))
    }

    /// Status of every feature, in registration order.
    pub async fn statuses(&self) -> Vec<FeatureStatus> {
        let state = self.state.lock().await;
        state
            .registry
            .iter()
            .map(|descriptor| state.lifecycle.status(descriptor))
            .collect()
    }

    /// Check if a feature is registered.
    pub async fn is_registered(&self, name: &str) -> bool {
        self.state.lock().await.registry.contains(name)
    }

    /// Registered feature names, in registration order.
    pub async fn feature_names(&self) -> Vec<String> {
        self.state.lock().await.registry.names()
    }

    /// URL of the previous evaluation.
    pub async fn last_url(&self) -> Option<String> {
        self.state.lock().await.last_url.clone()
    }

    // ========== Events ==========

    /// Get the event bus.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.events.receiver()
    }

    // ========== Configuration ==========

    /// Get configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for ActivationEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.watch.get_mut().take() {
            handle.stop();
        }
    }
}
