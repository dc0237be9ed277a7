//! Feature lifecycle controller.
//!
//! Drives each feature through
//! `Inactive -> Activating -> Active -> Deactivating -> Inactive`, with
//! `Activating -> Failed` when `init` fails and `Activating -> Deactivating`
//! when the feature is torn down before `init` finishes.
//!
//! The controller only does bookkeeping. Each transition is split into a
//! `begin_*` step that hands out a pending callback and a `finish_*` step that
//! records its outcome, so the caller can run callbacks without holding the
//! lock that guards the controller. Every callback runs behind
//! [`call_guarded`], so a failing or panicking feature only affects itself.

use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::FeatureError;
use crate::feature::{ActivationContext, FeatureDescriptor, FeatureState, FeatureStats, FeatureStatus};
use crate::pattern::MatchResult;

/// Result of a guarded callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// The callback returned `Ok`
    Completed,
    /// The callback returned an error or panicked
    Failed(String),
}

impl CallOutcome {
    /// Whether the callback completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Run a feature callback, converting errors and panics into a [`CallOutcome`].
pub async fn call_guarded<F>(callback: F) -> CallOutcome
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(Ok(())) => CallOutcome::Completed,
        Ok(Err(err)) => CallOutcome::Failed(format!("{err:#}")),
        Err(payload) => CallOutcome::Failed(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

/// Result of an activation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// `init` completed and the feature is now active
    Activated,
    /// `init` failed; the feature is marked failed
    Failed(String),
    /// The feature was deactivated before `init` settled
    Cancelled,
}

/// Result of a deactivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeactivationOutcome {
    /// `cleanup` completed
    Deactivated,
    /// `cleanup` failed; the feature is inactive regardless
    CleanupFailed(String),
}

/// An `init` call handed out by [`LifecycleController::begin_activation`].
#[derive(Clone)]
pub struct PendingActivation {
    descriptor: Arc<FeatureDescriptor>,
    context: ActivationContext,
    generation: u64,
}

impl PendingActivation {
    /// Feature name.
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    /// URL the feature is being activated for.
    pub fn url(&self) -> &str {
        &self.context.url
    }

    /// Run `init`.
    ///
    /// Returns `None` without waiting for `init` if the feature is
    /// deactivated first. The `init` future is dropped in that case.
    pub async fn run(&self) -> Option<CallOutcome> {
        let token = self.context.token();
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            outcome = call_guarded(self.descriptor.feature().init(self.context.clone())) => Some(outcome),
        }
    }
}

impl std::fmt::Debug for PendingActivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingActivation")
            .field("feature", &self.name())
            .field("url", &self.url())
            .field("generation", &self.generation)
            .finish()
    }
}

/// A `cleanup` call handed out by [`LifecycleController::begin_deactivation`].
#[derive(Clone)]
pub struct PendingDeactivation {
    name: String,
    descriptor: Option<Arc<FeatureDescriptor>>,
    was: FeatureState,
}

impl PendingDeactivation {
    /// Feature name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// State the feature was in when deactivation began.
    pub fn was(&self) -> FeatureState {
        self.was
    }

    /// Run `cleanup`.
    pub async fn run(&self) -> CallOutcome {
        match &self.descriptor {
            Some(descriptor) => call_guarded(descriptor.feature().cleanup()).await,
            None => CallOutcome::Completed,
        }
    }
}

impl std::fmt::Debug for PendingDeactivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingDeactivation")
            .field("feature", &self.name)
            .field("was", &self.was)
            .finish()
    }
}

#[derive(Debug, Default)]
struct FeatureSlot {
    state: FeatureState,
    /// Generation of the current activation
    generation: u64,
    token: Option<CancellationToken>,
    /// Descriptor the current generation was started from
    descriptor: Option<Arc<FeatureDescriptor>>,
    last_error: Option<String>,
    last_activated: Option<chrono::DateTime<Utc>>,
    stats: FeatureStats,
}

/// Per-feature state machine and the set of engaged features.
#[derive(Debug, Default)]
pub struct LifecycleController {
    slots: HashMap<String, FeatureSlot>,
    /// Activating and active features, in the order activation began
    order: Vec<String>,
    /// Last generation handed out, shared by all features
    generation: u64,
}

impl LifecycleController {
    /// Create a controller with no active features.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a feature.
    pub fn state(&self, name: &str) -> FeatureState {
        self.slots.get(name).map(|s| s.state).unwrap_or_default()
    }

    /// Whether a feature is active.
    pub fn is_active(&self, name: &str) -> bool {
        self.state(name).is_active()
    }

    /// Active features in activation order.
    pub fn active_names(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| self.is_active(name))
            .cloned()
            .collect()
    }

    /// Counters for a feature.
    pub fn stats(&self, name: &str) -> FeatureStats {
        self.slots
            .get(name)
            .map(|s| s.stats.clone())
            .unwrap_or_default()
    }

    /// Most recent error recorded for a feature.
    pub fn last_error(&self, name: &str) -> Option<&str> {
        self.slots.get(name).and_then(|s| s.last_error.as_deref())
    }

    /// Status snapshot of a registered feature.
    pub fn status(&self, descriptor: &FeatureDescriptor) -> FeatureStatus {
        let slot = self.slots.get(descriptor.name());

        FeatureStatus {
            name: descriptor.name().to_string(),
            pattern: descriptor.pattern().as_str().to_string(),
            excludes: descriptor.excludes().to_vec(),
            state: slot.map(|s| s.state).unwrap_or_default(),
            last_error: slot.and_then(|s| s.last_error.clone()),
            last_activated: slot.and_then(|s| s.last_activated),
            stats: slot.map(|s| s.stats.clone()).unwrap_or_default(),
        }
    }

    /// Mark a feature `Activating` and hand out its `init` call.
    ///
    /// Returns `None` if a generation of the feature is already in flight.
    pub fn begin_activation(
        &mut self,
        descriptor: &Arc<FeatureDescriptor>,
        url: &str,
        captures: MatchResult,
    ) -> Option<PendingActivation> {
        let name = descriptor.name().to_string();

        let slot = self.slots.entry(name.clone()).or_default();
        if slot.state.is_engaged() {
            debug!(feature = %name, state = %slot.state, "Feature already engaged, skipping init");
            return None;
        }
        self.generation += 1;
        let generation = self.generation;

        let token = CancellationToken::new();
        slot.state = FeatureState::Activating;
        slot.generation = generation;
        slot.token = Some(token.clone());
        slot.descriptor = Some(Arc::clone(descriptor));
        self.order.push(name.clone());

        debug!(feature = %name, url = %url, generation, "Feature activating");
        Some(PendingActivation {
            descriptor: Arc::clone(descriptor),
            context: ActivationContext::new(name, url, captures, token),
            generation,
        })
    }

    /// Record how an `init` call settled.
    ///
    /// The result is dropped, and [`ActivationOutcome::Cancelled`] returned,
    /// if the feature left this generation's `Activating` state meanwhile.
    pub fn finish_activation(
        &mut self,
        pending: &PendingActivation,
        outcome: Option<CallOutcome>,
    ) -> ActivationOutcome {
        let name = pending.name();
        let current = self.slots.get_mut(name).filter(|slot| {
            slot.generation == pending.generation && slot.state == FeatureState::Activating
        });
        let (Some(slot), Some(outcome)) = (current, outcome) else {
            debug!(feature = %name, generation = pending.generation, "Stale activation dropped");
            return ActivationOutcome::Cancelled;
        };

        match outcome {
            CallOutcome::Completed => {
                slot.state = FeatureState::Active;
                slot.last_activated = Some(Utc::now());
                slot.stats.activations += 1;

                info!(feature = %name, url = %pending.url(), "Feature activated");
                ActivationOutcome::Activated
            }
            CallOutcome::Failed(error) => {
                if let Some(token) = slot.token.take() {
                    token.cancel();
                }
                slot.state = FeatureState::Failed;
                slot.descriptor = None;
                slot.last_error = Some(error.clone());
                slot.stats.activation_failures += 1;
                self.order.retain(|n| n != name);

                warn!(url = %pending.url(), "{}", FeatureError::activation_failed(name, &error));
                ActivationOutcome::Failed(error)
            }
        }
    }

    /// Mark an activating or active feature `Deactivating` and hand out its
    /// `cleanup` call.
    ///
    /// The activation token is cancelled here, before `cleanup` runs, so a
    /// pending `init` of the same generation stops being polled.
    pub fn begin_deactivation(&mut self, name: &str) -> Option<PendingDeactivation> {
        let slot = self.slots.get_mut(name)?;
        let was = slot.state;
        if !matches!(was, FeatureState::Activating | FeatureState::Active) {
            return None;
        }

        slot.state = FeatureState::Deactivating;
        if let Some(token) = slot.token.take() {
            token.cancel();
        }
        let descriptor = slot.descriptor.take();
        self.order.retain(|n| n != name);

        Some(PendingDeactivation {
            name: name.to_string(),
            descriptor,
            was,
        })
    }

    /// Begin deactivating every engaged feature, in activation order.
    ///
    /// Features left `Failed` by the previous pass are reset to `Inactive`.
    pub fn begin_deactivate_all(&mut self) -> Vec<PendingDeactivation> {
        let names = self.order.clone();
        let pending = names
            .iter()
            .filter_map(|name| self.begin_deactivation(name))
            .collect();

        for slot in self.slots.values_mut() {
            if slot.state == FeatureState::Failed {
                slot.state = FeatureState::Inactive;
            }
        }

        pending
    }

    /// Record how a `cleanup` call settled. The feature ends up inactive
    /// even if `cleanup` failed.
    pub fn finish_deactivation(
        &mut self,
        pending: &PendingDeactivation,
        outcome: CallOutcome,
    ) -> DeactivationOutcome {
        let name = pending.name();
        let failed = match &outcome {
            CallOutcome::Completed => None,
            CallOutcome::Failed(error) => Some(error.clone()),
        };

        if let Some(slot) = self.slots.get_mut(name) {
            slot.state = FeatureState::Inactive;
            slot.stats.deactivations += 1;
            if let Some(error) = &failed {
                slot.stats.cleanup_failures += 1;
                slot.last_error = Some(error.clone());
            }
        }

        match failed {
            None => {
                if pending.was() == FeatureState::Activating {
                    info!(feature = %name, "Feature deactivated before init settled");
                } else {
                    info!(feature = %name, "Feature deactivated");
                }
                DeactivationOutcome::Deactivated
            }
            Some(error) => {
                warn!("{}", FeatureError::cleanup_failed(name, &error));
                DeactivationOutcome::CleanupFailed(error)
            }
        }
    }

    /// Drop all bookkeeping for a feature that is no longer registered.
    pub fn forget(&mut self, name: &str) {
        self.slots.remove(name);
        self.order.retain(|n| n != name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(name: &str, inits: Arc<AtomicUsize>, cleanups: Arc<AtomicUsize>) -> Arc<FeatureDescriptor> {
        Arc::new(
            FeatureDescriptor::builder(name, "/")
                .on_init_sync(move |_| {
                    inits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .on_cleanup_sync(move || {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .build()
                .unwrap(),
        )
    }

    async fn activate(lifecycle: &mut LifecycleController, feature: &Arc<FeatureDescriptor>) -> ActivationOutcome {
        let pending = lifecycle
            .begin_activation(feature, "/", MatchResult::default())
            .unwrap();
        let outcome = pending.run().await;
        lifecycle.finish_activation(&pending, outcome)
    }

    async fn deactivate(lifecycle: &mut LifecycleController, name: &str) -> Option<DeactivationOutcome> {
        let pending = lifecycle.begin_deactivation(name)?;
        let outcome = pending.run().await;
        Some(lifecycle.finish_deactivation(&pending, outcome))
    }

    #[tokio::test]
    async fn test_call_guarded_ok() {
        assert_eq!(
            call_guarded(async { Ok::<(), anyhow::Error>(()) }).await,
            CallOutcome::Completed
        );
    }

    #[tokio::test]
    async fn test_call_guarded_error() {
        let outcome = call_guarded(async { Err::<(), _>(anyhow::anyhow!("boom")) }).await;
        assert_eq!(outcome, CallOutcome::Failed("boom".to_string()));
    }

    #[tokio::test]
    async fn test_call_guarded_panic() {
        let outcome = call_guarded(async {
            if true {
                panic!("kaboom");
            }
            Ok::<(), anyhow::Error>(())
        })
        .await;
        match outcome {
            CallOutcome::Failed(msg) => assert!(msg.contains("kaboom")),
            CallOutcome::Completed => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_activate_is_idempotent() {
        let inits = Arc::new(AtomicUsize::new(0));
        let cleanups = Arc::new(AtomicUsize::new(0));
        let feature = counting("cards", inits.clone(), cleanups.clone());
        let mut lifecycle = LifecycleController::new();

        assert_eq!(activate(&mut lifecycle, &feature).await, ActivationOutcome::Activated);
        assert!(
            lifecycle
                .begin_activation(&feature, "/", MatchResult::default())
                .is_none()
        );

        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.active_names(), vec!["cards".to_string()]);
    }

    #[tokio::test]
    async fn test_activating_counts_as_in_flight() {
        let feature = counting("cards", Arc::default(), Arc::default());
        let mut lifecycle = LifecycleController::new();

        let pending = lifecycle
            .begin_activation(&feature, "/", MatchResult::default())
            .unwrap();

        assert_eq!(lifecycle.state("cards"), FeatureState::Activating);
        assert!(
            lifecycle
                .begin_activation(&feature, "/", MatchResult::default())
                .is_none()
        );
        // Not reported as active until init settles.
        assert!(lifecycle.active_names().is_empty());

        let outcome = pending.run().await;
        assert_eq!(
            lifecycle.finish_activation(&pending, outcome),
            ActivationOutcome::Activated
        );
        assert_eq!(lifecycle.active_names(), vec!["cards".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_init_is_not_active() {
        let feature = Arc::new(
            FeatureDescriptor::builder("broken", "/")
                .on_init_sync(|_| anyhow::bail!("no container"))
                .build()
                .unwrap(),
        );
        let mut lifecycle = LifecycleController::new();

        let outcome = activate(&mut lifecycle, &feature).await;

        assert_eq!(outcome, ActivationOutcome::Failed("no container".to_string()));
        assert_eq!(lifecycle.state("broken"), FeatureState::Failed);
        assert!(lifecycle.active_names().is_empty());
        assert_eq!(lifecycle.last_error("broken"), Some("no container"));
        assert_eq!(lifecycle.stats("broken").activation_failures, 1);
        assert!(lifecycle.begin_deactivation("broken").is_none());
    }

    #[tokio::test]
    async fn test_deactivate_runs_cleanup_once() {
        let inits = Arc::new(AtomicUsize::new(0));
        let cleanups = Arc::new(AtomicUsize::new(0));
        let feature = counting("cards", inits, cleanups.clone());
        let mut lifecycle = LifecycleController::new();

        activate(&mut lifecycle, &feature).await;
        assert_eq!(
            deactivate(&mut lifecycle, "cards").await,
            Some(DeactivationOutcome::Deactivated)
        );
        assert_eq!(deactivate(&mut lifecycle, "cards").await, None);

        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state("cards"), FeatureState::Inactive);
        assert_eq!(lifecycle.stats("cards").deactivations, 1);
    }

    #[tokio::test]
    async fn test_cleanup_failure_still_deactivates() {
        let feature = Arc::new(
            FeatureDescriptor::builder("sticky", "/")
                .on_init_sync(|_| Ok(()))
                .on_cleanup_sync(|| panic!("cleanup exploded"))
                .build()
                .unwrap(),
        );
        let mut lifecycle = LifecycleController::new();

        activate(&mut lifecycle, &feature).await;
        let outcome = deactivate(&mut lifecycle, "sticky").await.unwrap();

        assert!(matches!(outcome, DeactivationOutcome::CleanupFailed(ref m) if m.contains("cleanup exploded")));
        assert_eq!(lifecycle.state("sticky"), FeatureState::Inactive);
        assert_eq!(lifecycle.stats("sticky").cleanup_failures, 1);

        // Can be activated again.
        assert_eq!(activate(&mut lifecycle, &feature).await, ActivationOutcome::Activated);
    }

    #[tokio::test]
    async fn test_deactivation_cancels_token() {
        let captured = Arc::new(parking_lot::Mutex::new(None));
        let slot = captured.clone();
        let feature = Arc::new(
            FeatureDescriptor::builder("late", "/")
                .on_init_sync(move |ctx| {
                    *slot.lock() = Some(ctx.clone());
                    Ok(())
                })
                .build()
                .unwrap(),
        );
        let mut lifecycle = LifecycleController::new();

        activate(&mut lifecycle, &feature).await;
        let ctx = captured.lock().clone().unwrap();
        assert!(ctx.is_current());

        let pending = lifecycle.begin_deactivation("late").unwrap();
        assert!(!ctx.is_current());
        assert_eq!(lifecycle.state("late"), FeatureState::Deactivating);

        let outcome = pending.run().await;
        lifecycle.finish_deactivation(&pending, outcome);
        assert_eq!(lifecycle.state("late"), FeatureState::Inactive);
    }

    #[tokio::test]
    async fn test_pending_init_dropped_on_deactivation() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = cleanups.clone();
        let feature = Arc::new(
            FeatureDescriptor::builder("slow", "/")
                .on_init(|_| std::future::pending::<anyhow::Result<()>>())
                .on_cleanup_sync(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .build()
                .unwrap(),
        );
        let mut lifecycle = LifecycleController::new();

        let activation = lifecycle
            .begin_activation(&feature, "/", MatchResult::default())
            .unwrap();
        let deactivation = lifecycle.begin_deactivation("slow").unwrap();
        assert_eq!(deactivation.was(), FeatureState::Activating);

        // The token is already cancelled, so the pending init is not polled.
        assert_eq!(activation.run().await, None);

        let outcome = deactivation.run().await;
        assert_eq!(
            lifecycle.finish_deactivation(&deactivation, outcome),
            DeactivationOutcome::Deactivated
        );
        assert_eq!(
            lifecycle.finish_activation(&activation, Some(CallOutcome::Completed)),
            ActivationOutcome::Cancelled
        );

        assert_eq!(lifecycle.state("slow"), FeatureState::Inactive);
        assert_eq!(lifecycle.stats("slow").activations, 0);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_generation_is_dropped() {
        let feature = counting("cards", Arc::default(), Arc::default());
        let mut lifecycle = LifecycleController::new();

        let first = lifecycle
            .begin_activation(&feature, "/a", MatchResult::default())
            .unwrap();
        let teardown = lifecycle.begin_deactivation("cards").unwrap();
        lifecycle.finish_deactivation(&teardown, CallOutcome::Completed);

        let second = lifecycle
            .begin_activation(&feature, "/b", MatchResult::default())
            .unwrap();

        // The first generation settles late, while the second is in flight.
        assert_eq!(
            lifecycle.finish_activation(&first, Some(CallOutcome::Completed)),
            ActivationOutcome::Cancelled
        );
        assert_eq!(lifecycle.state("cards"), FeatureState::Activating);

        assert_eq!(
            lifecycle.finish_activation(&second, Some(CallOutcome::Completed)),
            ActivationOutcome::Activated
        );
        assert_eq!(lifecycle.stats("cards").activations, 1);
    }

    #[tokio::test]
    async fn test_deactivate_all_resets_failed() {
        let ok = counting("ok", Arc::default(), Arc::default());
        let broken = Arc::new(
            FeatureDescriptor::builder("broken", "/")
                .on_init_sync(|_| anyhow::bail!("nope"))
                .build()
                .unwrap(),
        );
        let mut lifecycle = LifecycleController::new();

        activate(&mut lifecycle, &ok).await;
        activate(&mut lifecycle, &broken).await;

        let pending = lifecycle.begin_deactivate_all();
        let names: Vec<&str> = pending.iter().map(PendingDeactivation::name).collect();
        assert_eq!(names, vec!["ok"]);
        assert_eq!(lifecycle.state("broken"), FeatureState::Inactive);

        for deactivation in &pending {
            let outcome = deactivation.run().await;
            lifecycle.finish_deactivation(deactivation, outcome);
        }
        assert_eq!(lifecycle.state("ok"), FeatureState::Inactive);
    }
}
