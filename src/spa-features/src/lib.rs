//! # SPA Feature Activation
//!
//! Activates URL-bound features inside a single-page application and keeps
//! them in sync with client-side navigation.
//!
//! ## Features
//!
//! - **URL Patterns**: Each feature declares a regular expression; capture
//!   groups are handed to its `init`
//! - **Specificity**: When several features match, the most specific pattern
//!   wins and may exclude the others
//! - **Lifecycle**: `init` on match, `cleanup` on navigation away, each
//!   feature isolated from the errors and panics of the others
//! - **Navigation Watching**: DOM mutation signals plus a fallback poll
//! - **Event Bus**: Subscribe to registrations, activations and failures
//!
//! ## Example
//!
//! ```rust,ignore
//! use spa_features::{ActivationEngine, FeatureDescriptor, StaticUrl};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let location = Arc::new(StaticUrl::new("https://example.com/cards/42"));
//!     let engine = Arc::new(ActivationEngine::with_defaults(location.clone()));
//!
//!     engine
//!         .register(
//!             FeatureDescriptor::builder("cards", r"/cards/(\d+)")
//!                 .on_init_sync(|ctx| {
//!                     println!("card {}", ctx.captures.get(1).unwrap_or_default());
//!                     Ok(())
//!                 })
//!                 .build()?,
//!         )
//!         .await?;
//!
//!     engine.start(None).await;
//!     location.set("https://example.com/boards/7");
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod feature;
pub mod lifecycle;
pub mod navigation;
pub mod pattern;
pub mod registry;
pub mod resolver;

// Re-exports for convenience
pub use config::{EngineConfig, ReregisterPolicy};
pub use engine::{ActivationEngine, EvaluationReport, FailedActivation, WatchHandle};
pub use error::{FeatureError, Result};
pub use events::{EngineEvent, EventBus, EventHandler, EventRecord, EventSubscription, EventType};
pub use feature::{
    ActivationContext, CleanupFn, Feature, FeatureBuilder, FeatureDescriptor, FeatureState,
    FeatureStats, FeatureStatus, InitFn,
};
pub use lifecycle::{
    ActivationOutcome, CallOutcome, DeactivationOutcome, LifecycleController, PendingActivation,
    PendingDeactivation, call_guarded,
};
pub use navigation::{
    MutationNotifier, MutationTrigger, NavigationTrigger, NavigationWatcher, PollTrigger,
    StaticUrl, TriggerKind, UrlSource, mutation_channel,
};
pub use pattern::{MatchResult, UrlPattern, specificity};
pub use registry::FeatureRegistry;
pub use resolver::{Exclusion, MatchCandidate, Resolution, resolve};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
