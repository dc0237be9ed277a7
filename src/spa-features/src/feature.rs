//! Core feature types and traits.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::pattern::{MatchResult, UrlPattern};
use crate::{FeatureError, Result};

/// Everything a feature receives when it is activated.
#[derive(Debug, Clone)]
pub struct ActivationContext {
    /// Name of the feature being activated
    pub feature: String,

    /// URL the feature was matched against
    pub url: String,

    /// Captured groups of the pattern match
    pub captures: MatchResult,

    token: CancellationToken,
}

impl ActivationContext {
    /// Create a new activation context.
    pub fn new(
        feature: impl Into<String>,
        url: impl Into<String>,
        captures: MatchResult,
        token: CancellationToken,
    ) -> Self {
        Self {
            feature: feature.into(),
            url: url.into(),
            captures,
            token,
        }
    }

    /// Whether this activation is still current.
    ///
    /// Work that completes after `init` returned must check this before
    /// touching shared state: the feature may have been deactivated since.
    pub fn is_current(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Resolves once the feature is deactivated.
    pub async fn deactivated(&self) {
        self.token.cancelled().await
    }

    /// Token cancelled on deactivation, for handing to spawned tasks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Trait for feature implementations.
///
/// `init` and `cleanup` are called by the engine only, never while it holds
/// a lock, so both may call back into the engine. Errors and panics from
/// either are contained and never reach the engine caller.
///
/// A pending `init` is dropped if the feature is deactivated first; `cleanup`
/// still runs and must tolerate the incomplete setup.
#[async_trait]
pub trait Feature: Send + Sync {
    /// Activate the feature.
    async fn init(&self, ctx: ActivationContext) -> anyhow::Result<()>;

    /// Deactivate the feature. Must tolerate an incomplete `init`.
    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Boxed `init` callback.
pub type InitFn =
    Arc<dyn Fn(ActivationContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Boxed `cleanup` callback.
pub type CleanupFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Feature built from closures.
struct FnFeature {
    init: InitFn,
    cleanup: Option<CleanupFn>,
}

#[async_trait]
impl Feature for FnFeature {
    async fn init(&self, ctx: ActivationContext) -> anyhow::Result<()> {
        (self.init)(ctx).await
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        match &self.cleanup {
            Some(cleanup) => cleanup().await,
            None => Ok(()),
        }
    }
}

/// Immutable registration record of a feature.
#[derive(Clone)]
pub struct FeatureDescriptor {
    name: String,
    pattern: UrlPattern,
    excludes: Vec<String>,
    feature: Arc<dyn Feature>,
}

impl FeatureDescriptor {
    /// Create a descriptor, compiling the pattern.
    pub fn new(name: impl Into<String>, pattern: &str, feature: Arc<dyn Feature>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        let pattern = UrlPattern::compile(&name, pattern)?;

        Ok(Self {
            name,
            pattern,
            excludes: Vec::new(),
            feature,
        })
    }

    /// Start building a closure-based feature.
    pub fn builder(name: impl Into<String>, pattern: impl Into<String>) -> FeatureBuilder {
        FeatureBuilder::new(name, pattern)
    }

    /// Set the features this one silences when it wins.
    ///
    /// Duplicates and self references are dropped.
    pub fn with_excludes<I, S>(mut self, excludes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for name in excludes.into_iter().map(Into::into) {
            if name == self.name {
                tracing::debug!(feature = %self.name, "Ignoring self-exclusion");
                continue;
            }
            if !normalized.contains(&name) {
                normalized.push(name);
            }
        }
        self.excludes = normalized;
        self
    }

    /// Feature name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compiled URL pattern.
    pub fn pattern(&self) -> &UrlPattern {
        &self.pattern
    }

    /// Names of excluded features.
    pub fn excludes(&self) -> &[String] {
        &self.excludes
    }

    /// Whether this feature excludes `name`.
    pub fn excludes_feature(&self, name: &str) -> bool {
        self.excludes.iter().any(|n| n == name)
    }

    /// The feature implementation.
    pub fn feature(&self) -> &Arc<dyn Feature> {
        &self.feature
    }
}

impl fmt::Debug for FeatureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureDescriptor")
            .field("name", &self.name)
            .field("pattern", &self.pattern.as_str())
            .field("excludes", &self.excludes)
            .finish_non_exhaustive()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(FeatureError::invalid_descriptor(name, "name must not be empty"));
    }
    if name.trim() != name {
        return Err(FeatureError::invalid_descriptor(
            name,
            "name must not have surrounding whitespace",
        ));
    }
    Ok(())
}

/// Builder for closure-based features.
pub struct FeatureBuilder {
    name: String,
    pattern: String,
    excludes: Vec<String>,
    init: Option<InitFn>,
    cleanup: Option<CleanupFn>,
}

impl FeatureBuilder {
    fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            excludes: Vec::new(),
            init: None,
            cleanup: None,
        }
    }

    /// Features silenced when this one wins.
    pub fn excludes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes.extend(names.into_iter().map(Into::into));
        self
    }

    /// Asynchronous `init` callback.
    pub fn on_init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ActivationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.init = Some(Arc::new(move |ctx| f(ctx).boxed()));
        self
    }

    /// Synchronous `init` callback.
    pub fn on_init_sync<F>(mut self, f: F) -> Self
    where
        F: Fn(&ActivationContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.init = Some(Arc::new(move |ctx| {
            let f = Arc::clone(&f);
            async move { f(&ctx) }.boxed()
        }));
        self
    }

    /// Asynchronous `cleanup` callback.
    pub fn on_cleanup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.cleanup = Some(Arc::new(move || f().boxed()));
        self
    }

    /// Synchronous `cleanup` callback.
    pub fn on_cleanup_sync<F>(mut self, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.cleanup = Some(Arc::new(move || {
            let f = Arc::clone(&f);
            async move { f() }.boxed()
        }));
        self
    }

    /// Validate and build the descriptor.
    pub fn build(self) -> Result<FeatureDescriptor> {
        let init = self
            .init
            .ok_or_else(|| FeatureError::invalid_descriptor(&self.name, "missing init callback"))?;

        let feature = Arc::new(FnFeature {
            init,
            cleanup: self.cleanup,
        });

        Ok(FeatureDescriptor::new(self.name, &self.pattern, feature)?.with_excludes(self.excludes))
    }
}

/// Lifecycle state of a feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureState {
    /// Not running
    #[default]
    Inactive,
    /// `init` is in progress
    Activating,
    /// Running
    Active,
    /// `cleanup` is in progress
    Deactivating,
    /// Last activation failed; retried on the next matching evaluation
    Failed,
}

impl FeatureState {
    /// Whether the feature is running.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether a generation of the feature is in flight.
    ///
    /// An engaged feature is never matched again until it is back to
    /// `Inactive` or `Failed`.
    pub fn is_engaged(self) -> bool {
        matches!(self, Self::Activating | Self::Active | Self::Deactivating)
    }
}

impl fmt::Display for FeatureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Activating => write!(f, "activating"),
            Self::Active => write!(f, "active"),
            Self::Deactivating => write!(f, "deactivating"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Per-feature lifecycle counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureStats {
    /// Successful activations
    pub activations: u64,

    /// Failed activations
    pub activation_failures: u64,

    /// Deactivations, including those whose cleanup failed
    pub deactivations: u64,

    /// Failed cleanups
    pub cleanup_failures: u64,
}

/// Feature status with detailed information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureStatus {
    /// Feature name
    pub name: String,

    /// Pattern source
    pub pattern: String,

    /// Excluded features
    pub excludes: Vec<String>,

    /// Current state
    pub state: FeatureState,

    /// Most recent activation or cleanup error
    pub last_error: Option<String>,

    /// Last successful activation
    pub last_activated: Option<chrono::DateTime<chrono::Utc>>,

    /// Statistics
    pub stats: FeatureStats,
}
