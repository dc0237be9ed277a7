//! Exclusion resolution.
//!
//! Candidates are ordered by specificity, most specific first, with
//! registration order kept for ties. Walking that order, each selected
//! candidate adds its `excludes` to a blocked set; later candidates in the
//! set are skipped. A candidate that was already selected is never removed
//! by a weaker one.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::feature::FeatureDescriptor;
use crate::pattern::MatchResult;

/// A feature whose pattern matched the current URL.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    /// The matching feature
    pub descriptor: Arc<FeatureDescriptor>,

    /// Captured groups, handed to `init`
    pub captures: MatchResult,

    /// Specificity of the feature's pattern
    pub specificity: f64,
}

impl MatchCandidate {
    /// Test a feature against a URL.
    pub fn evaluate(descriptor: &Arc<FeatureDescriptor>, url: &str) -> Option<Self> {
        let captures = descriptor.pattern().captures(url)?;
        Some(Self {
            descriptor: Arc::clone(descriptor),
            captures,
            specificity: descriptor.pattern().specificity(),
        })
    }

    /// Name of the matching feature.
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }
}

/// A candidate dropped because a more specific winner excluded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    /// The silenced feature
    pub feature: String,

    /// The winner that excluded it
    pub excluded_by: String,
}

/// Output of one resolution pass.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Features to activate, in processing order
    pub selected: Vec<MatchCandidate>,

    /// Candidates that were skipped
    pub excluded: Vec<Exclusion>,
}

impl Resolution {
    /// Names of the selected features.
    pub fn selected_names(&self) -> Vec<&str> {
        self.selected.iter().map(MatchCandidate::name).collect()
    }
}

/// Decide which candidates to activate.
///
/// `candidates` must be in registration order.
pub fn resolve(mut candidates: Vec<MatchCandidate>) -> Resolution {
    // Stable: equal scores keep registration order.
    candidates.sort_by(|a, b| b.specificity.total_cmp(&a.specificity));

    let mut blocked: HashMap<String, String> = HashMap::new();
    let mut resolution = Resolution::default();

    for candidate in candidates {
        if let Some(by) = blocked.get(candidate.name()) {
            tracing::debug!(
                feature = %candidate.name(),
                excluded_by = %by,
                "Feature excluded by a more specific match"
            );
            resolution.excluded.push(Exclusion {
                feature: candidate.name().to_string(),
                excluded_by: by.clone(),
            });
            continue;
        }

        for name in candidate.descriptor.excludes() {
            blocked
                .entry(name.clone())
                .or_insert_with(|| candidate.name().to_string());
        }

        resolution.selected.push(candidate);
    }

    resolution
}
