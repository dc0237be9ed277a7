//! Feature registry.
//!
//! Registration order is preserved; the resolver uses it to break ties
//! between equally specific matches.

use indexmap::IndexMap;
use std::sync::Arc;

use crate::feature::FeatureDescriptor;
use crate::{FeatureError, Result};

/// Ordered registry of feature descriptors, keyed by name.
#[derive(Debug, Default)]
pub struct FeatureRegistry {
    features: IndexMap<String, Arc<FeatureDescriptor>>,
}

impl FeatureRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feature. Fails if the name is taken.
    pub fn register(&mut self, descriptor: FeatureDescriptor) -> Result<Arc<FeatureDescriptor>> {
        if self.features.contains_key(descriptor.name()) {
            return Err(FeatureError::AlreadyExists(descriptor.name().to_string()));
        }

        let descriptor = Arc::new(descriptor);
        self.features
            .insert(descriptor.name().to_string(), Arc::clone(&descriptor));

        tracing::debug!(
            feature = %descriptor.name(),
            pattern = %descriptor.pattern(),
            "Registered feature"
        );
        Ok(descriptor)
    }

    /// Insert or overwrite a feature, returning the previous descriptor.
    ///
    /// An overwritten feature keeps its original registration position.
    /// Callers are responsible for deactivating the old descriptor first.
    pub fn replace(
        &mut self,
        descriptor: FeatureDescriptor,
    ) -> (Arc<FeatureDescriptor>, Option<Arc<FeatureDescriptor>>) {
        let descriptor = Arc::new(descriptor);
        let previous = self
            .features
            .insert(descriptor.name().to_string(), Arc::clone(&descriptor));
        (descriptor, previous)
    }

    /// Remove a feature.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<FeatureDescriptor>> {
        self.features.shift_remove(name)
    }

    /// Get a feature by name.
    pub fn get(&self, name: &str) -> Option<&Arc<FeatureDescriptor>> {
        self.features.get(name)
    }

    /// Check if a feature is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.features.contains_key(name)
    }

    /// Features in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<FeatureDescriptor>> {
        self.features.values()
    }

    /// Feature names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.features.keys().cloned().collect()
    }

    /// Number of registered features.
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
