//! Feature engine error types.

use thiserror::Error;

/// Errors surfaced by the activation engine.
///
/// Only registration and configuration problems are returned to callers.
/// Failures raised by a feature's own callbacks are captured by the
/// lifecycle controller and reported through the event bus instead.
#[derive(Error, Debug)]
pub enum FeatureError {
    /// Feature not found.
    #[error("Feature not found: {0}")]
    NotFound(String),

    /// A feature with the same name is already registered.
    #[error("Feature already registered: {0}")]
    AlreadyExists(String),

    /// The URL pattern failed to compile.
    #[error("Invalid URL pattern for feature '{feature}': {message}")]
    InvalidPattern { feature: String, message: String },

    /// The descriptor is structurally invalid (empty name and the like).
    #[error("Invalid descriptor for feature '{feature}': {message}")]
    InvalidDescriptor { feature: String, message: String },

    /// A feature's `init` callback failed.
    #[error("Failed to activate feature '{feature}': {message}")]
    ActivationFailed { feature: String, message: String },

    /// A feature's `cleanup` callback failed.
    #[error("Failed to clean up feature '{feature}': {message}")]
    CleanupFailed { feature: String, message: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl FeatureError {
    /// Create an invalid pattern error.
    pub fn invalid_pattern(feature: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPattern {
            feature: feature.into(),
            message: message.into(),
        }
    }

    /// Create an invalid descriptor error.
    pub fn invalid_descriptor(feature: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            feature: feature.into(),
            message: message.into(),
        }
    }

    /// Create an activation error.
    pub fn activation_failed(feature: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ActivationFailed {
            feature: feature.into(),
            message: message.into(),
        }
    }

    /// Create a cleanup error.
    pub fn cleanup_failed(feature: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CleanupFailed {
            feature: feature.into(),
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for FeatureError {
    fn from(err: toml::de::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for FeatureError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, FeatureError>;
