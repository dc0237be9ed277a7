//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::Result;

/// What `register()` does when the name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReregisterPolicy {
    /// Return [`FeatureError::AlreadyExists`](crate::FeatureError::AlreadyExists).
    #[default]
    Reject,
    /// Force-deactivate the old descriptor and swap in the new one.
    Replace,
}

/// Activation engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fallback URL poll interval in milliseconds (0 disables polling)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Settle delay after a navigation signal before the URL is compared
    #[serde(default)]
    pub debounce_ms: u64,

    /// Features that are never matched
    #[serde(default)]
    pub disabled_features: Vec<String>,

    /// Features that are allowed to match (if empty, all are allowed)
    #[serde(default)]
    pub enabled_features: Vec<String>,

    /// Behavior on duplicate registration
    #[serde(default)]
    pub reregister: ReregisterPolicy,

    /// Capacity of the broadcast event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            debounce_ms: 0,
            disabled_features: Vec::new(),
            enabled_features: Vec::new(),
            reregister: ReregisterPolicy::default(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Poll period, or `None` when polling is disabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }

    /// Debounce delay.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Check if a feature may be matched.
    pub fn is_feature_enabled(&self, name: &str) -> bool {
        if self.disabled_features.iter().any(|n| n == name) {
            return false;
        }

        if !self.enabled_features.is_empty() {
            return self.enabled_features.iter().any(|n| n == name);
        }

        true
    }

    /// Enable a feature.
    pub fn enable_feature(&mut self, name: &str) {
        self.disabled_features.retain(|n| n != name);
        if !self.enabled_features.is_empty() && !self.enabled_features.iter().any(|n| n == name) {
            self.enabled_features.push(name.to_string());
        }
    }

    /// Disable a feature.
    pub fn disable_feature(&mut self, name: &str) {
        if !self.disabled_features.iter().any(|n| n == name) {
            self.disabled_features.push(name.to_string());
        }
        self.enabled_features.retain(|n| n != name);
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_event_buffer() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval(), Some(Duration::from_secs(1)));
        assert!(config.debounce().is_zero());
        assert_eq!(config.reregister, ReregisterPolicy::Reject);
    }

    #[test]
    fn test_feature_enabled() {
        let mut config = EngineConfig::default();
        assert!(config.is_feature_enabled("cards"));

        config.disable_feature("cards");
        assert!(!config.is_feature_enabled("cards"));

        config.enable_feature("cards");
        assert!(config.is_feature_enabled("cards"));
    }

    #[test]
    fn test_allow_list() {
        let config = EngineConfig {
            enabled_features: vec!["cards".to_string()],
            ..Default::default()
        };
        assert!(config.is_feature_enabled("cards"));
        assert!(!config.is_feature_enabled("summary"));
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            poll_interval_ms = 0
            debounce_ms = 25
            reregister = "replace"
            disabled_features = ["legacy"]
            "#,
        )
        .unwrap();

        assert_eq!(config.poll_interval(), None);
        assert_eq!(config.debounce(), Duration::from_millis(25));
        assert_eq!(config.reregister, ReregisterPolicy::Replace);
        assert!(!config.is_feature_enabled("legacy"));
        assert_eq!(config.event_buffer, 256);
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "poll_interval_ms = 250").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.poll_interval(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_invalid_toml() {
        let result = EngineConfig::from_toml_str("poll_interval_ms = \"soon\"");
        assert!(matches!(
            result,
            Err(crate::FeatureError::SerializationError(_))
        ));
    }
}
