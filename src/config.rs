//! Bus configuration

use crate::error::{EventError, Result};
use crate::registry::DEFAULT_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How publishes made off the delivery context are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DispatchMode {
    /// Queue off-context publishes and coalesce them per channel
    #[default]
    Marshal,
    /// Reject off-context publishes with a threading error
    Strict,
}

/// Configuration for [`crate::EventBus`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    /// Maximum number of live channels kept at once
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default)]
    pub dispatch: DispatchMode,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            dispatch: DispatchMode::default(),
        }
    }
}

impl BusConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(EventError::Config(
                "Live channel capacity must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EventError::Config(format!(
                "Failed to read bus config {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|e| {
            EventError::Config(format!(
                "Failed to parse bus config {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), capacity = config.capacity, "Bus config loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.capacity, 20);
        assert_eq!(config.dispatch, DispatchMode::Marshal);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = BusConfig::from_json(r#"{"dispatch":"strict"}"#).unwrap();
        assert_eq!(config.capacity, 20);
        assert_eq!(config.dispatch, DispatchMode::Strict);

        let config = BusConfig::from_json(r#"{"capacity":3}"#).unwrap();
        assert_eq!(config.capacity, 3);
        assert_eq!(config.dispatch, DispatchMode::Marshal);
    }

    #[test]
    fn test_from_json_rejects_zero_capacity() {
        let err = BusConfig::from_json(r#"{"capacity":0}"#).unwrap_err();
        assert!(matches!(err, EventError::Config(_)));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let err = BusConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, EventError::Serialization(_)));
    }

    #[test]
    fn test_load_file() {
        let dir = std::env::temp_dir().join(format!("a3s-live-event-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bus.json");
        std::fs::write(&path, r#"{"capacity":5,"dispatch":"marshal"}"#).unwrap();

        let config = BusConfig::load(&path).unwrap();
        assert_eq!(config, BusConfig::default().with_capacity(5));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join(format!("missing-{}.json", uuid::Uuid::new_v4()));
        let err = BusConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to read bus config"));
    }

    #[test]
    fn test_serialization_camel_case() {
        let json = serde_json::to_string(&BusConfig::default().with_dispatch(DispatchMode::Strict))
            .unwrap();
        assert_eq!(json, r#"{"capacity":20,"dispatch":"strict"}"#);
    }
}
