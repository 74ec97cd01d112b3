//! Context configuration.

use blockq_core::PoolConfig;
use serde::{Deserialize, Serialize};

/// Configuration for a [`QuantContext`](crate::QuantContext).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContextConfig {
    /// CUDA device ordinal
    #[serde(default = "default_device_id")]
    pub device_id: usize,

    /// Buffer pool settings
    #[serde(default)]
    pub pool: PoolConfig,
}

impl ContextConfig {
    /// Set device ordinal
    pub fn with_device(mut self, device_id: usize) -> Self {
        self.device_id = device_id;
        self
    }

    /// Set pool slot capacity
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool = self.pool.with_capacity(capacity);
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> blockq_core::Result<()> {
        self.pool.validate()
    }
}

fn default_device_id() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ContextConfig::default();
        assert_eq!(config.device_id, 0);
        assert_eq!(config.pool.capacity, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config: ContextConfig = serde_json::from_str(r#"{"pool": {"capacity": 4}}"#).unwrap();
        assert_eq!(config.device_id, 0);
        assert_eq!(config.pool.capacity, 4);

        let config: ContextConfig = serde_json::from_str(r#"{"device_id": 1}"#).unwrap();
        assert_eq!(config, ContextConfig::default().with_device(1));
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = ContextConfig::default()
            .with_device(2)
            .with_pool_capacity(32);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ContextConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = ContextConfig::default().with_pool_capacity(0);
        assert!(matches!(
            config.validate(),
            Err(blockq_core::Error::InvalidCapacity(0))
        ));
    }
}
