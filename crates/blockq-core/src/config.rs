//! Buffer pool configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of pool slots.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

/// Buffer pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of idle regions the pool may hold
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

impl PoolConfig {
    /// Set slot capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidCapacity(self.capacity));
        }
        Ok(())
    }
}

fn default_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.capacity, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: PoolConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, PoolConfig::default());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = PoolConfig::default().with_capacity(0);
        assert!(matches!(config.validate(), Err(Error::InvalidCapacity(0))));
    }
}
