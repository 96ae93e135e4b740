//! Configuration for the cache tiers.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Configuration for all three cache tiers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// In-process tier.
    pub l1: L1Config,

    /// External tier.
    pub l2: L2Config,

    /// Persisted tier.
    pub l3: L3Config,

    /// Seconds between expiry sweeps of L2 and L3.
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    /// A configuration with every tier turned off.
    pub fn disabled() -> Self {
        Self {
            l1: L1Config {
                enabled: false,
                ..L1Config::default()
            },
            l2: L2Config {
                enabled: false,
                ..L2Config::default()
            },
            l3: L3Config {
                enabled: false,
                ..L3Config::default()
            },
            sweep_interval_secs: 300,
        }
    }

    /// Set the L1 configuration.
    pub fn with_l1(mut self, l1: L1Config) -> Self {
        self.l1 = l1;
        self
    }

    /// Set the L2 configuration.
    pub fn with_l2(mut self, l2: L2Config) -> Self {
        self.l2 = l2;
        self
    }

    /// Set the L3 configuration.
    pub fn with_l3(mut self, l3: L3Config) -> Self {
        self.l3 = l3;
        self
    }

    /// Interval between sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Check that every enabled tier is usable.
    pub fn validate(&self) -> Result<()> {
        if self.l1.enabled && self.l1.capacity == 0 {
            return Err(CacheError::InvalidConfiguration(
                "l1 capacity must be greater than zero".to_string(),
            ));
        }
        if self.l3.enabled && self.l3.dir.is_none() {
            return Err(CacheError::InvalidConfiguration(
                "l3 requires a directory".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1: L1Config::default(),
            l2: L2Config::default(),
            l3: L3Config::default(),
            sweep_interval_secs: 300,
        }
    }
}

/// In-process tier settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct L1Config {
    pub enabled: bool,

    /// Maximum number of entries before usefulness eviction kicks in.
    pub capacity: usize,

    pub ttl_secs: u64,
}

impl L1Config {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 10_000,
            ttl_secs: 15 * 60,
        }
    }
}

/// External tier settings. The service itself is supplied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct L2Config {
    pub enabled: bool,
    pub ttl_secs: u64,
}

impl L2Config {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 60 * 60,
        }
    }
}

/// Persisted tier settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct L3Config {
    pub enabled: bool,
    pub ttl_secs: u64,

    /// Root directory for persisted entries.
    pub dir: Option<PathBuf>,
}

impl L3Config {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for L3Config {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 7 * 24 * 60 * 60,
            dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert!(config.l1.enabled);
        assert!(!config.l2.enabled);
        assert!(!config.l3.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_l3_requires_dir() {
        let config = CacheConfig::default().with_l3(L3Config {
            enabled: true,
            ..L3Config::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = CacheConfig::default().with_l1(L1Config {
            capacity: 0,
            ..L1Config::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"l1": {"capacity": 5}}"#).unwrap();
        assert_eq!(config.l1.capacity, 5);
        assert_eq!(config.l1.ttl_secs, L1Config::default().ttl_secs);
        assert_eq!(config.l3, L3Config::default());
    }
}
