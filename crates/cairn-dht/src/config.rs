//! Router tuning parameters.

use serde::{Deserialize, Serialize};

use crate::{DhtError, Result};

/// Tunable knobs of the routing core. The compile-time constants
/// ([`GMRT_SECONDS`](crate::GMRT_SECONDS), store and return sizes) are not
/// repeated here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouterConfig {
    /// How much reach every peer loses per second of staleness.
    #[serde(default = "default_reach_decrease_per_second")]
    pub reach_decrease_per_second: u32,

    /// Hard per-request timeout. A peer blowing it has its reach zeroed.
    #[serde(default = "default_search_timeout_seconds")]
    pub search_timeout_seconds: u64,

    /// Consecutive timeouts before a peer is dropped from the store.
    #[serde(default = "default_max_timeouts")]
    pub max_timeouts: u32,

    /// Seconds between local maintenance searches (random targets inside
    /// our own footprint).
    #[serde(default = "default_local_maintenance_search_period")]
    pub local_maintenance_search_period: u64,

    /// Seconds between re-runs of the last externally serviced search.
    #[serde(default = "default_global_maintenance_search_period")]
    pub global_maintenance_search_period: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            reach_decrease_per_second: default_reach_decrease_per_second(),
            search_timeout_seconds: default_search_timeout_seconds(),
            max_timeouts: default_max_timeouts(),
            local_maintenance_search_period: default_local_maintenance_search_period(),
            global_maintenance_search_period: default_global_maintenance_search_period(),
        }
    }
}

impl RouterConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.search_timeout_seconds == 0 {
            return Err(DhtError::InvalidConfig(
                "search_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.max_timeouts == 0 {
            return Err(DhtError::InvalidConfig(
                "max_timeouts must be positive".to_string(),
            ));
        }
        if self.local_maintenance_search_period == 0 || self.global_maintenance_search_period == 0
        {
            return Err(DhtError::InvalidConfig(
                "maintenance search periods must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_reach_decrease_per_second() -> u32 {
    20
}

fn default_search_timeout_seconds() -> u64 {
    60
}

fn default_max_timeouts() -> u32 {
    3
}

fn default_local_maintenance_search_period() -> u64 {
    20
}

fn default_global_maintenance_search_period() -> u64 {
    90
}
