use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Defaults seeded into every [`CuratorCacheBuilder`](crate::CuratorCacheBuilder)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheConfig {
    /// Emit a `Refreshed` event when a refresh completes
    #[serde(default = "default_true")]
    pub send_refresh_events: bool,

    /// Issue `refresh_all` from `start`
    #[serde(default = "default_true")]
    pub refresh_on_start: bool,

    /// Process child lists in lexical order
    #[serde(default = "default_true")]
    pub sort_children: bool,

    /// Entry bound used by `using_weak_values`
    #[serde(default = "default_weak_values_capacity")]
    pub weak_values_capacity: usize,

    /// Entry bound used by `using_soft_values`
    #[serde(default = "default_soft_values_capacity")]
    pub soft_values_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            send_refresh_events: default_true(),
            refresh_on_start: default_true(),
            sort_children: default_true(),
            weak_values_capacity: default_weak_values_capacity(),
            soft_values_capacity: default_soft_values_capacity(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.weak_values_capacity == 0 {
            return Err(Error::Configuration("weak_values_capacity must be greater than 0".into()));
        }

        if self.soft_values_capacity < self.weak_values_capacity {
            return Err(Error::Configuration(format!(
                "soft_values_capacity ({}) must not be below weak_values_capacity ({})",
                self.soft_values_capacity, self.weak_values_capacity
            )));
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_weak_values_capacity() -> usize {
    1_000
}
fn default_soft_values_capacity() -> usize {
    10_000
}
