use std::time::Duration;

use serde::Deserialize;

use crate::types::HumanDuration;

/// Service-worker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum number of retries for a transiently failing service call.
    pub retry_cap: u32,
    /// Base delay before the first retry; subsequent retries back off
    /// linearly (`attempt × retry_base_delay`).
    pub retry_base_delay: HumanDuration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry_cap: 3,
            retry_base_delay: Duration::from_millis(200).into(),
        }
    }
}
