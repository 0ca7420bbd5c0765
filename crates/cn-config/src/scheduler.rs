use std::time::Duration;

use serde::Deserialize;

use crate::types::HumanDuration;

/// Scheduler and admission settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Queue depth above which a warning is logged. Tokens are never
    /// dropped for depth.
    pub queue_high_watermark: usize,
    /// How long a token referencing a not-yet-active rule base is parked
    /// before being dropped.
    pub park_grace: HumanDuration,
    /// Interval of the deadline/park sweep tick.
    pub sweep_interval: HumanDuration,
    /// Tolerated clock skew when comparing join deadlines across nodes.
    pub join_deadline_skew: HumanDuration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_high_watermark: 1024,
            park_grace: Duration::from_secs(5).into(),
            sweep_interval: Duration::from_millis(250).into(),
            join_deadline_skew: Duration::ZERO.into(),
        }
    }
}
