//! Rolling update parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use shiftgrid_core::RolloutSettings;

/// How a tier is rolled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingConfig {
    /// New instances started per wave.
    pub batch_size: u32,
    /// How far below its pre-plan size the routing table may shrink.
    pub max_unavailable: u32,
    /// How long a new instance has to become healthy.
    pub startup_timeout: Duration,
    /// Extra attempts per new instance before the plan is rolled back.
    pub startup_retries: u32,
    /// How long a draining instance may finish in-flight work.
    pub drain_timeout: Duration,
}

impl RollingConfig {
    /// Startup attempts per instance, including the first.
    pub fn attempts(&self) -> u32 {
        self.startup_retries.saturating_add(1)
    }
}

impl From<&RolloutSettings> for RollingConfig {
    fn from(s: &RolloutSettings) -> Self {
        Self {
            batch_size: s.batch_size,
            max_unavailable: s.max_unavailable,
            startup_timeout: s.startup_timeout,
            startup_retries: s.startup_retries,
            drain_timeout: s.drain_timeout,
        }
    }
}

/// Number of waves needed to replace `total_instances`.
pub fn batch_count(total_instances: u32, batch_size: u32) -> u32 {
    if batch_size == 0 {
        return total_instances.min(1);
    }
    total_instances.div_ceil(batch_size)
}

/// Minimum routing-table size while rolling a tier of `serving` instances.
pub fn availability_floor(serving: usize, max_unavailable: u32) -> usize {
    serving.saturating_sub(max_unavailable as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_count_calculation() {
        assert_eq!(batch_count(4, 2), 2);
        assert_eq!(batch_count(5, 2), 3);
        assert_eq!(batch_count(1, 1), 1);
        assert_eq!(batch_count(10, 3), 4);
        assert_eq!(batch_count(0, 5), 0);
    }

    #[test]
    fn floor_saturates() {
        assert_eq!(availability_floor(4, 1), 3);
        assert_eq!(availability_floor(2, 5), 0);
        assert_eq!(availability_floor(3, 0), 3);
    }

    #[test]
    fn attempts_include_first_try() {
        let cfg = RollingConfig {
            batch_size: 1,
            max_unavailable: 1,
            startup_timeout: Duration::from_secs(10),
            startup_retries: 2,
            drain_timeout: Duration::from_secs(5),
        };
        assert_eq!(cfg.attempts(), 3);
    }
}
