//! Engine settings.

use std::time::Duration;

use crate::log::DEFAULT_LOG_CAPACITY;
use crate::recurrence::Zone;

/// Pause between a fire and computing the following occurrence.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// How long the host shows a job as `completed` after it runs.
pub const DEFAULT_COMPLETED_DISPLAY: Duration = Duration::from_secs(3);

/// Settings shared by the engine and its host.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Delay before re-arming after a fire. The same for every job.
    pub settle_delay: Duration,
    /// Host-side window for the transient `completed` status.
    pub completed_display: Duration,
    /// Maximum number of retained executions.
    pub log_capacity: usize,
    /// Zone schedules are evaluated in.
    pub zone: Zone,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            completed_display: DEFAULT_COMPLETED_DISPLAY,
            log_capacity: DEFAULT_LOG_CAPACITY,
            zone: Zone::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_zone(mut self, zone: Zone) -> Self {
        self.zone = zone;
        self
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }
}
