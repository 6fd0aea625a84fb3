//! Recurring job scheduler for chime.
//!
//! This crate provides:
//! - Next-fire-time calculation for hourly, daily and weekly schedules
//! - A timer engine that keeps one pending timer per active job and is
//!   reconciled against the host's job list
//! - A bounded, newest-first execution log
//! - The host-side job store and JSON persistence

mod clock;
mod config;
mod engine;
mod error;
mod log;
mod recurrence;
mod store;
mod timer;
mod types;

pub use clock::{AnchoredClock, Clock, SharedClock, SystemClock};
pub use config::{DEFAULT_COMPLETED_DISPLAY, DEFAULT_SETTLE_DELAY, SchedulerConfig};
pub use engine::{Scheduler, SchedulerEvent, SchedulerHandle, SharedLog};
pub use error::SchedulerError;
pub use log::{DEFAULT_LOG_CAPACITY, ExecutionLog};
pub use recurrence::{Schedule, ScheduleError, Zone, describe, next_fire_time};
pub use store::JobStore;
pub use timer::{TimerFired, TimerKind, TimerRegistry, TimerState};
pub use types::{
    ExecutionStats, ExecutionStatus, Job, JobExecution, JobStatus, JobUpdate, LogSummary,
    ScheduleConfig, ScheduleType,
};
