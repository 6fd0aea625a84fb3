//! Bounded, newest-first execution history.

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use tracing::{debug, warn};

use crate::types::{ExecutionStats, ExecutionStatus, JobExecution, LogSummary};
use crate::SchedulerError;

/// Default number of executions retained.
pub const DEFAULT_LOG_CAPACITY: usize = 100;

/// Append-only record of job firings, newest first.
///
/// Past `capacity` the oldest entries are evicted. Entries outlive the jobs
/// they describe.
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    entries: VecDeque<JobExecution>,
    capacity: usize,
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl ExecutionLog {
    /// Create an empty log. A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Build a log from entries already ordered newest first.
    pub fn from_entries(entries: Vec<JobExecution>, capacity: usize) -> Self {
        let mut log = Self::new(capacity);
        log.entries = entries.into();
        log.entries.truncate(log.capacity);
        log
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert at the head, evicting the oldest entry past capacity.
    pub fn append(&mut self, execution: JobExecution) {
        self.entries.push_front(execution);
        self.entries.truncate(self.capacity);
    }

    /// All entries, newest first.
    pub fn list(&self) -> Vec<JobExecution> {
        self.entries.iter().cloned().collect()
    }

    /// Entries for one job, newest first.
    pub fn list_for_job(&self, job_id: &str) -> Vec<JobExecution> {
        self.entries
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Whether an execution with this id is retained.
    pub fn contains(&self, execution_id: &str) -> bool {
        self.entries.iter().any(|e| e.id == execution_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Aggregate the entries for one job.
    pub fn stats(&self, job_id: &str) -> ExecutionStats {
        let mut count = 0;
        let mut success_count = 0;
        let mut failed_count = 0;
        let mut total_ms = 0u64;
        let mut last_execution_time = None;

        for entry in self.entries.iter().filter(|e| e.job_id == job_id) {
            if last_execution_time.is_none() {
                last_execution_time = Some(entry.executed_at);
            }
            count += 1;
            total_ms += entry.duration;
            match entry.status {
                ExecutionStatus::Success => success_count += 1,
                ExecutionStatus::Failed => failed_count += 1,
            }
        }

        ExecutionStats {
            count,
            success_count,
            failed_count,
            last_execution_time,
            average_duration_ms: average(total_ms, count),
        }
    }

    /// Aggregate the whole log.
    pub fn summary(&self) -> LogSummary {
        let unique_jobs = self
            .entries
            .iter()
            .map(|e| e.job_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        let total_ms = self.entries.iter().map(|e| e.duration).sum();

        LogSummary {
            total_executions: self.entries.len(),
            unique_jobs,
            average_duration_ms: average(total_ms, self.entries.len()),
        }
    }

    /// Load a persisted log.
    ///
    /// A missing file yields an empty log. A file that cannot be decoded is
    /// treated as empty too, with a warning, so a damaged history never
    /// blocks scheduling.
    pub fn load(path: &Path, capacity: usize) -> Result<Self, SchedulerError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no execution log on disk");
                return Ok(Self::new(capacity));
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<Vec<JobExecution>>(&data) {
            Ok(entries) => Ok(Self::from_entries(entries, capacity)),
            Err(source) => {
                let error = SchedulerError::CorruptState {
                    path: path.to_path_buf(),
                    source,
                };
                warn!(error = %error, "discarding unreadable execution log");
                Ok(Self::new(capacity))
            }
        }
    }

    /// Write the log as a JSON array, newest first.
    pub fn save(&self, path: &Path) -> Result<(), SchedulerError> {
        let json = serde_json::to_string_pretty(&self.entries)?;
        crate::store::write_atomic(path, json.as_bytes())?;
        Ok(())
    }
}

fn average(total_ms: u64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        total_ms as f64 / count as f64
    }
}
