//! Host-side job list and its JSON persistence.
//!
//! The engine never reads this store; hosts pass `list()` to
//! [`SchedulerHandle::reschedule_all`](crate::SchedulerHandle::reschedule_all)
//! after every change that affects scheduling.

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::types::{Job, JobStatus, JobUpdate};
use crate::SchedulerError;

/// Ordered list of job definitions.
#[derive(Debug, Clone, Default)]
pub struct JobStore {
    jobs: Vec<Job>,
    /// Stored records that are not jobs at all, written back untouched.
    unreadable: Vec<serde_json::Value>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_jobs(jobs: Vec<Job>) -> Self {
        Self {
            jobs,
            unreadable: Vec::new(),
        }
    }

    /// Load the job list. A missing file is an empty list; a file that is
    /// not a JSON array is an error.
    ///
    /// Records are read one by one so a bad record cannot take its siblings
    /// down with it. A record with an unreadable schedule config loads as an
    /// unschedulable job; a record that is not a job at all is set aside and
    /// kept for the next save.
    ///
    /// `completed` only lives for a short display window, so it is read
    /// back as `active`.
    pub fn load(path: &Path) -> Result<Self, SchedulerError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no job file on disk");
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };

        let records: Vec<serde_json::Value> =
            serde_json::from_str(&data).map_err(|source| SchedulerError::CorruptState {
                path: path.to_path_buf(),
                source,
            })?;

        let mut store = Self::new();
        for record in records {
            match serde_json::from_value::<Job>(record.clone()) {
                Ok(mut job) => {
                    if job.status == JobStatus::Completed {
                        job.status = JobStatus::Active;
                    }
                    if job.schedule_config.malformed.is_some() {
                        warn!(job_id = %job.id, "job has an unreadable schedule config");
                    }
                    store.jobs.push(job);
                }
                Err(error) => {
                    warn!(%error, "setting aside unreadable job record");
                    store.unreadable.push(record);
                }
            }
        }

        info!(
            count = store.jobs.len(),
            unreadable = store.unreadable.len(),
            path = %path.display(),
            "loaded jobs"
        );
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<(), SchedulerError> {
        let mut records = self
            .jobs
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        records.extend(self.unreadable.iter().cloned());

        let json = serde_json::to_string_pretty(&records)?;
        write_atomic(path, json.as_bytes())?;
        Ok(())
    }

    pub fn list(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Look a job up by full id or by an unambiguous id prefix.
    pub fn find(&self, key: &str) -> Result<&Job, SchedulerError> {
        if let Some(job) = self.get(key) {
            return Ok(job);
        }

        let mut matches = self.jobs.iter().filter(|j| j.id.starts_with(key));
        match (matches.next(), matches.next()) {
            (Some(job), None) if !key.is_empty() => Ok(job),
            _ => Err(SchedulerError::JobNotFound(key.to_string())),
        }
    }

    pub fn add(&mut self, job: Job) -> Result<(), SchedulerError> {
        if self.get(&job.id).is_some() {
            return Err(SchedulerError::InvalidJob(format!(
                "duplicate job id: {}",
                job.id
            )));
        }
        info!(job_id = %job.id, name = %job.name, "added job");
        self.jobs.push(job);
        Ok(())
    }

    pub fn update(&mut self, id: &str, update: JobUpdate) -> Result<&Job, SchedulerError> {
        let job = self.get_mut(id)?;
        job.apply(update);
        Ok(job)
    }

    pub fn remove(&mut self, id: &str) -> Result<Job, SchedulerError> {
        let index = self
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
        let job = self.jobs.remove(index);
        info!(job_id = %job.id, name = %job.name, "removed job");
        Ok(job)
    }

    pub fn pause(&mut self, id: &str) -> Result<&Job, SchedulerError> {
        self.update(id, JobUpdate::status(JobStatus::Paused))
    }

    pub fn resume(&mut self, id: &str) -> Result<&Job, SchedulerError> {
        self.update(id, JobUpdate::status(JobStatus::Active))
    }

    /// Apply an execution: stamp `last_run`, bump the counter, and flag an
    /// active job as `completed`.
    pub fn record_execution(
        &mut self,
        id: &str,
        executed_at: DateTime<Utc>,
    ) -> Result<&Job, SchedulerError> {
        let job = self.get_mut(id)?;
        job.last_run = Some(executed_at);
        job.execution_count += 1;
        if job.status == JobStatus::Active {
            job.status = JobStatus::Completed;
        }
        Ok(job)
    }

    /// End the `completed` display window. Returns whether anything changed.
    pub fn revert_completed(&mut self, id: &str) -> bool {
        match self.get_mut(id) {
            Ok(job) if job.status == JobStatus::Completed => {
                job.status = JobStatus::Active;
                true
            }
            _ => false,
        }
    }

    pub fn set_next_run(
        &mut self,
        id: &str,
        next_run: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.update(id, JobUpdate::next_run(next_run)).map(|_| ())
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Job, SchedulerError> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))
    }
}

/// Write `contents` to a sibling temp file and rename it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}
