//! Daemon mode: owns the job list, drives the engine, and applies the
//! engine's events back onto job records.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use chime_scheduler::{
    ExecutionLog, JobStore, Scheduler, SchedulerConfig, SchedulerError, SchedulerEvent,
    SharedLog, SystemClock,
};

/// Locations of the persisted job list and execution log.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub jobs: PathBuf,
    pub executions: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            jobs: data_dir.join("jobs.json"),
            executions: data_dir.join("executions.json"),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub paths: DataPaths,
    pub scheduler: SchedulerConfig,
    /// How often to look for edits made by other processes.
    pub reload_interval: Duration,
}

/// What changed on disk since the host last read or wrote its files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DiskChanges {
    jobs: bool,
    executions: bool,
}

/// Fingerprint of a data file's contents, `None` when it does not exist.
/// Timestamps are too coarse on some filesystems to tell two quick writes
/// apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FileStamp(Option<u64>);

impl FileStamp {
    fn of(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => {
                let mut hasher = DefaultHasher::new();
                bytes.hash(&mut hasher);
                Self(Some(hasher.finish()))
            }
            Err(_) => Self(None),
        }
    }
}

/// Host-side state: the job list, the shared execution log, and the
/// stamps of their files as last seen.
///
/// Other chime processes edit the same files, so every write is preceded by
/// a reload of whatever changed on disk. A reloaded job list leaves
/// `needs_reschedule` set until the run loop reconciles the engine.
struct Host {
    paths: DataPaths,
    log_capacity: usize,
    store: JobStore,
    log: SharedLog,
    jobs_seen: FileStamp,
    executions_seen: FileStamp,
    needs_reschedule: bool,
}

impl Host {
    fn load(paths: DataPaths, log_capacity: usize) -> Result<Self, SchedulerError> {
        let store = JobStore::load(&paths.jobs)?;
        let log = ExecutionLog::load(&paths.executions, log_capacity)?;

        Ok(Self {
            jobs_seen: FileStamp::of(&paths.jobs),
            executions_seen: FileStamp::of(&paths.executions),
            paths,
            log_capacity,
            store,
            log: Arc::new(RwLock::new(log)),
            needs_reschedule: false,
        })
    }

    fn save_jobs(&mut self) {
        if let Err(e) = self.store.save(&self.paths.jobs) {
            error!(error = %e, "failed to save jobs");
        }
        self.jobs_seen = FileStamp::of(&self.paths.jobs);
    }

    async fn save_log(&mut self) {
        if let Err(e) = self.log.read().await.save(&self.paths.executions) {
            error!(error = %e, "failed to save execution log");
        }
        self.executions_seen = FileStamp::of(&self.paths.executions);
    }

    fn disk_changes(&self) -> DiskChanges {
        DiskChanges {
            jobs: FileStamp::of(&self.paths.jobs) != self.jobs_seen,
            executions: FileStamp::of(&self.paths.executions) != self.executions_seen,
        }
    }

    /// Re-read whatever changed on disk. Returns whether the job list was
    /// replaced, in which case the engine must be reconciled.
    async fn reload(&mut self, changes: DiskChanges) -> Result<bool, SchedulerError> {
        if changes.executions {
            let log = ExecutionLog::load(&self.paths.executions, self.log_capacity)?;
            info!(entries = log.len(), "reloaded execution log");
            *self.log.write().await = log;
            self.executions_seen = FileStamp::of(&self.paths.executions);
        }

        if changes.jobs {
            self.store = JobStore::load(&self.paths.jobs)?;
            self.jobs_seen = FileStamp::of(&self.paths.jobs);
            info!(jobs = self.store.len(), "job list changed on disk");
            self.needs_reschedule = true;
            return Ok(true);
        }
        Ok(false)
    }

    /// Pick up edits made by other processes before touching the files.
    async fn sync_from_disk(&mut self) {
        let changes = self.disk_changes();
        if changes == DiskChanges::default() {
            return;
        }
        if let Err(e) = self.reload(changes).await {
            warn!(error = %e, "failed to reload, keeping current state");
        }
    }

    /// Whether the job list was reloaded since the last call.
    fn take_needs_reschedule(&mut self) -> bool {
        std::mem::take(&mut self.needs_reschedule)
    }

    /// Apply an engine event. Returns the id of a job whose `completed`
    /// display window has just started.
    async fn apply_event(&mut self, event: SchedulerEvent) -> Option<String> {
        self.sync_from_disk().await;

        match event {
            SchedulerEvent::Executed { execution } => {
                {
                    // A reloaded log predates this execution.
                    let mut log = self.log.write().await;
                    if !log.contains(&execution.id) {
                        log.append(execution.clone());
                    }
                }
                self.save_log().await;

                match self
                    .store
                    .record_execution(&execution.job_id, execution.executed_at)
                {
                    Ok(job) => {
                        debug!(job_id = %job.id, count = job.execution_count, "recorded execution");
                    }
                    Err(e) => {
                        debug!(error = %e, "execution for a job no longer in the list");
                        return None;
                    }
                }
                self.save_jobs();
                Some(execution.job_id)
            }
            SchedulerEvent::NextRunUpdated { job_id, next_run } => {
                match self.store.set_next_run(&job_id, next_run) {
                    Ok(()) => self.save_jobs(),
                    Err(e) => debug!(error = %e, "next run for a job no longer in the list"),
                }
                None
            }
        }
    }

    async fn end_completed_window(&mut self, job_id: &str) {
        self.sync_from_disk().await;

        if self.store.revert_completed(job_id) {
            debug!(job_id, "completed window over");
            self.save_jobs();
        }
    }
}

/// Run the daemon until ctrl-c.
pub async fn run(config: DaemonConfig) -> Result<(), SchedulerError> {
    let mut host = Host::load(config.paths.clone(), config.scheduler.log_capacity)?;
    info!(
        jobs = host.store.len(),
        jobs_path = %config.paths.jobs.display(),
        "daemon starting"
    );

    let completed_display = config.scheduler.completed_display;
    let (scheduler, handle, mut events) = Scheduler::new(
        config.scheduler,
        Arc::new(SystemClock),
        Arc::clone(&host.log),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    handle.reschedule_all(host.store.list().to_vec()).await?;

    let (revert_tx, mut revert_rx) = mpsc::unbounded_channel::<String>();
    let mut reload = tokio::time::interval(config.reload_interval);
    reload.set_missed_tick_behavior(MissedTickBehavior::Skip);
    reload.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("received ctrl-c, shutting down");
                break;
            }

            Some(event) = events.recv() => {
                if let Some(job_id) = host.apply_event(event).await {
                    let revert_tx = revert_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(completed_display).await;
                        let _ = revert_tx.send(job_id);
                    });
                }
            }

            Some(job_id) = revert_rx.recv() => {
                host.end_completed_window(&job_id).await;
            }

            _ = reload.tick() => {
                host.sync_from_disk().await;
            }
        }

        if host.take_needs_reschedule() {
            handle.reschedule_all(host.store.list().to_vec()).await?;
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "scheduler task failed");
    }
    host.sync_from_disk().await;
    host.save_jobs();
    host.save_log().await;
    info!("daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chime_scheduler::{Job, JobExecution, JobStatus, ScheduleConfig, ScheduleType};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn job(name: &str) -> Job {
        Job::new(name, "", ScheduleType::Hourly, ScheduleConfig::hourly(5)).unwrap()
    }

    fn host_with_jobs(jobs: &[Job]) -> (tempfile::TempDir, Host) {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        JobStore::from_jobs(jobs.to_vec())
            .save(&paths.jobs)
            .unwrap();
        let host = Host::load(paths, 100).unwrap();
        (dir, host)
    }

    fn names_on_disk(host: &Host) -> Vec<String> {
        JobStore::load(&host.paths.jobs)
            .unwrap()
            .list()
            .iter()
            .map(|j| j.name.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_executed_event_updates_and_persists() {
        let a = job("a");
        let (_dir, mut host) = host_with_jobs(std::slice::from_ref(&a));
        let execution = JobExecution::hello(&a.id, &a.name, Utc::now(), 700);
        host.log.write().await.append(execution.clone());

        let started = host
            .apply_event(SchedulerEvent::Executed {
                execution: execution.clone(),
            })
            .await;
        assert_eq!(started, Some(a.id.clone()));

        let stored = host.store.get(&a.id).unwrap();
        assert_eq!(stored.execution_count, 1);
        assert_eq!(stored.last_run, Some(execution.executed_at));
        assert_eq!(stored.status, JobStatus::Completed);

        let on_disk = ExecutionLog::load(&host.paths.executions, 100).unwrap();
        assert_eq!(on_disk.list(), vec![execution]);
        assert_eq!(host.disk_changes(), DiskChanges::default());
        assert!(!host.take_needs_reschedule());

        host.end_completed_window(&a.id).await;
        assert_eq!(host.store.get(&a.id).unwrap().status, JobStatus::Active);
    }

    #[tokio::test]
    async fn test_events_for_removed_jobs_are_ignored() {
        let (_dir, mut host) = host_with_jobs(&[job("a")]);
        let execution = JobExecution::hello("gone", "gone", Utc::now(), 700);

        let started = host
            .apply_event(SchedulerEvent::Executed { execution })
            .await;
        assert!(started.is_none());

        let started = host
            .apply_event(SchedulerEvent::NextRunUpdated {
                job_id: "gone".into(),
                next_run: Utc::now(),
            })
            .await;
        assert!(started.is_none());
    }

    #[tokio::test]
    async fn test_next_run_recorded() {
        let a = job("a");
        let (_dir, mut host) = host_with_jobs(std::slice::from_ref(&a));
        let next_run = Utc::now();
        host.apply_event(SchedulerEvent::NextRunUpdated {
            job_id: a.id.clone(),
            next_run,
        })
        .await;

        let on_disk = JobStore::load(&host.paths.jobs).unwrap();
        assert_eq!(on_disk.get(&a.id).unwrap().next_run, Some(next_run));
    }

    #[tokio::test]
    async fn test_external_remove_survives_event_write() {
        let keep = job("keep");
        let doomed = job("doomed");
        let (_dir, mut host) = host_with_jobs(&[keep.clone(), doomed.clone()]);

        let mut external = JobStore::load(&host.paths.jobs).unwrap();
        external.remove(&doomed.id).unwrap();
        external.save(&host.paths.jobs).unwrap();

        host.apply_event(SchedulerEvent::NextRunUpdated {
            job_id: keep.id.clone(),
            next_run: Utc::now(),
        })
        .await;

        assert_eq!(names_on_disk(&host), vec!["keep".to_string()]);
        assert!(host.store.get(&doomed.id).is_none());
        assert!(host.take_needs_reschedule());
        assert!(!host.take_needs_reschedule());
    }

    #[tokio::test]
    async fn test_external_pause_survives_completed_revert() {
        let a = job("a");
        let (_dir, mut host) = host_with_jobs(std::slice::from_ref(&a));
        let execution = JobExecution::hello(&a.id, &a.name, Utc::now(), 700);
        host.apply_event(SchedulerEvent::Executed { execution })
            .await;

        let mut external = JobStore::load(&host.paths.jobs).unwrap();
        external.pause(&a.id).unwrap();
        external.save(&host.paths.jobs).unwrap();

        host.end_completed_window(&a.id).await;
        assert_eq!(host.store.get(&a.id).unwrap().status, JobStatus::Paused);
        let on_disk = JobStore::load(&host.paths.jobs).unwrap();
        assert_eq!(on_disk.get(&a.id).unwrap().status, JobStatus::Paused);
        assert!(host.take_needs_reschedule());
    }

    #[tokio::test]
    async fn test_external_clear_keeps_only_new_execution() {
        let a = job("a");
        let (_dir, mut host) = host_with_jobs(std::slice::from_ref(&a));
        let old = JobExecution::hello(&a.id, &a.name, Utc::now(), 700);
        host.log.write().await.append(old.clone());
        host.apply_event(SchedulerEvent::Executed { execution: old })
            .await;

        let mut external = ExecutionLog::load(&host.paths.executions, 100).unwrap();
        external.clear();
        external.save(&host.paths.executions).unwrap();

        // The engine appends to the shared log before it reports.
        let new = JobExecution::hello(&a.id, &a.name, Utc::now(), 900);
        host.log.write().await.append(new.clone());
        host.apply_event(SchedulerEvent::Executed {
            execution: new.clone(),
        })
        .await;

        let on_disk = ExecutionLog::load(&host.paths.executions, 100).unwrap();
        assert_eq!(on_disk.list(), vec![new]);
        assert!(!host.take_needs_reschedule());
    }
}
