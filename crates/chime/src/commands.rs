//! One-shot commands that edit the data files directly.
//!
//! A running daemon picks up changes to the data files on its next reload
//! tick, or sooner when it is about to write them, and reconciles its
//! timers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use miette::Result;
use tokio::sync::RwLock;
use tracing::{info, warn};

use chime_scheduler::{
    ExecutionLog, Job, JobExecution, JobStatus, JobStore, Schedule, ScheduleConfig, ScheduleType,
    Scheduler, SchedulerConfig, SystemClock, Zone, describe,
};

use crate::daemon::DataPaths;

fn load_jobs(paths: &DataPaths) -> Result<JobStore> {
    JobStore::load(&paths.jobs).map_err(|e| miette::miette!("{}", e))
}

fn save_jobs(paths: &DataPaths, store: &JobStore) -> Result<()> {
    store
        .save(&paths.jobs)
        .map_err(|e| miette::miette!("{}", e))
}

fn load_log(paths: &DataPaths, capacity: usize) -> Result<ExecutionLog> {
    ExecutionLog::load(&paths.executions, capacity).map_err(|e| miette::miette!("{}", e))
}

fn save_log(paths: &DataPaths, log: &ExecutionLog) -> Result<()> {
    log.save(&paths.executions)
        .map_err(|e| miette::miette!("{}", e))
}

fn format_time(t: DateTime<Utc>, zone: Zone) -> String {
    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";
    match zone {
        Zone::Local => t.with_timezone(&chrono::Local).format(FORMAT).to_string(),
        Zone::Utc => format!("{} UTC", t.format(FORMAT)),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Next fire time of an active job, evaluated now.
fn upcoming(job: &Job, zone: Zone) -> Option<DateTime<Utc>> {
    if !job.is_active() {
        return None;
    }
    let schedule = Schedule::parse(&job.schedule_type, &job.schedule_config).ok()?;
    zone.next_after(&schedule, Utc::now())
}

/// Create a job.
pub fn add(
    paths: &DataPaths,
    name: &str,
    description: &str,
    schedule_type: ScheduleType,
    schedule_config: ScheduleConfig,
) -> Result<Job> {
    let job = Job::new(name, description, schedule_type, schedule_config)
        .map_err(|e| miette::miette!("{}", e))?;

    if let Err(e) = Schedule::parse(&job.schedule_type, &job.schedule_config) {
        warn!(error = %e, "schedule is invalid, the job will never run");
    }

    let mut store = load_jobs(paths)?;
    store
        .add(job.clone())
        .map_err(|e| miette::miette!("{}", e))?;
    save_jobs(paths, &store)?;

    println!(
        "Added {} ({}): {}",
        job.name,
        short_id(&job.id),
        describe(&job.schedule_type, &job.schedule_config)
    );
    Ok(job)
}

/// Print every job with its schedule and run history.
pub fn list(paths: &DataPaths, zone: Zone) -> Result<()> {
    let store = load_jobs(paths)?;
    if store.is_empty() {
        println!("No jobs. Create one with `chime add`.");
        return Ok(());
    }

    for job in store.list() {
        let last = job
            .last_run
            .map(|t| format_time(t, zone))
            .unwrap_or_else(|| "never".to_string());
        let next = upcoming(job, zone)
            .map(|t| format_time(t, zone))
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{}  {:<9} {}  [{}]",
            short_id(&job.id),
            job.status,
            job.name,
            describe(&job.schedule_type, &job.schedule_config)
        );
        if !job.description.is_empty() {
            println!("          {}", job.description);
        }
        println!(
            "          runs: {}  last: {}  next: {}",
            job.execution_count, last, next
        );
    }
    Ok(())
}

/// Pause or resume a job.
pub fn set_status(paths: &DataPaths, key: &str, status: JobStatus) -> Result<Job> {
    let mut store = load_jobs(paths)?;
    let id = store
        .find(key)
        .map_err(|e| miette::miette!("{}", e))?
        .id
        .clone();

    let job = match status {
        JobStatus::Paused => store.pause(&id),
        _ => store.resume(&id),
    }
    .map_err(|e| miette::miette!("{}", e))?
    .clone();
    save_jobs(paths, &store)?;

    info!(job_id = %job.id, status = %job.status, "job status changed");
    println!("{} is now {}", job.name, job.status);
    Ok(job)
}

/// Delete a job. Its log entries are kept.
pub fn remove(paths: &DataPaths, key: &str) -> Result<Job> {
    let mut store = load_jobs(paths)?;
    let id = store
        .find(key)
        .map_err(|e| miette::miette!("{}", e))?
        .id
        .clone();
    let job = store.remove(&id).map_err(|e| miette::miette!("{}", e))?;
    save_jobs(paths, &store)?;

    println!("Removed {}", job.name);
    Ok(job)
}

/// Execute a job immediately, outside its schedule.
pub async fn run_now(
    paths: &DataPaths,
    config: &SchedulerConfig,
    key: &str,
) -> Result<JobExecution> {
    let mut store = load_jobs(paths)?;
    let job = store
        .find(key)
        .map_err(|e| miette::miette!("{}", e))?
        .clone();

    let log = Arc::new(RwLock::new(load_log(paths, config.log_capacity)?));
    let (mut scheduler, _handle, _events) =
        Scheduler::new(config.clone(), Arc::new(SystemClock), Arc::clone(&log));
    let execution = scheduler
        .execute_now(&job)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    save_log(paths, &*log.read().await)?;
    store
        .record_execution(&job.id, execution.executed_at)
        .map_err(|e| miette::miette!("{}", e))?;
    // No display window outside the daemon.
    store.revert_completed(&job.id);
    save_jobs(paths, &store)?;

    println!("{} ({}ms)", execution.output, execution.duration);
    Ok(execution)
}

/// Print the newest executions, optionally for one job.
pub fn logs(
    paths: &DataPaths,
    capacity: usize,
    zone: Zone,
    job: Option<&str>,
    limit: usize,
) -> Result<Vec<JobExecution>> {
    let log = load_log(paths, capacity)?;
    let entries = match job {
        Some(key) => {
            // Entries outlive their job, so fall back to the raw id.
            let store = load_jobs(paths)?;
            let id = store
                .find(key)
                .map(|j| j.id.clone())
                .unwrap_or_else(|_| key.to_string());
            log.list_for_job(&id)
        }
        None => log.list(),
    };
    let entries: Vec<_> = entries.into_iter().take(limit).collect();

    if entries.is_empty() {
        println!("No executions recorded.");
    }
    for e in &entries {
        println!(
            "{}  {:<7}  {:>5}ms  {}",
            format_time(e.executed_at, zone),
            e.status,
            e.duration,
            e.output
        );
    }
    Ok(entries)
}

/// Print statistics for one job, or a summary of the whole log.
pub fn stats(paths: &DataPaths, capacity: usize, zone: Zone, job: Option<&str>) -> Result<()> {
    let log = load_log(paths, capacity)?;

    match job {
        Some(key) => {
            let store = load_jobs(paths)?;
            let job = store.find(key).map_err(|e| miette::miette!("{}", e))?;
            let stats = log.stats(&job.id);
            println!("{}", job.name);
            println!(
                "  executions: {} ({} succeeded, {} failed)",
                stats.count, stats.success_count, stats.failed_count
            );
            println!("  average duration: {:.0}ms", stats.average_duration_ms);
            if let Some(last) = stats.last_execution_time {
                println!("  last execution: {}", format_time(last, zone));
            }
        }
        None => {
            let summary = log.summary();
            println!("total executions: {}", summary.total_executions);
            println!("jobs executed: {}", summary.unique_jobs);
            println!("average duration: {:.0}ms", summary.average_duration_ms);
        }
    }
    Ok(())
}

/// Empty the execution log. Returns how many entries were dropped.
pub fn clear_logs(paths: &DataPaths, capacity: usize) -> Result<usize> {
    let mut log = load_log(paths, capacity)?;
    let dropped = log.len();
    log.clear();
    save_log(paths, &log)?;

    println!("Cleared {dropped} execution(s)");
    Ok(dropped)
}

/// Print when a job will next fire.
pub fn next(paths: &DataPaths, zone: Zone, key: &str) -> Result<Option<DateTime<Utc>>> {
    let store = load_jobs(paths)?;
    let job = store.find(key).map_err(|e| miette::miette!("{}", e))?;

    if !job.is_active() {
        println!("{} is {}", job.name, job.status);
        return Ok(None);
    }
    match Schedule::parse(&job.schedule_type, &job.schedule_config) {
        Ok(schedule) => {
            let next = zone.next_after(&schedule, Utc::now());
            match next {
                Some(t) => println!("{}: {} ({})", job.name, format_time(t, zone), schedule),
                None => println!("{}: no upcoming occurrence", job.name),
            }
            Ok(next)
        }
        Err(e) => {
            println!("{}: never ({})", job.name, e);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn paths() -> (tempfile::TempDir, DataPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        (dir, paths)
    }

    fn add_hourly(paths: &DataPaths, name: &str) -> Job {
        add(paths, name, "", ScheduleType::Hourly, ScheduleConfig::hourly(15)).unwrap()
    }

    #[test]
    fn test_add_persists_job() {
        let (_dir, paths) = paths();
        let job = add_hourly(&paths, "  Greeter ");

        let store = JobStore::load(&paths.jobs).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.list()[0].name, "Greeter");
        assert_eq!(store.list()[0].id, job.id);
        assert!(add(&paths, " ", "", ScheduleType::Hourly, ScheduleConfig::hourly(0)).is_err());
    }

    #[test]
    fn test_pause_resume_remove_by_prefix() {
        let (_dir, paths) = paths();
        let job = add_hourly(&paths, "a");
        let prefix = short_id(&job.id);

        assert_eq!(
            set_status(&paths, prefix, JobStatus::Paused).unwrap().status,
            JobStatus::Paused
        );
        assert_eq!(next(&paths, Zone::Utc, prefix).unwrap(), None);
        assert_eq!(
            set_status(&paths, prefix, JobStatus::Active).unwrap().status,
            JobStatus::Active
        );
        assert!(next(&paths, Zone::Utc, prefix).unwrap().is_some());

        remove(&paths, prefix).unwrap();
        assert!(JobStore::load(&paths.jobs).unwrap().is_empty());
        assert!(remove(&paths, prefix).is_err());
    }

    #[tokio::test]
    async fn test_run_now_logs_and_counts() {
        let (_dir, paths) = paths();
        let job = add_hourly(&paths, "manual");
        let config = SchedulerConfig::default();

        let execution = run_now(&paths, &config, &job.id).await.unwrap();
        assert_eq!(execution.output, "Hello World from manual!");
        assert!((500..=1500).contains(&execution.duration));

        let stored = JobStore::load(&paths.jobs).unwrap();
        let stored = stored.get(&job.id).unwrap();
        assert_eq!(stored.execution_count, 1);
        assert_eq!(stored.status, JobStatus::Active);

        let entries = logs(&paths, 100, Zone::Utc, Some(&job.id), 10).unwrap();
        assert_eq!(entries, vec![execution]);
    }

    #[tokio::test]
    async fn test_run_now_refuses_paused_job() {
        let (_dir, paths) = paths();
        let job = add_hourly(&paths, "paused");
        set_status(&paths, &job.id, JobStatus::Paused).unwrap();

        assert!(
            run_now(&paths, &SchedulerConfig::default(), &job.id)
                .await
                .is_err()
        );
        assert!(ExecutionLog::load(&paths.executions, 100).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_logs_survive_job_removal_until_cleared() {
        let (_dir, paths) = paths();
        let job = add_hourly(&paths, "temp");
        let config = SchedulerConfig::default();
        run_now(&paths, &config, &job.id).await.unwrap();
        run_now(&paths, &config, &job.id).await.unwrap();

        remove(&paths, &job.id).unwrap();
        let remaining = logs(&paths, 100, Zone::Utc, Some(&job.id), 10).unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(logs(&paths, 100, Zone::Utc, None, 1).unwrap().len(), 1);

        assert_eq!(clear_logs(&paths, 100).unwrap(), 2);
        assert!(logs(&paths, 100, Zone::Utc, None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_next_for_invalid_schedule() {
        let (_dir, paths) = paths();
        let job = add(
            &paths,
            "broken",
            "",
            ScheduleType::Daily,
            ScheduleConfig::daily("25:00"),
        )
        .unwrap();
        assert_eq!(next(&paths, Zone::Utc, &job.id).unwrap(), None);
    }
}
