//! The scheduling engine.
//!
//! [`Scheduler`] is an actor: it owns the [`TimerRegistry`] and is driven
//! from a single task by [`Scheduler::run`], which interleaves host
//! commands with timer messages. No two of those ever run concurrently, so
//! the registry needs no locking. Hosts talk to it through a cloneable
//! [`SchedulerHandle`] and learn about executions and new fire times from
//! the [`SchedulerEvent`] channel.

use std::ops::RangeInclusive;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::log::ExecutionLog;
use crate::recurrence::Schedule;
use crate::timer::{TimerFired, TimerKind, TimerRegistry, TimerState};
use crate::types::{Job, JobExecution, JobStatus};
use crate::SchedulerError;

/// Range of the simulated execution time, in milliseconds.
const SIMULATED_DURATION_MS: RangeInclusive<u64> = 500..=1500;

/// Execution log shared between the engine and its host.
pub type SharedLog = Arc<RwLock<ExecutionLog>>;

/// Notifications from the engine to its host.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// A job executed and its record was appended to the log.
    Executed { execution: JobExecution },
    /// A job was armed for `next_run`.
    NextRunUpdated {
        job_id: String,
        next_run: DateTime<Utc>,
    },
}

enum Command {
    RescheduleAll {
        jobs: Vec<Job>,
        reply: oneshot::Sender<()>,
    },
    Schedule {
        job: Job,
        reply: oneshot::Sender<()>,
    },
    Cancel {
        job_id: String,
        reply: oneshot::Sender<bool>,
    },
    ExecuteNow {
        job: Job,
        reply: oneshot::Sender<Result<JobExecution, SchedulerError>>,
    },
    ScheduledJobs {
        reply: oneshot::Sender<Vec<String>>,
    },
    TimerState {
        job_id: String,
        reply: oneshot::Sender<Option<TimerState>>,
    },
}

/// Cloneable handle for controlling a running [`Scheduler`].
///
/// Every method waits for the engine to finish the operation, so when
/// `cancel_job` or `reschedule_all` returns the cancelled timers can no
/// longer fire.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| SchedulerError::EngineStopped)?;
        rx.await.map_err(|_| SchedulerError::EngineStopped)
    }

    /// Cancel every timer and arm each active job in `jobs`.
    pub async fn reschedule_all(&self, jobs: Vec<Job>) -> Result<(), SchedulerError> {
        self.request(|reply| Command::RescheduleAll { jobs, reply })
            .await
    }

    /// (Re)arm a single job.
    pub async fn schedule_job(&self, job: Job) -> Result<(), SchedulerError> {
        self.request(|reply| Command::Schedule { job, reply }).await
    }

    /// Cancel the timer for `job_id`. Returns whether one was pending.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool, SchedulerError> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::Cancel { job_id, reply }).await
    }

    /// Execute `job` now, independent of its timer.
    pub async fn execute_now(&self, job: Job) -> Result<JobExecution, SchedulerError> {
        self.request(|reply| Command::ExecuteNow { job, reply })
            .await?
    }

    /// Ids of jobs with a pending timer.
    pub async fn scheduled_jobs(&self) -> Result<Vec<String>, SchedulerError> {
        self.request(|reply| Command::ScheduledJobs { reply }).await
    }

    /// The armed fire time of `job_id`, if any.
    pub async fn next_run(&self, job_id: &str) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        Ok(match self.timer_state(job_id).await? {
            Some(TimerState::Armed { next_run }) => Some(next_run),
            _ => None,
        })
    }

    /// Whether `job_id` is armed, settling, or has no timer.
    pub async fn timer_state(&self, job_id: &str) -> Result<Option<TimerState>, SchedulerError> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::TimerState { job_id, reply })
            .await
    }
}

/// The scheduling engine.
pub struct Scheduler {
    config: SchedulerConfig,
    clock: SharedClock,
    log: SharedLog,
    registry: TimerRegistry,
    fired_rx: mpsc::UnboundedReceiver<TimerFired>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl Scheduler {
    /// Create an engine, a handle to it, and the receiving end of its
    /// event channel.
    pub fn new(
        config: SchedulerConfig,
        clock: SharedClock,
        log: SharedLog,
    ) -> (Self, SchedulerHandle, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let scheduler = Self {
            config,
            clock,
            log,
            registry: TimerRegistry::new(fired_tx),
            fired_rx,
            commands_rx,
            events_tx,
        };
        let handle = SchedulerHandle { tx: commands_tx };
        (scheduler, handle, events_rx)
    }

    /// Run the engine until shutdown is signalled or every handle is
    /// dropped. Pending timers are cancelled on exit.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("scheduler starting");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("scheduler received shutdown signal");
                        break;
                    }
                }

                command = self.commands_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        info!("all scheduler handles dropped");
                        break;
                    }
                },

                Some(fired) = self.fired_rx.recv() => {
                    self.handle_timer(fired).await;
                }
            }
        }

        let cancelled = self.registry.cancel_all();
        info!(cancelled, "scheduler shut down gracefully");
    }

    async fn handle_command(&mut self, command: Command) {
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            Command::RescheduleAll { jobs, reply } => {
                self.reschedule_all(&jobs).await;
                let _ = reply.send(());
            }
            Command::Schedule { job, reply } => {
                self.schedule_job(job).await;
                let _ = reply.send(());
            }
            Command::Cancel { job_id, reply } => {
                let _ = reply.send(self.cancel_job(&job_id));
            }
            Command::ExecuteNow { job, reply } => {
                let _ = reply.send(self.execute_now(&job).await);
            }
            Command::ScheduledJobs { reply } => {
                let _ = reply.send(self.scheduled_jobs());
            }
            Command::TimerState { job_id, reply } => {
                let _ = reply.send(self.registry.state(&job_id));
            }
        }
    }

    /// Cancel any timer for `job` and, if it is active and schedulable,
    /// arm it for its next occurrence.
    ///
    /// A job whose next occurrence is already due executes immediately and
    /// re-arms after the settle delay.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id, name = %job.name))]
    pub async fn schedule_job(&mut self, job: Job) {
        self.registry.cancel(&job.id);

        if job.status != JobStatus::Active {
            debug!(status = %job.status, "job not active, leaving unscheduled");
            return;
        }

        let schedule = match Schedule::parse(&job.schedule_type, &job.schedule_config) {
            Ok(schedule) => schedule,
            Err(e) => {
                let error = SchedulerError::unschedulable(&job.id, e.to_string());
                warn!(error = %error, "leaving job unscheduled");
                return;
            }
        };

        let Some(next_run) = self.config.zone.next_after(&schedule, self.clock.now()) else {
            let error = SchedulerError::unschedulable(&job.id, "no next occurrence");
            warn!(error = %error, "leaving job unscheduled");
            return;
        };

        let delay = (next_run - self.clock.now())
            .to_std()
            .ok()
            .filter(|d| !d.is_zero());

        match delay {
            Some(delay) => {
                self.registry.arm(job.clone(), next_run, delay);
                debug!(%next_run, ?delay, "armed job");
                self.emit(SchedulerEvent::NextRunUpdated {
                    job_id: job.id,
                    next_run,
                });
            }
            None => {
                warn!(%next_run, "job already due, executing immediately");
                self.execute(&job.id, &job.name).await;
                self.registry.settle(job, self.config.settle_delay);
            }
        }
    }

    /// Cancel the timer for `job_id`. Returns whether one was pending.
    pub fn cancel_job(&mut self, job_id: &str) -> bool {
        let cancelled = self.registry.cancel(job_id);
        if cancelled {
            debug!(job_id, "cancelled job timer");
        }
        cancelled
    }

    /// Replace every timer with fresh ones for the active jobs in `jobs`.
    pub async fn reschedule_all(&mut self, jobs: &[Job]) {
        let cancelled = self.registry.cancel_all();

        for job in jobs.iter().filter(|j| j.is_active()) {
            self.schedule_job(job.clone()).await;
        }

        info!(
            jobs = jobs.len(),
            cancelled,
            scheduled = self.registry.len(),
            "rescheduled all jobs"
        );
    }

    /// Record one execution of a job and notify the host.
    pub async fn execute(&mut self, job_id: &str, job_name: &str) -> JobExecution {
        let duration = rand::thread_rng().gen_range(SIMULATED_DURATION_MS);
        let execution = JobExecution::hello(job_id, job_name, self.clock.now(), duration);

        info!(
            job_id,
            name = job_name,
            output = %execution.output,
            duration_ms = duration,
            "executed job"
        );

        self.log.write().await.append(execution.clone());
        self.emit(SchedulerEvent::Executed {
            execution: execution.clone(),
        });
        execution
    }

    /// Execute a job on demand. Paused jobs are refused; the job's timer is
    /// left as it is.
    pub async fn execute_now(&mut self, job: &Job) -> Result<JobExecution, SchedulerError> {
        if job.status == JobStatus::Paused {
            return Err(SchedulerError::JobPaused(job.id.clone()));
        }
        Ok(self.execute(&job.id, &job.name).await)
    }

    /// Ids of jobs holding a timer, armed or settling, in arm order.
    pub fn scheduled_jobs(&self) -> Vec<String> {
        self.registry.job_ids()
    }

    /// The armed fire time of `job_id`, if any.
    pub fn next_run(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.registry.next_run(job_id)
    }

    /// Current timer state of `job_id`.
    pub fn timer_state(&self, job_id: &str) -> Option<TimerState> {
        self.registry.state(job_id)
    }

    async fn handle_timer(&mut self, fired: TimerFired) {
        let Some(job) = self.registry.take_fired(&fired) else {
            debug!(job_id = %fired.job_id, generation = fired.generation, "ignoring stale timer");
            return;
        };

        match fired.kind {
            TimerKind::Fire => {
                self.execute(&job.id, &job.name).await;

                let recurring = Schedule::parse(&job.schedule_type, &job.schedule_config)
                    .is_ok_and(|s| s.is_recurring());
                if recurring {
                    self.registry.settle(job, self.config.settle_delay);
                }
            }
            TimerKind::Settle => self.schedule_job(job).await,
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("no event subscriber");
        }
    }
}
