//! Per-job timers and the registry that owns them.
//!
//! Each job moves through `Idle -> Armed -> Settling -> Armed(next)`. Idle
//! jobs have no registry entry; cancellation from any state returns a job
//! to Idle. A timer task only sends a [`TimerFired`] message back to the
//! engine, tagged with the generation it was armed under, so a message
//! that was already in flight when its timer was cancelled is recognized
//! as stale and dropped.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::types::Job;

/// What a timer does when it elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Execute the job.
    Fire,
    /// Compute and arm the following occurrence.
    Settle,
}

/// Message a timer task sends when its delay elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub job_id: String,
    pub generation: u64,
    pub kind: TimerKind,
}

/// Observable state of a job's timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Waiting to fire at `next_run`.
    Armed { next_run: DateTime<Utc> },
    /// Fired; waiting out the settle delay before re-arming.
    Settling,
}

/// A pending tokio timer. Dropping it aborts the task.
#[derive(Debug)]
struct Timer(JoinHandle<()>);

impl Timer {
    fn start(delay: Duration, tx: mpsc::UnboundedSender<TimerFired>, fired: TimerFired) -> Self {
        Self(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The receiver is gone only when the engine has shut down.
            let _ = tx.send(fired);
        }))
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug)]
struct Entry {
    job: Job,
    generation: u64,
    state: TimerState,
    _timer: Timer,
}

/// Owns at most one pending timer per job id.
#[derive(Debug)]
pub struct TimerRegistry {
    entries: HashMap<String, Entry>,
    next_generation: u64,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
}

impl TimerRegistry {
    pub fn new(fired_tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            entries: HashMap::new(),
            next_generation: 0,
            fired_tx,
        }
    }

    /// Arm `job` to fire after `delay`, replacing any existing timer.
    pub fn arm(&mut self, job: Job, next_run: DateTime<Utc>, delay: Duration) -> u64 {
        self.insert(job, TimerState::Armed { next_run }, TimerKind::Fire, delay)
    }

    /// Hold `job` in the settling state for `delay`, replacing any existing
    /// timer.
    pub fn settle(&mut self, job: Job, delay: Duration) -> u64 {
        self.insert(job, TimerState::Settling, TimerKind::Settle, delay)
    }

    fn insert(&mut self, job: Job, state: TimerState, kind: TimerKind, delay: Duration) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        let fired = TimerFired {
            job_id: job.id.clone(),
            generation,
            kind,
        };
        let timer = Timer::start(delay, self.fired_tx.clone(), fired);
        trace!(job_id = %job.id, generation, ?kind, ?delay, "timer started");

        // Replacing an entry drops, and so aborts, the previous timer.
        self.entries.insert(
            job.id.clone(),
            Entry {
                job,
                generation,
                state,
                _timer: timer,
            },
        );
        generation
    }

    /// Cancel the timer for `job_id`. Returns whether one existed.
    pub fn cancel(&mut self, job_id: &str) -> bool {
        self.entries.remove(job_id).is_some()
    }

    /// Cancel every timer. Returns how many were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Claim the entry a fired message belongs to.
    ///
    /// Returns the job snapshot and removes the entry when the message is
    /// current; returns `None` for messages from cancelled or replaced
    /// timers.
    pub fn take_fired(&mut self, fired: &TimerFired) -> Option<Job> {
        let current = self
            .entries
            .get(&fired.job_id)
            .is_some_and(|e| e.generation == fired.generation);
        if !current {
            return None;
        }
        self.entries.remove(&fired.job_id).map(|e| e.job)
    }

    pub fn state(&self, job_id: &str) -> Option<TimerState> {
        self.entries.get(job_id).map(|e| e.state)
    }

    pub fn next_run(&self, job_id: &str) -> Option<DateTime<Utc>> {
        match self.state(job_id)? {
            TimerState::Armed { next_run } => Some(next_run),
            TimerState::Settling => None,
        }
    }

    /// Ids with a pending timer, in the order they were (re)armed.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .map(|(id, e)| (e.generation, id.clone()))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
