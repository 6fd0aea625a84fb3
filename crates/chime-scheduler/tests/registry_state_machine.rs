//! Stateful property testing for timer reconciliation.
//!
//! Uses proptest-state-machine to interleave reconciliation, single-job
//! scheduling, cancellation and the passage of time, checking that the
//! engine's armed set always equals the set of active, schedulable jobs the
//! host last told it about.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tokio::runtime::Runtime;
use tokio::sync::{RwLock, mpsc, watch};

use chime_scheduler::{
    AnchoredClock, Clock, ExecutionLog, Job, JobStatus, ScheduleConfig, ScheduleType, Scheduler,
    SchedulerConfig, SchedulerEvent, SchedulerHandle, SharedLog, TimerState, Zone,
};

/// Size of the fixed job pool. The last job can never be scheduled.
const POOL_SIZE: usize = 4;
const UNSCHEDULABLE: usize = POOL_SIZE - 1;

/// Operations the host can perform against the engine.
#[derive(Debug, Clone)]
pub enum HostOperation {
    /// Reconcile against a job list; each entry is (pool index, active).
    RescheduleAll { jobs: Vec<(usize, bool)> },
    /// Schedule one job with the given activity.
    ScheduleJob { index: usize, active: bool },
    /// Cancel one job's timer.
    CancelJob { index: usize },
    /// Let time pass so timers fire and re-arm.
    Advance { minutes: u64 },
}

/// Reference model: which pool jobs should hold a timer.
#[derive(Clone, Debug, Default)]
pub struct RegistryModel {
    pub scheduled: BTreeSet<usize>,
}

fn schedulable(index: usize, active: bool) -> bool {
    active && index != UNSCHEDULABLE
}

impl ReferenceStateMachine for RegistryModel {
    type State = Self;
    type Transition = HostOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop_oneof![
            3 => prop::collection::vec((0..POOL_SIZE, any::<bool>()), 0..=POOL_SIZE)
                .prop_map(|mut jobs| {
                    // A host list holds each job once.
                    let mut seen = BTreeSet::new();
                    jobs.retain(|(i, _)| seen.insert(*i));
                    HostOperation::RescheduleAll { jobs }
                }),
            2 => (0..POOL_SIZE, any::<bool>())
                .prop_map(|(index, active)| HostOperation::ScheduleJob { index, active }),
            2 => (0..POOL_SIZE).prop_map(|index| HostOperation::CancelJob { index }),
            2 => (1u64..240).prop_map(|minutes| HostOperation::Advance { minutes }),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            HostOperation::RescheduleAll { jobs } => {
                state.scheduled = jobs
                    .iter()
                    .filter(|(i, active)| schedulable(*i, *active))
                    .map(|(i, _)| *i)
                    .collect();
            }
            HostOperation::ScheduleJob { index, active } => {
                if schedulable(*index, *active) {
                    state.scheduled.insert(*index);
                } else {
                    state.scheduled.remove(index);
                }
            }
            HostOperation::CancelJob { index } => {
                state.scheduled.remove(index);
            }
            // Recurring jobs re-arm after every fire.
            HostOperation::Advance { .. } => {}
        }
        state
    }
}

/// A running engine plus the fixed job pool.
pub struct EngineHarness {
    runtime: Runtime,
    handle: SchedulerHandle,
    clock: Arc<AnchoredClock>,
    pool: Vec<Job>,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
    _log: SharedLog,
    _shutdown_tx: watch::Sender<bool>,
}

impl EngineHarness {
    fn new() -> Self {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .expect("Failed to create tokio runtime");

        let pool = vec![
            Job::new("hourly", "", ScheduleType::Hourly, ScheduleConfig::hourly(15)).unwrap(),
            Job::new("daily", "", ScheduleType::Daily, ScheduleConfig::daily("11:00")).unwrap(),
            Job::new(
                "weekly",
                "",
                ScheduleType::Weekly,
                ScheduleConfig::weekly(3, "12:00"),
            )
            .unwrap(),
            Job::new("broken", "", ScheduleType::Daily, ScheduleConfig::daily("noon")).unwrap(),
        ];

        let log: SharedLog = Arc::new(RwLock::new(ExecutionLog::default()));
        let (handle, clock, events, shutdown_tx) = runtime.block_on(async {
            let start = Utc.with_ymd_and_hms(2026, 10, 21, 10, 0, 0).unwrap();
            let clock = Arc::new(AnchoredClock::new(start));
            let config = SchedulerConfig::default().with_zone(Zone::Utc);
            let (scheduler, handle, events) =
                Scheduler::new(config, clock.clone(), Arc::clone(&log));
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(scheduler.run(shutdown_rx));
            (handle, clock, events, shutdown_tx)
        });

        Self {
            runtime,
            handle,
            clock,
            pool,
            events,
            _log: log,
            _shutdown_tx: shutdown_tx,
        }
    }

    fn job(&self, index: usize, active: bool) -> Job {
        let mut job = self.pool[index].clone();
        job.status = if active {
            JobStatus::Active
        } else {
            JobStatus::Paused
        };
        job
    }

    fn apply_operation(&mut self, op: &HostOperation) {
        match op {
            HostOperation::RescheduleAll { jobs } => {
                let jobs = jobs.iter().map(|(i, a)| self.job(*i, *a)).collect();
                self.runtime
                    .block_on(self.handle.reschedule_all(jobs))
                    .unwrap();
            }
            HostOperation::ScheduleJob { index, active } => {
                let job = self.job(*index, *active);
                self.runtime
                    .block_on(self.handle.schedule_job(job))
                    .unwrap();
            }
            HostOperation::CancelJob { index } => {
                let id = self.pool[*index].id.clone();
                self.runtime.block_on(self.handle.cancel_job(&id)).unwrap();
            }
            HostOperation::Advance { minutes } => {
                let duration = Duration::from_secs(minutes * 60);
                self.runtime
                    .block_on(async move { tokio::time::sleep(duration).await });
            }
        }

        // Keep the unbounded event queue from growing across steps.
        while self.events.try_recv().is_ok() {}
    }
}

impl StateMachineTest for EngineHarness {
    type SystemUnderTest = Self;
    type Reference = RegistryModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        let scheduled = state
            .runtime
            .block_on(state.handle.scheduled_jobs())
            .unwrap();

        // Invariant: one entry per job id
        let unique: BTreeSet<_> = scheduled.iter().cloned().collect();
        assert_eq!(unique.len(), scheduled.len());

        // Invariant: exactly the active, schedulable jobs are armed
        let expected: BTreeSet<_> = ref_state
            .scheduled
            .iter()
            .map(|i| state.pool[*i].id.clone())
            .collect();
        assert_eq!(unique, expected);

        // Invariant: armed fire times are not in the past. A timer due at
        // exactly `now` may not have been processed yet.
        let now = state.clock.now();
        for id in &scheduled {
            let timer = state.runtime.block_on(state.handle.timer_state(id)).unwrap();
            match timer {
                Some(TimerState::Armed { next_run }) => assert!(next_run >= now),
                Some(TimerState::Settling) => {}
                None => panic!("scheduled job {id} has no timer"),
            }
        }
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 5000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn registry_reconciliation_state_machine(sequential 1..30 => EngineHarness);
}
