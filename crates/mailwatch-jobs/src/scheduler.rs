//! Poll cadence registration.
//!
//! Intervals at or above `MIN_RECURRING_INTERVAL_MINUTES` become one periodic
//! job. Shorter intervals become a chain of one-shot jobs: every link carries
//! the interval and re-arms the next link when its poll completes. Both share
//! the `CADENCE_JOB` identity, so registering always replaces whatever was
//! active. Ad hoc polls use `POLL_NOW_JOB` and never touch the cadence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::{debug, info};

use crate::runner::{
    ChainLink, ExistingJobPolicy, JobError, JobPayload, JobRequest, JobRunner, JobTrigger,
    PollMode,
};

pub const MIN_RECURRING_INTERVAL_MINUTES: u32 = 15;
pub const CADENCE_JOB: &str = "poll-cadence";
pub const POLL_NOW_JOB: &str = "poll-now";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceMode {
    Recurring,
    Chained,
}

impl CadenceMode {
    pub fn label(self) -> &'static str {
        match self {
            CadenceMode::Recurring => "recurring",
            CadenceMode::Chained => "chained one-shot",
        }
    }
}

/// The one active cadence registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleState {
    pub interval_minutes: u32,
    pub mode: CadenceMode,
    pub generation: u64,
    pub registered_at: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    KeptExisting,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("poll interval must be at least one minute, got {0}")]
    InvalidInterval(u32),
    #[error(transparent)]
    Job(#[from] JobError),
}

pub fn strategy_for(interval_minutes: u32) -> CadenceMode {
    if interval_minutes >= MIN_RECURRING_INTERVAL_MINUTES {
        CadenceMode::Recurring
    } else {
        CadenceMode::Chained
    }
}

fn minutes(interval_minutes: u32) -> Duration {
    Duration::from_secs(u64::from(interval_minutes) * 60)
}

fn chain_request(link: ChainLink) -> JobRequest {
    JobRequest {
        identity: CADENCE_JOB.to_string(),
        trigger: JobTrigger::Once {
            delay: minutes(link.interval_minutes),
        },
        payload: JobPayload::Poll(PollMode::Chained(link)),
    }
}

pub struct PollScheduler {
    runner: Arc<dyn JobRunner>,
    state: Mutex<Option<ScheduleState>>,
    generation: AtomicU64,
}

impl PollScheduler {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            runner,
            state: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ScheduleState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the cadence. With `cancel_existing == false` an active
    /// registration is left untouched.
    pub fn register(
        &self,
        interval_minutes: u32,
        cancel_existing: bool,
    ) -> Result<Registration, ScheduleError> {
        if interval_minutes == 0 {
            return Err(ScheduleError::InvalidInterval(interval_minutes));
        }
        let mut state = self.lock();
        if let Some(active) = state.as_ref().filter(|_| !cancel_existing) {
            debug!(
                interval_minutes = active.interval_minutes,
                mode = active.mode.label(),
                "cadence already registered, kept"
            );
            return Ok(Registration::KeptExisting);
        }

        let mode = strategy_for(interval_minutes);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        // Old chain links stop re-arming once the generation moves on.
        *state = None;
        self.runner.cancel(CADENCE_JOB);
        let request = match mode {
            CadenceMode::Recurring => JobRequest {
                identity: CADENCE_JOB.to_string(),
                trigger: JobTrigger::Periodic {
                    period: minutes(interval_minutes),
                },
                payload: JobPayload::Poll(PollMode::Recurring),
            },
            CadenceMode::Chained => chain_request(ChainLink {
                interval_minutes,
                generation,
            }),
        };
        self.runner.enqueue(request, ExistingJobPolicy::Replace)?;
        *state = Some(ScheduleState {
            interval_minutes,
            mode,
            generation,
            registered_at: Local::now(),
        });
        info!(interval_minutes, mode = mode.label(), generation, "poll cadence registered");
        Ok(Registration::Registered)
    }

    /// Boot-completed entry point: keep a live cadence, create one otherwise.
    pub fn resume(&self, interval_minutes: u32) -> Result<Registration, ScheduleError> {
        self.register(interval_minutes, false)
    }

    /// Queue an immediate poll outside the cadence. Returns `false` when one
    /// is already pending.
    pub fn register_one_shot(&self) -> Result<bool, ScheduleError> {
        let queued = self.runner.enqueue(
            JobRequest {
                identity: POLL_NOW_JOB.to_string(),
                trigger: JobTrigger::Once {
                    delay: Duration::ZERO,
                },
                payload: JobPayload::Poll(PollMode::AdHoc),
            },
            ExistingJobPolicy::Keep,
        )?;
        debug!(queued, "ad hoc poll requested");
        Ok(queued)
    }

    /// Schedule the next link of a chain. Links from a replaced or cancelled
    /// registration are ignored and `false` is returned.
    pub fn rearm(&self, link: &ChainLink) -> Result<bool, ScheduleError> {
        let state = self.lock();
        let current = state
            .as_ref()
            .filter(|active| active.mode == CadenceMode::Chained)
            .is_some_and(|active| active.generation == link.generation);
        if !current {
            debug!(generation = link.generation, "stale chain link, not re-armed");
            return Ok(false);
        }
        self.runner
            .enqueue(chain_request(link.clone()), ExistingJobPolicy::Replace)?;
        debug!(
            interval_minutes = link.interval_minutes,
            generation = link.generation,
            "chain re-armed"
        );
        Ok(true)
    }

    pub fn cancel(&self) -> Option<ScheduleState> {
        let mut state = self.lock();
        let previous = state.take();
        self.runner.cancel(CADENCE_JOB);
        if let Some(previous) = &previous {
            info!(
                interval_minutes = previous.interval_minutes,
                "poll cadence cancelled"
            );
        }
        previous
    }

    pub fn state(&self) -> Option<ScheduleState> {
        self.lock().clone()
    }
}
