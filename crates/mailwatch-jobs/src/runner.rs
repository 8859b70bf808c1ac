//! Background job runner. `JobRunner` is the seam to whatever executes jobs
//! on the host; `TokioJobRunner` is the in-process implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::ActionJob;

/// What to do when a job with the same identity is already pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingJobPolicy {
    Replace,
    Keep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTrigger {
    Periodic { period: Duration },
    Once { delay: Duration },
}

/// Payload of a chained one-shot poll; carried unchanged from link to link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub interval_minutes: u32,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollMode {
    Recurring,
    Chained(ChainLink),
    AdHoc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    Poll(PollMode),
    Action(ActionJob),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub identity: String,
    pub trigger: JobTrigger,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("job runner has no handler installed")]
    NoHandler,
    #[error("job runner is shut down")]
    ShutDown,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, request: &JobRequest) -> JobOutcome;
}

pub trait JobRunner: Send + Sync {
    /// Returns `false` when `Keep` left an already pending job in place.
    fn enqueue(&self, request: JobRequest, policy: ExistingJobPolicy) -> Result<bool, JobError>;

    /// Drop the pending job with `identity`. A body already running is not
    /// interrupted.
    fn cancel(&self, identity: &str) -> bool;

    fn is_pending(&self, identity: &str) -> bool;
}

struct PendingJob {
    seq: u64,
    token: CancellationToken,
}

type PendingJobs = Arc<Mutex<HashMap<String, PendingJob>>>;

fn lock_pending(pending: &PendingJobs) -> MutexGuard<'_, HashMap<String, PendingJob>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn release(pending: &PendingJobs, identity: &str, seq: u64) {
    let mut pending = lock_pending(pending);
    if pending.get(identity).is_some_and(|job| job.seq == seq) {
        pending.remove(identity);
    }
}

async fn run_body(handler: &dyn JobHandler, request: &JobRequest) {
    debug!(identity = %request.identity, "job started");
    match handler.run(request).await {
        JobOutcome::Success => debug!(identity = %request.identity, "job finished"),
        JobOutcome::Failure(reason) => {
            warn!(identity = %request.identity, %reason, "job failed, not retried")
        }
    }
}

/// Runs jobs as tokio tasks. Poll jobs sharing an identity share a lane, so
/// at most one body per identity executes at a time even across replacement.
pub struct TokioJobRunner {
    handle: Handle,
    handler: OnceLock<Arc<dyn JobHandler>>,
    pending: PendingJobs,
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    shutdown: CancellationToken,
    next_seq: AtomicU64,
}

impl TokioJobRunner {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            handler: OnceLock::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            lanes: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Install the handler every job body is dispatched to. Only the first
    /// call has an effect.
    pub fn install(&self, handler: Arc<dyn JobHandler>) -> bool {
        self.handler.set(handler).is_ok()
    }

    /// Cancel everything pending and refuse new jobs. Running bodies finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        lock_pending(&self.pending).clear();
        info!("job runner shut down");
    }

    fn lane(&self, request: &JobRequest) -> Option<Arc<tokio::sync::Mutex<()>>> {
        if !matches!(request.payload, JobPayload::Poll(_)) {
            return None;
        }
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        Some(lanes.entry(request.identity.clone()).or_default().clone())
    }
}

impl JobRunner for TokioJobRunner {
    fn enqueue(&self, request: JobRequest, policy: ExistingJobPolicy) -> Result<bool, JobError> {
        if self.shutdown.is_cancelled() {
            return Err(JobError::ShutDown);
        }
        let handler = self.handler.get().cloned().ok_or(JobError::NoHandler)?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        {
            let mut pending = lock_pending(&self.pending);
            if let Some(existing) = pending.get(&request.identity) {
                match policy {
                    ExistingJobPolicy::Keep => {
                        debug!(identity = %request.identity, "job already pending, kept");
                        return Ok(false);
                    }
                    ExistingJobPolicy::Replace => existing.token.cancel(),
                }
            }
            pending.insert(
                request.identity.clone(),
                PendingJob {
                    seq,
                    token: token.clone(),
                },
            );
        }

        let lane = self.lane(&request);
        let pending = self.pending.clone();
        debug!(identity = %request.identity, trigger = ?request.trigger, "job enqueued");
        match request.trigger.clone() {
            JobTrigger::Once { delay } => {
                self.handle.spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    let _guard = match &lane {
                        Some(lane) => Some(lane.lock().await),
                        None => None,
                    };
                    if token.is_cancelled() {
                        return;
                    }
                    // Released before the body runs so the body may enqueue
                    // its own successor under the same identity.
                    release(&pending, &request.identity, seq);
                    run_body(handler.as_ref(), &request).await;
                });
            }
            JobTrigger::Periodic { period } => {
                self.handle.spawn(async move {
                    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = ticker.tick() => {}
                        }
                        let _guard = match &lane {
                            Some(lane) => Some(lane.lock().await),
                            None => None,
                        };
                        if token.is_cancelled() {
                            break;
                        }
                        run_body(handler.as_ref(), &request).await;
                    }
                });
            }
        }
        Ok(true)
    }

    fn cancel(&self, identity: &str) -> bool {
        match lock_pending(&self.pending).remove(identity) {
            Some(job) => {
                job.token.cancel();
                debug!(identity, "job cancelled");
                true
            }
            None => false,
        }
    }

    fn is_pending(&self, identity: &str) -> bool {
        lock_pending(&self.pending).contains_key(identity)
    }
}
