//! Deferred mailbox actions (mark read, trash, spam) triggered from message
//! notifications. Jobs are best effort: a failure becomes a transient
//! message and is never retried here.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mailwatch_core::{
    ActionToken, NotificationId, NotificationRegistry, ServiceError, SessionProvider,
};
use tracing::{debug, info, warn};

use crate::notify::{Notification, Notifier, dismiss_message};
use crate::runner::{
    ExistingJobPolicy, JobError, JobOutcome, JobPayload, JobRequest, JobRunner, JobTrigger,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionJob {
    pub account: String,
    pub action: ActionToken,
    /// Message notification to free once the action went through.
    pub notification_id: Option<NotificationId>,
    pub success_label: String,
    pub failure_label: String,
}

pub struct ActionDispatcher {
    runner: Arc<dyn JobRunner>,
    next_seq: AtomicU64,
}

impl ActionDispatcher {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            runner,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Enqueue an action job and return its job identity.
    pub fn queue(
        &self,
        account: &str,
        action: ActionToken,
        notification_id: Option<NotificationId>,
        success_label: impl Into<String>,
        failure_label: impl Into<String>,
    ) -> Result<String, JobError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let identity = format!("action-{}-{}", account, seq);
        let kind = action.kind;
        self.runner.enqueue(
            JobRequest {
                identity: identity.clone(),
                trigger: JobTrigger::Once {
                    delay: Duration::ZERO,
                },
                payload: JobPayload::Action(ActionJob {
                    account: account.to_string(),
                    action,
                    notification_id,
                    success_label: success_label.into(),
                    failure_label: failure_label.into(),
                }),
            },
            ExistingJobPolicy::Replace,
        )?;
        debug!(account, action = kind.label(), %identity, "action queued");
        Ok(identity)
    }
}

/// Executes queued action jobs against a fresh session.
pub struct ActionWorker {
    sessions: Arc<dyn SessionProvider>,
    registry: Arc<NotificationRegistry>,
    notifier: Notifier,
}

impl ActionWorker {
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        registry: Arc<NotificationRegistry>,
        notifier: Notifier,
    ) -> Self {
        Self {
            sessions,
            registry,
            notifier,
        }
    }

    async fn apply(&self, job: &ActionJob) -> Result<(), ServiceError> {
        let mut session = self.sessions.open().await?;
        session.apply_action(&job.account, &job.action).await
    }

    pub async fn perform(&self, job: &ActionJob) -> JobOutcome {
        match self.apply(job).await {
            Ok(()) => {
                if let Some(id) = job.notification_id {
                    self.notifier
                        .post(Notification::Cancel {
                            id,
                            account: job.account.clone(),
                        })
                        .await;
                    dismiss_message(&self.registry, &self.notifier, &job.account, id).await;
                }
                info!(
                    account = %job.account,
                    action = job.action.kind.label(),
                    "action applied"
                );
                self.notifier
                    .post(Notification::Transient {
                        message: job.success_label.clone(),
                    })
                    .await;
                JobOutcome::Success
            }
            Err(err) => {
                warn!(
                    account = %job.account,
                    action = job.action.kind.label(),
                    %err,
                    "action failed"
                );
                self.notifier
                    .post(Notification::Transient {
                        message: format!("{}: {}", job.failure_label, err),
                    })
                    .await;
                JobOutcome::Failure(err.to_string())
            }
        }
    }
}
