//! Background side of the watcher: job runner, poll cadence, poll cycles and
//! mailbox actions, all feeding one notification channel.

pub mod dispatcher;
pub mod executor;
pub mod notify;
pub mod runner;
pub mod scheduler;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use mailwatch_core::{FreeOutcome, NotificationId, NotificationRegistry, SessionProvider};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::info;

pub use dispatcher::{ActionDispatcher, ActionJob, ActionWorker};
pub use executor::{CycleReport, PollExecutor};
pub use notify::{NOTIFICATION_QUEUE_CAPACITY, Notification, Notifier, dismiss_message};
pub use runner::{
    ChainLink, ExistingJobPolicy, JobError, JobHandler, JobOutcome, JobPayload, JobRequest,
    JobRunner, JobTrigger, PollMode, TokioJobRunner,
};
pub use scheduler::{
    CADENCE_JOB, CadenceMode, MIN_RECURRING_INTERVAL_MINUTES, POLL_NOW_JOB, PollScheduler,
    Registration, ScheduleError, ScheduleState, strategy_for,
};

/// Routes job bodies to the poll executor or the action worker.
struct JobDispatch {
    executor: Arc<PollExecutor>,
    worker: ActionWorker,
    scheduler: Weak<PollScheduler>,
}

#[async_trait]
impl JobHandler for JobDispatch {
    async fn run(&self, request: &JobRequest) -> JobOutcome {
        match &request.payload {
            JobPayload::Poll(mode) => self.executor.run(mode, &self.scheduler).await,
            JobPayload::Action(job) => self.worker.perform(job).await,
        }
    }
}

/// The assembled watcher. Created once at process start and torn down with
/// `shutdown`.
pub struct Watcher {
    runner: Arc<TokioJobRunner>,
    registry: Arc<NotificationRegistry>,
    notifier: Notifier,
    scheduler: Arc<PollScheduler>,
    dispatcher: ActionDispatcher,
    executor: Arc<PollExecutor>,
}

impl Watcher {
    pub fn start(
        handle: Handle,
        sessions: Arc<dyn SessionProvider>,
    ) -> (Self, mpsc::Receiver<Notification>) {
        let (notifier, rx) = Notifier::channel();
        let registry = Arc::new(NotificationRegistry::new());
        let runner = Arc::new(TokioJobRunner::new(handle));
        let scheduler = Arc::new(PollScheduler::new(runner.clone()));
        let executor = Arc::new(PollExecutor::new(
            sessions.clone(),
            registry.clone(),
            notifier.clone(),
        ));
        runner.install(Arc::new(JobDispatch {
            executor: executor.clone(),
            worker: ActionWorker::new(sessions, registry.clone(), notifier.clone()),
            scheduler: Arc::downgrade(&scheduler),
        }));
        let dispatcher = ActionDispatcher::new(runner.clone());
        info!("watcher started");

        (
            Self {
                runner,
                registry,
                notifier,
                scheduler,
                dispatcher,
                executor,
            },
            rx,
        )
    }

    pub fn registry(&self) -> &NotificationRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    /// User "poll now": an ad hoc job beside the cadence.
    pub fn poll_now(&self) -> Result<bool, ScheduleError> {
        self.scheduler.register_one_shot()
    }

    /// Run one cycle in the foreground, bypassing the job runner. What the
    /// cycle posts is collected and returned rather than sent to the
    /// watcher's channel, so a receiver nobody reads cannot stall it.
    pub async fn poll_once(&self) -> (CycleReport, Vec<Notification>) {
        let (notifier, mut rx) = Notifier::channel();
        let executor = self.executor.redirect(notifier);
        let cycle = executor.execute();
        tokio::pin!(cycle);
        let mut posted = Vec::new();
        let report = loop {
            tokio::select! {
                report = &mut cycle => break report,
                Some(notification) = rx.recv() => posted.push(notification),
            }
        };
        while let Ok(notification) = rx.try_recv() {
            posted.push(notification);
        }
        (report, posted)
    }

    /// The platform removed a message notification.
    pub async fn dismiss(&self, account: &str, id: NotificationId) -> FreeOutcome {
        dismiss_message(&self.registry, &self.notifier, account, id).await
    }

    /// Forget an account and withdraw everything shown for it.
    pub async fn remove_account(&self, account: &str) -> bool {
        let Some(removed) = self.registry.remove_account(account) else {
            return false;
        };
        for id in removed.message_ids {
            self.notifier
                .post(Notification::Cancel {
                    id,
                    account: account.to_string(),
                })
                .await;
        }
        self.notifier
            .post(Notification::RetireGroup {
                id: removed.identities.group,
                account: account.to_string(),
            })
            .await;
        for id in [removed.identities.status_update, removed.identities.error] {
            self.notifier
                .post(Notification::Cancel {
                    id,
                    account: account.to_string(),
                })
                .await;
        }
        info!(account, "account removed from watcher");
        true
    }

    /// Cancel the cadence and every pending job. Bodies already running are
    /// left to finish.
    pub fn shutdown(&self) {
        self.scheduler.cancel();
        self.runner.shutdown();
    }
}
