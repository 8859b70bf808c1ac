use std::sync::{Arc, Weak};

use mailwatch_core::{
    NewMessage, NotificationRegistry, PollOutcome, RegistryError, ServiceError, SessionProvider,
};
use tracing::{debug, error, info, warn};

use crate::notify::{Notification, Notifier};
use crate::runner::{JobOutcome, PollMode};
use crate::scheduler::PollScheduler;

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub events: usize,
    pub messages: usize,
    pub failed_accounts: Vec<String>,
    /// Set when the session could not be opened or polled.
    pub service_error: Option<ServiceError>,
}

pub struct PollExecutor {
    sessions: Arc<dyn SessionProvider>,
    registry: Arc<NotificationRegistry>,
    notifier: Notifier,
}

impl PollExecutor {
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

    /// Same sessions and registry, posting to `notifier` instead.
    pub fn redirect(&self, notifier: Notifier) -> Self {
        Self {
            sessions: self.sessions.clone(),
            registry: self.registry.clone(),
            notifier,
        }
    }

    /// One poll cycle over every persisted account.
    pub async fn execute(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let mut session = match self.sessions.open().await {
            Ok(session) => session,
            Err(err) => {
                error!(%err, "failed to open session");
                self.report_service_error(&mut report, err).await;
                return report;
            }
        };
        if let Err(err) = session.poll().await {
            warn!(%err, transient = err.is_transient(), "poll failed");
            self.report_service_error(&mut report, err).await;
            return report;
        }

        let events = session.last_events();
        report.events = events.len();
        for event in events {
            let account = event.account().map(str::to_string);
            match self.handle_event(event).await {
                Ok(posted) => report.messages += posted,
                Err(err) => {
                    error!(
                        account = account.as_deref().unwrap_or("-"),
                        %err,
                        "failed to process poll event"
                    );
                    report.failed_accounts.extend(account);
                }
            }
        }
        info!(
            events = report.events,
            messages = report.messages,
            failed = report.failed_accounts.len(),
            "poll cycle finished"
        );
        report
    }

    /// Job body: run a cycle, then re-arm the chain when this was a chained
    /// link. The chain is re-armed even after a service error so the cadence
    /// survives transient failures.
    pub async fn run(&self, mode: &PollMode, scheduler: &Weak<PollScheduler>) -> JobOutcome {
        let report = self.execute().await;
        if let PollMode::Chained(link) = mode {
            match scheduler.upgrade() {
                Some(scheduler) => {
                    if let Err(err) = scheduler.rearm(link) {
                        warn!(%err, "failed to re-arm poll chain");
                        return JobOutcome::Failure(err.to_string());
                    }
                }
                None => debug!("scheduler gone, poll chain ends"),
            }
        }
        match report.service_error {
            Some(err) => JobOutcome::Failure(err.to_string()),
            None => JobOutcome::Success,
        }
    }

    async fn report_service_error(&self, report: &mut CycleReport, err: ServiceError) {
        self.notifier
            .post(Notification::ServiceError {
                message: err.to_string(),
            })
            .await;
        report.service_error = Some(err);
    }

    async fn handle_event(&self, event: PollOutcome) -> Result<usize, RegistryError> {
        match event {
            PollOutcome::NewMail {
                account,
                backend,
                messages,
            } => self.new_mail(&account, &backend, messages).await,
            PollOutcome::Error { account, error } if error.is_logged_out() => {
                self.logged_out(&account).await?;
                Ok(0)
            }
            PollOutcome::Error { account, error } => {
                let id = self.registry.identities_for(&account)?.error;
                self.notifier
                    .post(Notification::AccountError {
                        id,
                        account,
                        message: error.to_string(),
                        persistent: !error.is_transient(),
                    })
                    .await;
                Ok(0)
            }
            PollOutcome::LoggedOut { account } => {
                self.logged_out(&account).await?;
                Ok(0)
            }
            PollOutcome::Offline => {
                debug!("backend offline, skipping cycle");
                Ok(0)
            }
        }
    }

    async fn logged_out(&self, account: &str) -> Result<(), RegistryError> {
        let id = self.registry.identities_for(account)?.status_update;
        warn!(account, "account logged out");
        self.notifier
            .post(Notification::LoggedOut {
                id,
                account: account.to_string(),
            })
            .await;
        Ok(())
    }

    async fn new_mail(
        &self,
        account: &str,
        backend: &str,
        messages: Vec<NewMessage>,
    ) -> Result<usize, RegistryError> {
        if messages.is_empty() {
            return Ok(0);
        }
        let group = self.registry.identities_for(account)?.group;
        let mut posted = 0;
        let mut failure = None;
        for message in messages {
            let id = match self.registry.allocate_message_id(account) {
                Ok(id) => id,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            };
            let actions = message.actions().cloned().collect();
            self.notifier
                .post(Notification::Message {
                    id,
                    group,
                    account: account.to_string(),
                    backend: backend.to_string(),
                    sender: message.sender,
                    subject: message.subject,
                    actions,
                })
                .await;
            posted += 1;
        }
        // Whatever did get posted still needs an accurate group.
        if posted > 0 {
            let unread = self.registry.unread_snapshot(account).count();
            self.notifier
                .post(Notification::GroupSummary {
                    id: group,
                    account: account.to_string(),
                    unread,
                })
                .await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(posted),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mailwatch_core::{
        NewMessage, NotificationRegistry, PollOutcome, RequestCategory, ServiceError,
    };
    use tokio::sync::mpsc;

    use super::PollExecutor;
    use crate::notify::{Notification, Notifier, dismiss_message};
    use crate::runner::{ChainLink, JobOutcome, PollMode};
    use crate::scheduler::{CADENCE_JOB, PollScheduler};
    use crate::testing::{RecordingRunner, ScriptedSessions, message};

    fn executor(
        sessions: ScriptedSessions,
        registry: Arc<NotificationRegistry>,
    ) -> (PollExecutor, mpsc::Receiver<Notification>) {
        let (notifier, rx) = Notifier::channel();
        (PollExecutor::new(Arc::new(sessions), registry, notifier), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Notification>) -> Vec<Notification> {
        let mut posted = Vec::new();
        while let Ok(notification) = rx.try_recv() {
            posted.push(notification);
        }
        posted
    }

    #[tokio::test]
    async fn three_new_messages_make_one_group_of_three() -> anyhow::Result<()> {
        let account = "alice@example.com";
        let registry = Arc::new(NotificationRegistry::new());
        let sessions = ScriptedSessions::polling(vec![PollOutcome::NewMail {
            account: account.to_string(),
            backend: "null".to_string(),
            messages: vec![message("one"), message("two"), message("three")],
        }]);
        let (executor, mut rx) = executor(sessions, registry.clone());

        let report = executor.execute().await;
        assert_eq!(report.messages, 3);
        assert!(report.failed_accounts.is_empty());

        let posted = drain(&mut rx);
        let message_ids: Vec<i32> = posted
            .iter()
            .filter_map(|notification| match notification {
                Notification::Message { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(message_ids.len(), 3);
        let group = registry.identities_for(account)?.group;
        assert_eq!(posted.last(), Some(&Notification::GroupSummary {
            id: group,
            account: account.to_string(),
            unread: 3,
        }));

        let (notifier, mut dismissed) = Notifier::channel();
        dismiss_message(&registry, &notifier, account, message_ids[0]).await;
        dismiss_message(&registry, &notifier, account, message_ids[1]).await;
        assert_eq!(
            drain(&mut dismissed).last(),
            Some(&Notification::GroupSummary {
                id: group,
                account: account.to_string(),
                unread: 1,
            })
        );
        dismiss_message(&registry, &notifier, account, message_ids[2]).await;
        assert_eq!(drain(&mut dismissed), vec![Notification::RetireGroup {
            id: group,
            account: account.to_string(),
        }]);
        Ok(())
    }

    #[tokio::test]
    async fn poll_timeout_posts_one_service_error_only() -> anyhow::Result<()> {
        let registry = Arc::new(NotificationRegistry::new());
        let timeout = ServiceError::network(RequestCategory::Timeout, "read timed out");
        let sessions = ScriptedSessions::failing_poll(timeout.clone());
        let (executor, mut rx) = executor(sessions, registry.clone());

        let report = executor.execute().await;
        assert_eq!(report.service_error, Some(timeout.clone()));
        let posted = drain(&mut rx);
        assert_eq!(posted, vec![Notification::ServiceError {
            message: timeout.to_string(),
        }]);
        assert!(!posted[0].is_persistent());
        assert!(registry.accounts().is_empty());
        assert!(registry.live_message_ids().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn session_open_failure_is_reported_once() {
        let registry = Arc::new(NotificationRegistry::new());
        let unavailable = ServiceError::ConfigurationInvalid("account store missing".to_string());
        let (executor, mut rx) = executor(
            ScriptedSessions::failing_open(unavailable.clone()),
            registry.clone(),
        );

        let report = executor.execute().await;
        assert_eq!(report.events, 0);
        assert_eq!(report.service_error, Some(unavailable));
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(registry.accounts().is_empty());
    }

    #[tokio::test]
    async fn failing_account_does_not_stop_the_others() -> anyhow::Result<()> {
        let registry = Arc::new(NotificationRegistry::with_window(2));
        let sessions = ScriptedSessions::polling(vec![
            PollOutcome::NewMail {
                account: "alice@example.com".to_string(),
                backend: "null".to_string(),
                messages: vec![message("a1"), message("a2"), message("a3")],
            },
            PollOutcome::Error {
                account: "bob@example.com".to_string(),
                error: ServiceError::network(RequestCategory::Connection, "reset"),
            },
            PollOutcome::LoggedOut {
                account: "carol@example.com".to_string(),
            },
            PollOutcome::Offline,
        ]);
        let (executor, mut rx) = executor(sessions, registry.clone());

        let report = executor.execute().await;
        assert_eq!(report.events, 4);
        assert_eq!(report.messages, 0);
        assert_eq!(report.failed_accounts, vec!["alice@example.com".to_string()]);

        let posted = drain(&mut rx);
        let bob = registry.identities_for("bob@example.com")?;
        let carol = registry.identities_for("carol@example.com")?;
        assert!(posted.contains(&Notification::GroupSummary {
            id: registry.identities_for("alice@example.com")?.group,
            account: "alice@example.com".to_string(),
            unread: 2,
        }));
        assert!(posted.contains(&Notification::AccountError {
            id: bob.error,
            account: "bob@example.com".to_string(),
            message: ServiceError::network(RequestCategory::Connection, "reset").to_string(),
            persistent: false,
        }));
        assert!(posted.contains(&Notification::LoggedOut {
            id: carol.status_update,
            account: "carol@example.com".to_string(),
        }));
        Ok(())
    }

    #[tokio::test]
    async fn chained_run_rearms_even_after_service_error() -> anyhow::Result<()> {
        let runner = Arc::new(RecordingRunner::default());
        let scheduler = Arc::new(PollScheduler::new(runner.clone()));
        scheduler.register(5, true)?;
        let generation = scheduler
            .state()
            .map(|state| state.generation)
            .ok_or_else(|| anyhow::anyhow!("no cadence"))?;
        runner.take(CADENCE_JOB);

        let (executor, _rx) = executor(
            ScriptedSessions::failing_poll(ServiceError::CommunicationFailed("eof".to_string())),
            Arc::new(NotificationRegistry::new()),
        );
        let link = ChainLink {
            interval_minutes: 5,
            generation,
        };
        let outcome = executor
            .run(&PollMode::Chained(link), &Arc::downgrade(&scheduler))
            .await;
        assert!(matches!(outcome, JobOutcome::Failure(_)));
        assert!(runner.pending(CADENCE_JOB).is_some());

        runner.take(CADENCE_JOB);
        let outcome = executor
            .run(&PollMode::AdHoc, &Arc::downgrade(&scheduler))
            .await;
        assert!(matches!(outcome, JobOutcome::Failure(_)));
        assert!(runner.pending(CADENCE_JOB).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn logged_out_error_and_empty_mail_are_handled() -> anyhow::Result<()> {
        let registry = Arc::new(NotificationRegistry::new());
        let sessions = ScriptedSessions::polling(vec![
            PollOutcome::NewMail {
                account: "alice@example.com".to_string(),
                backend: "null".to_string(),
                messages: Vec::<NewMessage>::new(),
            },
            PollOutcome::Error {
                account: "bob@example.com".to_string(),
                error: ServiceError::LoggedOut("session expired".to_string()),
            },
        ]);
        let (executor, mut rx) = executor(sessions, registry.clone());

        executor.execute().await;
        let bob = registry.identities_for("bob@example.com")?;
        assert_eq!(drain(&mut rx), vec![Notification::LoggedOut {
            id: bob.status_update,
            account: "bob@example.com".to_string(),
        }]);
        assert!(!registry.unread_snapshot("alice@example.com").group_visible());
        Ok(())
    }
}
