use mailwatch_core::{ActionToken, FreeOutcome, NotificationId, NotificationRegistry};
use tokio::sync::mpsc;
use tracing::debug;

pub const NOTIFICATION_QUEUE_CAPACITY: usize = 256;

/// A request for the notification renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Message {
        id: NotificationId,
        group: NotificationId,
        account: String,
        backend: String,
        sender: String,
        subject: String,
        actions: Vec<ActionToken>,
    },
    GroupSummary {
        id: NotificationId,
        account: String,
        unread: usize,
    },
    RetireGroup {
        id: NotificationId,
        account: String,
    },
    Cancel {
        id: NotificationId,
        account: String,
    },
    AccountError {
        id: NotificationId,
        account: String,
        message: String,
        persistent: bool,
    },
    LoggedOut {
        id: NotificationId,
        account: String,
    },
    ServiceError {
        message: String,
    },
    Transient {
        message: String,
    },
}

impl Notification {
    /// Persistent notifications stay until the user acts on them.
    pub fn is_persistent(&self) -> bool {
        match self {
            Notification::Message { .. }
            | Notification::GroupSummary { .. }
            | Notification::LoggedOut { .. } => true,
            Notification::AccountError { persistent, .. } => *persistent,
            Notification::RetireGroup { .. }
            | Notification::Cancel { .. }
            | Notification::ServiceError { .. }
            | Notification::Transient { .. } => false,
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(NOTIFICATION_QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn post(&self, notification: Notification) {
        if let Err(err) = self.tx.send(notification).await {
            debug!(dropped = ?err.0, "notification receiver closed");
        }
    }
}

/// Group notification changes implied by freeing a message id.
pub fn group_notifications(account: &str, outcome: FreeOutcome) -> Vec<Notification> {
    match outcome {
        FreeOutcome::NotLive => Vec::new(),
        FreeOutcome::GroupUpdated { group, unread } => vec![Notification::GroupSummary {
            id: group,
            account: account.to_string(),
            unread,
        }],
        FreeOutcome::GroupRetired { group } => vec![Notification::RetireGroup {
            id: group,
            account: account.to_string(),
        }],
    }
}

/// Dismissal callback for a message notification the platform already
/// removed. Frees the id and refreshes or retires the group.
pub async fn dismiss_message(
    registry: &NotificationRegistry,
    notifier: &Notifier,
    account: &str,
    id: NotificationId,
) -> FreeOutcome {
    let outcome = registry.free_message_id(account, id);
    for notification in group_notifications(account, outcome) {
        notifier.post(notification).await;
    }
    outcome
}
