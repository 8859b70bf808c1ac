use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Platform notification identifier.
pub type NotificationId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Socks5,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.host.trim().is_empty() {
            return Err(ServiceError::ProxyInvalid("empty proxy host".to_string()));
        }
        if self.port == 0 {
            return Err(ServiceError::ProxyInvalid(format!(
                "proxy {} has no port",
                self.host
            )));
        }
        if let Some(auth) = &self.auth {
            if auth.username.is_empty() {
                return Err(ServiceError::ProxyInvalid(
                    "proxy credentials without a username".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Who an account is. The email is the unique key across the watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    pub email: String,
    pub backend: String,
    pub proxy: Option<ProxyConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HumanVerificationKind {
    Captcha,
    Email,
    Sms,
}

/// Payload the UI shows so the user can solve the verification out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanVerificationChallenge {
    pub kind: HumanVerificationKind,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    MarkRead,
    MoveToTrash,
    MoveToSpam,
}

impl ActionKind {
    pub fn label(self) -> &'static str {
        match self {
            ActionKind::MarkRead => "mark read",
            ActionKind::MoveToTrash => "move to trash",
            ActionKind::MoveToSpam => "move to spam",
        }
    }
}

/// Opaque backend token that performs one mailbox action on one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionToken {
    pub kind: ActionKind,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender: String,
    pub subject: String,
    pub move_to_trash: Option<ActionToken>,
    pub move_to_spam: Option<ActionToken>,
    pub mark_read: Option<ActionToken>,
}

impl NewMessage {
    pub fn actions(&self) -> impl Iterator<Item = &ActionToken> {
        [&self.mark_read, &self.move_to_trash, &self.move_to_spam]
            .into_iter()
            .flatten()
    }
}

/// One event produced by a poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    NewMail {
        account: String,
        backend: String,
        messages: Vec<NewMessage>,
    },
    Error {
        account: String,
        error: ServiceError,
    },
    LoggedOut {
        account: String,
    },
    Offline,
}

impl PollOutcome {
    pub fn account(&self) -> Option<&str> {
        match self {
            PollOutcome::NewMail { account, .. }
            | PollOutcome::Error { account, .. }
            | PollOutcome::LoggedOut { account } => Some(account),
            PollOutcome::Offline => None,
        }
    }
}

/// Stable per-account notification ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationIdentitySet {
    pub group: NotificationId,
    pub status_update: NotificationId,
    pub error: NotificationId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadState {
    pub message_ids: BTreeSet<NotificationId>,
}

impl UnreadState {
    pub fn count(&self) -> usize {
        self.message_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message_ids.is_empty()
    }

    /// The group summary is shown exactly while unread messages remain.
    pub fn group_visible(&self) -> bool {
        !self.message_ids.is_empty()
    }
}
