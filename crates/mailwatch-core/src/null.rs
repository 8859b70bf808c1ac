//! In-process `null` backend with scripted accounts. It speaks no protocol;
//! it exists so the watcher can be driven end to end without a provider.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{Account, AccountStore, Backend, Session, SessionProvider};
use crate::error::{RequestCategory, ServiceError};
use crate::model::{
    AccountIdentity, ActionKind, ActionToken, HumanVerificationChallenge, HumanVerificationKind,
    NewMessage, PollOutcome, ProxyConfig,
};

pub const NULL_BACKEND_NAME: &str = "null";

fn default_messages_per_poll() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullAccountSpec {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub totp: Option<String>,
    #[serde(default)]
    pub human_verification: bool,
    #[serde(default = "default_messages_per_poll")]
    pub messages_per_poll: usize,
}

#[derive(Debug, Default)]
struct NullState {
    active: BTreeMap<String, AccountIdentity>,
    delivered: u64,
    applied: Vec<(String, ActionToken)>,
}

#[derive(Clone)]
pub struct NullBackend {
    specs: Arc<Vec<NullAccountSpec>>,
    state: Arc<Mutex<NullState>>,
}

impl NullBackend {
    pub fn new(specs: Vec<NullAccountSpec>) -> Self {
        Self {
            specs: Arc::new(specs),
            state: Arc::new(Mutex::new(NullState::default())),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, NullState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spec(&self, email: &str) -> Option<&NullAccountSpec> {
        self.specs.iter().find(|spec| spec.email == email)
    }

    pub fn active_accounts(&self) -> Vec<AccountIdentity> {
        self.state().active.values().cloned().collect()
    }

    pub fn remove_account(&self, email: &str) -> Option<AccountIdentity> {
        self.state().active.remove(email)
    }

    /// Actions applied through sessions, oldest first.
    pub fn applied_actions(&self) -> Vec<(String, ActionToken)> {
        self.state().applied.clone()
    }
}

impl Backend for NullBackend {
    fn name(&self) -> &str {
        NULL_BACKEND_NAME
    }

    fn description(&self) -> &str {
        "Scripted backend for local testing"
    }

    fn new_account(&self, email: &str, _proxy: Option<&ProxyConfig>) -> Box<dyn Account> {
        Box::new(NullAccount {
            email: email.to_string(),
            spec: self.spec(email).cloned(),
            awaiting_totp: false,
            logged_in: false,
        })
    }
}

#[async_trait]
impl AccountStore for NullBackend {
    async fn add_account(
        &self,
        identity: AccountIdentity,
        account: Box<dyn Account>,
    ) -> Result<(), ServiceError> {
        if !account.is_logged_in() {
            return Err(ServiceError::InvalidState(format!(
                "{} is not logged in",
                identity.email
            )));
        }
        let mut state = self.state();
        if state.active.contains_key(&identity.email) {
            return Err(ServiceError::AlreadyActive(identity.email));
        }
        state.active.insert(identity.email.clone(), identity);
        Ok(())
    }
}

#[async_trait]
impl SessionProvider for NullBackend {
    async fn open(&self) -> Result<Box<dyn Session>, ServiceError> {
        Ok(Box::new(NullSession {
            backend: self.clone(),
            events: Vec::new(),
        }))
    }
}

struct NullAccount {
    email: String,
    spec: Option<NullAccountSpec>,
    awaiting_totp: bool,
    logged_in: bool,
}

#[async_trait]
impl Account for NullAccount {
    fn email(&self) -> &str {
        &self.email
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    fn is_awaiting_totp(&self) -> bool {
        self.awaiting_totp
    }

    async fn login(
        &mut self,
        password: &str,
        verification_token: Option<&str>,
    ) -> Result<(), ServiceError> {
        let Some(spec) = &self.spec else {
            return Err(ServiceError::AccountNotFound(self.email.clone()));
        };
        if spec.password != password {
            return Err(ServiceError::network(
                RequestCategory::Api,
                "invalid username or password",
            ));
        }
        if spec.human_verification && verification_token.is_none() {
            return Err(ServiceError::HumanVerificationRequired(
                HumanVerificationChallenge {
                    kind: HumanVerificationKind::Captcha,
                    payload: format!("null-captcha:{}", self.email),
                },
            ));
        }
        self.awaiting_totp = spec.totp.is_some();
        self.logged_in = !self.awaiting_totp;
        Ok(())
    }

    async fn submit_totp(&mut self, code: &str) -> Result<(), ServiceError> {
        let expected = self.spec.as_ref().and_then(|spec| spec.totp.as_deref());
        if !self.awaiting_totp || expected.is_none() {
            return Err(ServiceError::InvalidState(
                "no one-time code pending".to_string(),
            ));
        }
        if expected != Some(code) {
            return Err(ServiceError::network(
                RequestCategory::Api,
                "invalid one-time code",
            ));
        }
        self.awaiting_totp = false;
        self.logged_in = true;
        Ok(())
    }
}

struct NullSession {
    backend: NullBackend,
    events: Vec<PollOutcome>,
}

fn null_token(kind: ActionKind, serial: u64) -> ActionToken {
    let tag = match kind {
        ActionKind::MarkRead => "read",
        ActionKind::MoveToTrash => "trash",
        ActionKind::MoveToSpam => "spam",
    };
    ActionToken {
        kind,
        token: format!("null:{}:{}", serial, tag),
    }
}

#[async_trait]
impl Session for NullSession {
    async fn poll(&mut self) -> Result<(), ServiceError> {
        let accounts = self.backend.active_accounts();
        let mut events = Vec::with_capacity(accounts.len());
        for identity in accounts {
            let count = self
                .backend
                .spec(&identity.email)
                .map(|spec| spec.messages_per_poll)
                .unwrap_or(0);
            if count == 0 {
                continue;
            }
            let first = {
                let mut state = self.backend.state();
                let first = state.delivered;
                state.delivered += count as u64;
                first
            };
            let messages = (first..first + count as u64)
                .map(|serial| NewMessage {
                    sender: "null@mailwatch.invalid".to_string(),
                    subject: format!("Null message #{}", serial + 1),
                    move_to_trash: Some(null_token(ActionKind::MoveToTrash, serial)),
                    move_to_spam: Some(null_token(ActionKind::MoveToSpam, serial)),
                    mark_read: Some(null_token(ActionKind::MarkRead, serial)),
                })
                .collect();
            events.push(PollOutcome::NewMail {
                account: identity.email,
                backend: identity.backend,
                messages,
            });
        }
        debug!(events = events.len(), "null backend poll");
        self.events = events;
        Ok(())
    }

    fn last_events(&mut self) -> Vec<PollOutcome> {
        std::mem::take(&mut self.events)
    }

    async fn apply_action(
        &mut self,
        account: &str,
        action: &ActionToken,
    ) -> Result<(), ServiceError> {
        let mut state = self.backend.state();
        if !state.active.contains_key(account) {
            return Err(ServiceError::AccountNotFound(account.to_string()));
        }
        state.applied.push((account.to_string(), action.clone()));
        Ok(())
    }
}
