//! Capabilities provided by the mail-provider layer. This crate only
//! consumes them; concrete protocols live elsewhere.

use async_trait::async_trait;

use crate::error::ServiceError;
use crate::model::{AccountIdentity, ActionToken, PollOutcome, ProxyConfig};

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// Build the not-yet-authenticated account a login attempt drives.
    fn new_account(&self, email: &str, proxy: Option<&ProxyConfig>) -> Box<dyn Account>;
}

#[async_trait]
pub trait Account: Send + Sync {
    fn email(&self) -> &str;
    fn is_logged_in(&self) -> bool;
    fn is_awaiting_totp(&self) -> bool;

    async fn login(
        &mut self,
        password: &str,
        verification_token: Option<&str>,
    ) -> Result<(), ServiceError>;

    async fn submit_totp(&mut self, code: &str) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait Session: Send {
    async fn poll(&mut self) -> Result<(), ServiceError>;

    /// Events of the most recent `poll`, in the order they were produced.
    fn last_events(&mut self) -> Vec<PollOutcome>;

    async fn apply_action(
        &mut self,
        account: &str,
        action: &ActionToken,
    ) -> Result<(), ServiceError>;
}

/// Opens sessions over the persisted accounts.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Session>, ServiceError>;
}

/// Destination for freshly authenticated accounts.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fails with `AlreadyActive` when the email is already watched.
    async fn add_account(
        &self,
        identity: AccountIdentity,
        account: Box<dyn Account>,
    ) -> Result<(), ServiceError>;
}
