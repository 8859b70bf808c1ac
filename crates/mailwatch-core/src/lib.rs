//! Core of the mail watcher: capability traits consumed from the provider
//! layer, the login challenge controller, and the notification identity
//! registry shared by background jobs and the foreground.

pub mod backend;
pub mod error;
pub mod login;
pub mod model;
pub mod null;
pub mod registry;

pub use backend::{Account, AccountStore, Backend, Session, SessionProvider};
pub use error::{RegistryError, RequestCategory, ServiceError};
pub use login::{AuthenticatedAccount, LoginChallengeController, LoginError, LoginState, LoginStep};
pub use model::{
    AccountIdentity, ActionKind, ActionToken, HumanVerificationChallenge, HumanVerificationKind,
    NewMessage, NotificationId, NotificationIdentitySet, PollOutcome, ProxyAuth, ProxyConfig,
    ProxyProtocol, UnreadState,
};
pub use null::{NULL_BACKEND_NAME, NullAccountSpec, NullBackend};
pub use registry::{FreeOutcome, NotificationRegistry, RemovedAccount};
