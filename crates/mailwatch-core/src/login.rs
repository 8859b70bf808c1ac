//! Login challenge sequence for one in-progress attempt.
//!
//! ```text
//! AwaitingCredentials --login ok--------------> Authenticated
//! AwaitingCredentials --needs one-time code---> AwaitingOneTimeCode
//! AwaitingCredentials --needs verification----> AwaitingHumanVerification
//! AwaitingHumanVerification --token submitted-> AwaitingCredentials (retry, token attached)
//! AwaitingHumanVerification --asked again-----> Failed
//! AwaitingOneTimeCode --code ok---------------> Authenticated
//! AwaitingOneTimeCode --code rejected---------> AwaitingOneTimeCode
//! ```
//!
//! A verification token is attached at most once per attempt. Being asked
//! for verification again after that is a loop and ends the attempt.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{Account, AccountStore, Backend};
use crate::error::ServiceError;
use crate::model::{AccountIdentity, HumanVerificationChallenge, ProxyConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    AwaitingCredentials,
    AwaitingHumanVerification,
    AwaitingOneTimeCode,
    Authenticated,
    Failed,
}

/// Where the caller should navigate after a successful step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginStep {
    Authenticated,
    NeedsOneTimeCode,
    NeedsHumanVerification(HumanVerificationChallenge),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginError {
    #[error("{operation} is not valid while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: LoginState,
    },

    #[error("human verification requested again after a token was attached")]
    VerificationLoop,

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl LoginError {
    /// The attempt cannot continue; only a fresh `submit_credentials` helps.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, LoginError::VerificationLoop)
    }
}

#[derive(Default)]
struct LoginSession {
    email: String,
    password: String,
    verification_token: Option<String>,
    challenge: Option<HumanVerificationChallenge>,
}

/// Result of a completed login, ready for the account store.
pub struct AuthenticatedAccount {
    pub identity: AccountIdentity,
    pub account: Box<dyn Account>,
}

impl std::fmt::Debug for AuthenticatedAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedAccount")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

pub struct LoginChallengeController {
    backend: Arc<dyn Backend>,
    proxy: Option<ProxyConfig>,
    session: LoginSession,
    state: LoginState,
    account: Option<Box<dyn Account>>,
}

impl LoginChallengeController {
    pub fn new(backend: Arc<dyn Backend>, proxy: Option<ProxyConfig>) -> Self {
        Self {
            backend,
            proxy,
            session: LoginSession::default(),
            state: LoginState::AwaitingCredentials,
            account: None,
        }
    }

    pub fn current_state(&self) -> LoginState {
        self.state
    }

    pub fn email(&self) -> &str {
        &self.session.email
    }

    /// Challenge to display while in `AwaitingHumanVerification`.
    pub fn challenge(&self) -> Option<&HumanVerificationChallenge> {
        self.session.challenge.as_ref()
    }

    /// Start a new attempt. Any token attached to a previous attempt is dropped.
    pub async fn submit_credentials(
        &mut self,
        email: &str,
        password: &str,
    ) -> Result<LoginStep, LoginError> {
        if self.state == LoginState::Authenticated {
            return Err(LoginError::InvalidState {
                operation: "submit_credentials",
                state: self.state,
            });
        }
        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }
        self.session = LoginSession {
            email: email.trim().to_string(),
            password: password.to_string(),
            verification_token: None,
            challenge: None,
        };
        self.state = LoginState::AwaitingCredentials;
        self.account = Some(
            self.backend
                .new_account(&self.session.email, self.proxy.as_ref()),
        );
        debug!(
            email = %self.session.email,
            backend = self.backend.name(),
            "login attempt started"
        );
        self.attempt_login().await
    }

    pub async fn submit_verification_token(
        &mut self,
        token: &str,
    ) -> Result<LoginStep, LoginError> {
        if self.session.verification_token.is_some() && self.state != LoginState::Authenticated {
            warn!(email = %self.session.email, "second verification token for the same attempt");
            self.state = LoginState::Failed;
            return Err(LoginError::VerificationLoop);
        }
        if self.state != LoginState::AwaitingHumanVerification {
            return Err(LoginError::InvalidState {
                operation: "submit_verification_token",
                state: self.state,
            });
        }
        if token.trim().is_empty() {
            return Err(ServiceError::HumanVerificationDataInvalid(
                "empty verification token".to_string(),
            )
            .into());
        }
        self.session.verification_token = Some(token.trim().to_string());
        self.session.challenge = None;
        self.state = LoginState::AwaitingCredentials;
        self.attempt_login().await
    }

    pub async fn submit_one_time_code(&mut self, code: &str) -> Result<LoginStep, LoginError> {
        if self.state != LoginState::AwaitingOneTimeCode {
            return Err(LoginError::InvalidState {
                operation: "submit_one_time_code",
                state: self.state,
            });
        }
        let Some(account) = self.account.as_mut() else {
            return Err(LoginError::InvalidState {
                operation: "submit_one_time_code",
                state: self.state,
            });
        };
        match account.submit_totp(code.trim()).await {
            Ok(()) => {
                info!(email = %self.session.email, "login completed with one-time code");
                self.state = LoginState::Authenticated;
                Ok(LoginStep::Authenticated)
            }
            Err(err) => {
                debug!(email = %self.session.email, error = %err, "one-time code rejected");
                Err(err.into())
            }
        }
    }

    /// Consume the controller once authenticated; the attempt's captured
    /// credentials are dropped with it.
    pub fn finish(mut self) -> Result<AuthenticatedAccount, LoginError> {
        let account = match (self.state, self.account.take()) {
            (LoginState::Authenticated, Some(account)) => account,
            (state, _) => {
                return Err(LoginError::InvalidState {
                    operation: "finish",
                    state,
                });
            }
        };
        Ok(AuthenticatedAccount {
            identity: AccountIdentity {
                email: self.session.email.clone(),
                backend: self.backend.name().to_string(),
                proxy: self.proxy.clone(),
            },
            account,
        })
    }

    /// Finish and hand the account to `store`.
    pub async fn register_with(
        self,
        store: &dyn AccountStore,
    ) -> Result<AccountIdentity, LoginError> {
        let done = self.finish()?;
        let identity = done.identity.clone();
        store.add_account(done.identity, done.account).await?;
        Ok(identity)
    }

    async fn attempt_login(&mut self) -> Result<LoginStep, LoginError> {
        let token = self.session.verification_token.clone();
        let Some(account) = self.account.as_mut() else {
            return Err(LoginError::InvalidState {
                operation: "login",
                state: self.state,
            });
        };
        match account.login(&self.session.password, token.as_deref()).await {
            Ok(()) if account.is_awaiting_totp() => {
                self.state = LoginState::AwaitingOneTimeCode;
                Ok(LoginStep::NeedsOneTimeCode)
            }
            Ok(()) => {
                info!(email = %self.session.email, "login completed");
                self.state = LoginState::Authenticated;
                Ok(LoginStep::Authenticated)
            }
            Err(ServiceError::HumanVerificationRequired(challenge)) => {
                if token.is_some() {
                    warn!(
                        email = %self.session.email,
                        "verification requested after token was attached"
                    );
                    self.state = LoginState::Failed;
                    return Err(LoginError::VerificationLoop);
                }
                self.state = LoginState::AwaitingHumanVerification;
                self.session.challenge = Some(challenge.clone());
                Ok(LoginStep::NeedsHumanVerification(challenge))
            }
            Err(err) => {
                debug!(email = %self.session.email, error = %err, "login rejected");
                self.state = LoginState::AwaitingCredentials;
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::{LoginChallengeController, LoginError, LoginState, LoginStep};
    use crate::backend::{Account, Backend};
    use crate::error::{RequestCategory, ServiceError};
    use crate::model::{HumanVerificationChallenge, HumanVerificationKind, ProxyConfig};

    #[derive(Default)]
    struct Script {
        logins: VecDeque<Result<bool, ServiceError>>,
        codes: VecDeque<Result<(), ServiceError>>,
        tokens_seen: Vec<Option<String>>,
    }

    struct ScriptedAccount {
        email: String,
        script: Arc<Mutex<Script>>,
        awaiting_totp: bool,
        logged_in: bool,
    }

    #[async_trait]
    impl Account for ScriptedAccount {
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
            _password: &str,
            verification_token: Option<&str>,
        ) -> Result<(), ServiceError> {
            let mut script = self.script.lock().unwrap();
            script
                .tokens_seen
                .push(verification_token.map(|t| t.to_string()));
            let needs_totp = script.logins.pop_front().unwrap_or(Ok(false))?;
            self.awaiting_totp = needs_totp;
            self.logged_in = !needs_totp;
            Ok(())
        }

        async fn submit_totp(&mut self, _code: &str) -> Result<(), ServiceError> {
            let mut script = self.script.lock().unwrap();
            script.codes.pop_front().unwrap_or(Ok(()))?;
            self.awaiting_totp = false;
            self.logged_in = true;
            Ok(())
        }
    }

    struct ScriptedBackend {
        script: Arc<Mutex<Script>>,
    }

    impl Backend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn description(&self) -> &str {
            "scripted test backend"
        }

        fn new_account(&self, email: &str, _proxy: Option<&ProxyConfig>) -> Box<dyn Account> {
            Box::new(ScriptedAccount {
                email: email.to_string(),
                script: self.script.clone(),
                awaiting_totp: false,
                logged_in: false,
            })
        }
    }

    fn controller(
        logins: Vec<Result<bool, ServiceError>>,
        codes: Vec<Result<(), ServiceError>>,
    ) -> (LoginChallengeController, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script {
            logins: logins.into(),
            codes: codes.into(),
            tokens_seen: Vec::new(),
        }));
        let backend = Arc::new(ScriptedBackend {
            script: script.clone(),
        });
        (LoginChallengeController::new(backend, None), script)
    }

    fn verification() -> ServiceError {
        ServiceError::HumanVerificationRequired(HumanVerificationChallenge {
            kind: HumanVerificationKind::Captcha,
            payload: "<captcha/>".to_string(),
        })
    }

    #[tokio::test]
    async fn plain_login_authenticates_and_finishes() -> anyhow::Result<()> {
        let (mut login, _) = controller(vec![Ok(false)], vec![]);
        let step = login.submit_credentials("alice@example.com", "pw").await?;
        assert_eq!(step, LoginStep::Authenticated);

        let done = login.finish()?;
        assert_eq!(done.identity.email, "alice@example.com");
        assert_eq!(done.identity.backend, "scripted");
        assert!(done.account.is_logged_in());
        Ok(())
    }

    #[tokio::test]
    async fn rejected_code_keeps_waiting_for_another() -> anyhow::Result<()> {
        let rejected = ServiceError::network(RequestCategory::Api, "bad code");
        let (mut login, _) = controller(vec![Ok(true)], vec![Err(rejected.clone()), Ok(())]);

        assert_eq!(
            login.submit_credentials("alice@example.com", "pw").await?,
            LoginStep::NeedsOneTimeCode
        );
        assert_eq!(
            login.submit_one_time_code("000000").await,
            Err(LoginError::Service(rejected))
        );
        assert_eq!(login.current_state(), LoginState::AwaitingOneTimeCode);
        assert_eq!(
            login.submit_one_time_code("123456").await?,
            LoginStep::Authenticated
        );
        Ok(())
    }

    #[tokio::test]
    async fn one_time_code_outside_its_state_is_invalid() {
        let (mut login, _) = controller(vec![], vec![]);
        let err = login.submit_one_time_code("123456").await.unwrap_err();
        assert_eq!(
            err,
            LoginError::InvalidState {
                operation: "submit_one_time_code",
                state: LoginState::AwaitingCredentials,
            }
        );
    }

    #[tokio::test]
    async fn verification_token_without_pending_challenge_is_invalid() -> anyhow::Result<()> {
        let (mut login, script) = controller(vec![Ok(true)], vec![]);
        assert_eq!(
            login.submit_verification_token("tok1").await,
            Err(LoginError::InvalidState {
                operation: "submit_verification_token",
                state: LoginState::AwaitingCredentials,
            })
        );

        assert_eq!(
            login.submit_credentials("carol@example.com", "pw").await?,
            LoginStep::NeedsOneTimeCode
        );
        assert_eq!(login.email(), "carol@example.com");
        assert_eq!(
            login.submit_verification_token("tok1").await,
            Err(LoginError::InvalidState {
                operation: "submit_verification_token",
                state: LoginState::AwaitingOneTimeCode,
            })
        );
        assert_eq!(login.current_state(), LoginState::AwaitingOneTimeCode);
        assert_eq!(script.lock().unwrap().tokens_seen, vec![None]);
        Ok(())
    }

    #[tokio::test]
    async fn verification_token_retries_login_with_captured_credentials() -> anyhow::Result<()> {
        let (mut login, script) = controller(vec![Err(verification()), Ok(false)], vec![]);
        let step = login.submit_credentials("bob@example.com", "pw").await?;
        assert!(matches!(step, LoginStep::NeedsHumanVerification(_)));
        assert_eq!(login.current_state(), LoginState::AwaitingHumanVerification);
        assert!(login.challenge().is_some());

        assert_eq!(
            login.submit_verification_token("tok1").await?,
            LoginStep::Authenticated
        );
        assert_eq!(
            script.lock().unwrap().tokens_seen,
            vec![None, Some("tok1".to_string())]
        );

        // A later attempt is a fresh session and may attach its own token.
        let (mut next, _) = controller(vec![Err(verification()), Ok(false)], vec![]);
        next.submit_credentials("bob@example.com", "pw").await?;
        assert_eq!(
            next.submit_verification_token("tok2").await?,
            LoginStep::Authenticated
        );
        Ok(())
    }

    #[tokio::test]
    async fn second_verification_request_fails_the_attempt() -> anyhow::Result<()> {
        let (mut login, _) = controller(vec![Err(verification()), Err(verification())], vec![]);
        login.submit_credentials("bob@example.com", "pw").await?;

        let err = login.submit_verification_token("tok1").await.unwrap_err();
        assert_eq!(err, LoginError::VerificationLoop);
        assert!(err.is_unrecoverable());
        assert_eq!(login.current_state(), LoginState::Failed);

        let again = login.submit_verification_token("tok2").await.unwrap_err();
        assert_eq!(again, LoginError::VerificationLoop);
        Ok(())
    }

    #[tokio::test]
    async fn token_is_attached_once_even_if_retry_fails_otherwise() -> anyhow::Result<()> {
        let timeout = ServiceError::network(RequestCategory::Timeout, "slow");
        let (mut login, script) = controller(
            vec![Err(verification()), Err(timeout.clone()), Err(verification()), Ok(false)],
            vec![],
        );
        login.submit_credentials("bob@example.com", "pw").await?;
        assert_eq!(
            login.submit_verification_token("tok1").await,
            Err(LoginError::Service(timeout))
        );
        assert_eq!(login.current_state(), LoginState::AwaitingCredentials);

        assert_eq!(
            login.submit_verification_token("tok2").await,
            Err(LoginError::VerificationLoop)
        );
        assert_eq!(script.lock().unwrap().tokens_seen.len(), 2);

        // New credentials start a new attempt with a clean token slot.
        login.submit_credentials("bob@example.com", "pw").await?;
        assert_eq!(
            login.submit_verification_token("tok3").await?,
            LoginStep::Authenticated
        );
        Ok(())
    }

    #[tokio::test]
    async fn finish_before_authentication_is_invalid() {
        let (login, _) = controller(vec![], vec![]);
        assert!(matches!(
            login.finish(),
            Err(LoginError::InvalidState {
                operation: "finish",
                ..
            })
        ));
    }
}
