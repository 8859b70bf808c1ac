use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::HumanVerificationChallenge;

/// Which stage of a network request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestCategory {
    Timeout,
    Connection,
    Request,
    Api,
}

impl std::fmt::Display for RequestCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RequestCategory::Timeout => "timeout",
            RequestCategory::Connection => "connection",
            RequestCategory::Request => "request",
            RequestCategory::Api => "api",
        };
        f.write_str(label)
    }
}

/// Errors reported by the external account and session capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("communication with the mail backend failed: {0}")]
    CommunicationFailed(String),

    #[error("account is already being watched: {0}")]
    AlreadyActive(String),

    #[error("operation not valid in the current state: {0}")]
    InvalidState(String),

    #[error("network request failed ({category}): {message}")]
    NetworkRequestFailed {
        category: RequestCategory,
        message: String,
    },

    #[error("account logged out: {0}")]
    LoggedOut(String),

    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("proxy configuration invalid: {0}")]
    ProxyInvalid(String),

    #[error("human verification required")]
    HumanVerificationRequired(HumanVerificationChallenge),

    #[error("human verification data invalid: {0}")]
    HumanVerificationDataInvalid(String),
}

impl ServiceError {
    pub fn network(category: RequestCategory, message: impl Into<String>) -> Self {
        ServiceError::NetworkRequestFailed {
            category,
            message: message.into(),
        }
    }

    /// Transient failures are shown ephemerally and never block the next cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::CommunicationFailed(_) => true,
            ServiceError::NetworkRequestFailed { category, .. } => {
                !matches!(category, RequestCategory::Api)
            }
            ServiceError::AlreadyActive(_)
            | ServiceError::InvalidState(_)
            | ServiceError::LoggedOut(_)
            | ServiceError::ConfigurationInvalid(_)
            | ServiceError::AccountNotFound(_)
            | ServiceError::ProxyInvalid(_)
            | ServiceError::HumanVerificationRequired(_)
            | ServiceError::HumanVerificationDataInvalid(_) => false,
        }
    }

    pub fn is_logged_out(&self) -> bool {
        matches!(self, ServiceError::LoggedOut(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no free notification id left in the {0} range")]
    Exhausted(&'static str),
}
