use shared::{error::ErrorCode, validation::ValidationError};
use thiserror::Error;

/// Why a token refresh did not produce a new pair. Cloned into every caller
/// that was waiting on the same refresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("no refresh token stored")]
    NoSession,
    #[error("refresh rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("refresh response invalid: {0}")]
    Validation(ValidationError),
    #[error("refresh request failed: {0}")]
    Transport(String),
    #[error("failed to persist refreshed tokens: {0}")]
    Store(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Api {
        status: u16,
        code: ErrorCode,
        message: String,
    },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("session expired: {0}")]
    SessionExpired(RefreshError),
    #[error("no active session")]
    NoSession,
    #[error("invalid {context}: {source}")]
    Validation {
        context: &'static str,
        source: ValidationError,
    },
    #[error("token store failure: {source}")]
    TokenStore { source: anyhow::Error },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("push stream failure: {0}")]
    Push(String),
}

impl ClientError {
    pub fn validation(context: &'static str, source: ValidationError) -> Self {
        ClientError::Validation { context, source }
    }

    pub fn token_store(source: anyhow::Error) -> Self {
        ClientError::TokenStore { source }
    }

    /// True when the caller has to send the user back to the login entry point.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            ClientError::SessionExpired(_) | ClientError::NoSession | ClientError::Unauthorized(_)
        )
    }
}

/// Any failed refresh ends the session, including one that never reached
/// the backend.
impl From<RefreshError> for ClientError {
    fn from(value: RefreshError) -> Self {
        ClientError::SessionExpired(value)
    }
}
