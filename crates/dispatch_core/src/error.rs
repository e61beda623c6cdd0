use std::time::Duration;

use shared::{
    domain::{ChatId, SessionId},
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication failure for session {session_id}: {message}")]
    AuthFailure {
        session_id: SessionId,
        message: String,
    },
    #[error("client initialization timed out after {}s", .after.as_secs())]
    InitializationTimeout { after: Duration },
    #[error("client initialization failed: {0:#}")]
    Initialization(#[source] anyhow::Error),
    #[error("session {0} is already authenticated; no pairing token needed")]
    AlreadyPaired(SessionId),
    #[error("session {0} is busy with another operation")]
    SessionBusy(SessionId),
    #[error("the provided ID {0} does not belong to a group")]
    NotAGroup(ChatId),
    #[error("could not fetch participants of group {0}")]
    EmptyGroup(ChatId),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("session store unavailable: {0:#}")]
    Store(#[source] anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthFailure { .. } => ErrorCode::Unauthorized,
            Self::InitializationTimeout { .. } => ErrorCode::Timeout,
            Self::Initialization(_) | Self::Store(_) => ErrorCode::Unavailable,
            Self::AlreadyPaired(_) | Self::SessionBusy(_) => ErrorCode::Conflict,
            Self::NotAGroup(_) | Self::EmptyGroup(_) | Self::InvalidRequest(_) => {
                ErrorCode::Validation
            }
            Self::Other(_) => ErrorCode::Internal,
        }
    }

    /// Connection-level failures abort the whole operation; everything else
    /// is a business or request problem.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::AuthFailure { .. }
                | Self::InitializationTimeout { .. }
                | Self::Initialization(_)
                | Self::Store(_)
        )
    }
}

impl From<&SessionError> for ApiError {
    fn from(value: &SessionError) -> Self {
        ApiError::new(value.code(), value.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(value: SessionError) -> Self {
        ApiError::from(&value)
    }
}
