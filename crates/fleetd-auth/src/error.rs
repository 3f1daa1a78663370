//! Error taxonomy for the authorization core, mapped onto the shared
//! [`fleetd_errors::Error`] taxonomy at the crate boundary.

use fleetd_errors::{Error as CoreError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user {0} not found")]
    UserNotFound(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("token has been revoked")]
    TokenRevoked,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token has expired")]
    TokenExpired,

    #[error("token type {actual} does not match required type {expected}")]
    WrongTokenType { expected: String, actual: String },

    #[error("storage error: {0}")]
    Storage(#[from] fleetd_storage::StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("signing key error: {0}")]
    Key(String),
}

impl From<AuthError> for CoreError {
    fn from(err: AuthError) -> Self {
        let code = match &err {
            AuthError::UserNotFound(_) => ErrorCode::NotFound,
            AuthError::PermissionDenied | AuthError::TokenRevoked => ErrorCode::PermissionDenied,
            AuthError::InvalidToken(_) | AuthError::WrongTokenType { .. } => ErrorCode::Unauthenticated,
            AuthError::TokenExpired => ErrorCode::Unauthenticated,
            AuthError::Storage(_) => ErrorCode::Unavailable,
            AuthError::Serialization(_) | AuthError::Key(_) => ErrorCode::Internal,
        };
        CoreError::new(code, err.to_string())
    }
}
