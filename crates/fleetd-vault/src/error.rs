//! Error taxonomy for the credential vault, mapped onto the shared
//! [`fleetd_errors::Error`] taxonomy at the crate boundary.

use fleetd_errors::{Error as CoreError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    #[error("storage error: {0}")]
    Storage(#[from] fleetd_storage::StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("credential {0} has expired")]
    Expired(String),

    #[error("credential {0} already exists")]
    AlreadyExists(String),

    #[error("rotation is not supported for credential type {0}")]
    RotationUnsupported(String),

    #[error("vault is not initialized at {0}")]
    NotInitialized(String),

    #[error("master password is incorrect")]
    WrongPassword,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<VaultError> for CoreError {
    fn from(err: VaultError) -> Self {
        let code = match &err {
            VaultError::NotFound(_) => ErrorCode::NotFound,
            VaultError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            VaultError::Expired(_) => ErrorCode::FailedPrecondition,
            VaultError::RotationUnsupported(_) => ErrorCode::Unimplemented,
            VaultError::WrongPassword => ErrorCode::PermissionDenied,
            VaultError::NotInitialized(_) => ErrorCode::FailedPrecondition,
            VaultError::CiphertextTooShort { .. } | VaultError::Decryption(_) => ErrorCode::DataLoss,
            VaultError::Encryption(_) | VaultError::Serialization(_) | VaultError::Io(_) => ErrorCode::Internal,
            VaultError::Storage(_) => ErrorCode::Unavailable,
        };
        CoreError::new(code, err.to_string())
    }
}
