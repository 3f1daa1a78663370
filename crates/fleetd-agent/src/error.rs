//! Error taxonomy for the process supervisor, mapped onto the shared
//! [`fleetd_errors::Error`] taxonomy at the crate boundary (spec §7).

use fleetd_errors::{Error as CoreError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("artifact fetch failed: {0}")]
    Fetch(String),

    #[error("artifact checksum validation failed")]
    ChecksumMismatch,

    #[error("archive entry escapes deployment root: {0}")]
    PathTraversal(String),

    #[error("no executable entry found for app {0}")]
    NoExecutable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("process {0} not found")]
    NotFound(String),

    #[error("process start failed: {0}")]
    StartFailed(String),

    #[error("deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("operation timed out")]
    DeadlineExceeded,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("vault error: {0}")]
    Vault(#[from] fleetd_vault::VaultError),

    #[error("{0}")]
    Core(#[from] CoreError),
}

impl From<AgentError> for CoreError {
    fn from(err: AgentError) -> Self {
        // A `Core` variant already carries a fully-formed taxonomy error —
        // pass it through rather than re-deriving a code from its `Display`.
        let code = match &err {
            AgentError::Core(core) => return core.clone(),
            AgentError::Fetch(_) => ErrorCode::Unavailable,
            AgentError::ChecksumMismatch => ErrorCode::PermissionDenied,
            AgentError::PathTraversal(_) => ErrorCode::InvalidArgument,
            AgentError::NoExecutable(_) => ErrorCode::InvalidArgument,
            AgentError::Io(_) | AgentError::Archive(_) => ErrorCode::Internal,
            AgentError::NotFound(_) => ErrorCode::NotFound,
            AgentError::StartFailed(_) | AgentError::DeploymentFailed(_) => ErrorCode::DeploymentFailed,
            AgentError::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            AgentError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            AgentError::Vault(_) => ErrorCode::Internal,
        };
        CoreError::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_mismatch_maps_to_permission_denied() {
        let core: CoreError = AgentError::ChecksumMismatch.into();
        assert_eq!(core.code, ErrorCode::PermissionDenied);
    }

    #[test]
    fn core_variant_passes_through_unchanged() {
        let inner = CoreError::new(ErrorCode::NotFound, "missing app");
        let core: CoreError = AgentError::Core(inner).into();
        assert_eq!(core.code, ErrorCode::NotFound);
        assert_eq!(core.message, "missing app");
    }
}
