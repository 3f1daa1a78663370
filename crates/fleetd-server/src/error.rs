//! HTTP error mapping (spec's ambient transport layer).
//!
//! Every handler returns `Result<_, AppError>`; [`AppError`] wraps the
//! shared [`fleetd_errors::Error`] taxonomy and maps each [`ErrorCode`] onto
//! an HTTP status, producing a JSON body with a machine-readable `error`
//! field and a human-readable `message`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleetd_errors::{Error as CoreError, ErrorCode};
use serde::Serialize;

#[derive(Debug)]
pub struct AppError(CoreError);

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl From<fleetd_agent::AgentError> for AppError {
    fn from(err: fleetd_agent::AgentError) -> Self {
        Self(err.into())
    }
}

impl From<fleetd_auth::AuthError> for AppError {
    fn from(err: fleetd_auth::AuthError) -> Self {
        Self(err.into())
    }
}

impl From<fleetd_vault::VaultError> for AppError {
    fn from(err: fleetd_vault::VaultError) -> Self {
        Self(err.into())
    }
}

fn status_for(code: ErrorCode) -> (StatusCode, &'static str) {
    match code {
        ErrorCode::InvalidArgument => (StatusCode::BAD_REQUEST, "invalid_argument"),
        ErrorCode::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        ErrorCode::AlreadyExists => (StatusCode::CONFLICT, "already_exists"),
        ErrorCode::PermissionDenied => (StatusCode::FORBIDDEN, "permission_denied"),
        ErrorCode::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        ErrorCode::FailedPrecondition => (StatusCode::PRECONDITION_FAILED, "failed_precondition"),
        ErrorCode::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
        ErrorCode::DeadlineExceeded => (StatusCode::GATEWAY_TIMEOUT, "deadline_exceeded"),
        ErrorCode::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        ErrorCode::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        ErrorCode::DataLoss => (StatusCode::INTERNAL_SERVER_ERROR, "data_loss"),
        ErrorCode::Unimplemented => (StatusCode::NOT_IMPLEMENTED, "unimplemented"),
        ErrorCode::ResourceExhausted => (StatusCode::TOO_MANY_REQUESTS, "resource_exhausted"),
        ErrorCode::DeploymentFailed => (StatusCode::UNPROCESSABLE_ENTITY, "deployment_failed"),
        ErrorCode::RollbackRequired => (StatusCode::UNPROCESSABLE_ENTITY, "rollback_required"),
        ErrorCode::HealthCheckFailed => (StatusCode::SERVICE_UNAVAILABLE, "health_check_failed"),
        ErrorCode::Incompatible => (StatusCode::CONFLICT, "incompatible"),
        ErrorCode::Unknown => (StatusCode::INTERNAL_SERVER_ERROR, "unknown"),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = status_for(self.0.code);
        let body = ErrorBody { error: error_type, message: self.0.message };
        (status, Json(body)).into_response()
    }
}
