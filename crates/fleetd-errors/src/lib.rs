//! Typed error taxonomy shared by every `fleetd` component.
//!
//! Every fallible operation in the agent — the process supervisor, the
//! resilience primitives, the credential vault, the authorization core —
//! returns (or wraps into) a single [`Error`] value. A closed [`ErrorCode`]
//! set lets callers branch on *kind* of failure without downcasting through
//! half a dozen per-subsystem error enums.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of error codes every `fleetd` component reports through.
///
/// Closed means exhaustive matches are expected to stay exhaustive — adding a
/// variant here is a breaking change for every consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    RateLimited,
    FailedPrecondition,
    Unauthenticated,
    DeadlineExceeded,
    Unavailable,
    Internal,
    DataLoss,
    Unimplemented,
    ResourceExhausted,
    DeploymentFailed,
    RollbackRequired,
    HealthCheckFailed,
    Incompatible,
    Unknown,
}

impl ErrorCode {
    /// Whether this code is retryable by default, absent an explicit override.
    ///
    /// Mirrors spec §4.A: timeout/unavailable/rate-limited/resource-exhausted/
    /// internal are treated as transient; everything else is assumed to need
    /// caller intervention (bad input, already-applied state, denied access).
    #[must_use]
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            Self::DeadlineExceeded | Self::Unavailable | Self::RateLimited | Self::ResourceExhausted | Self::Internal
        )
    }

    /// Default [`Severity`] for this code, used when a caller doesn't pick one.
    #[must_use]
    pub fn default_severity(self) -> Severity {
        match self {
            Self::InvalidArgument
            | Self::NotFound
            | Self::AlreadyExists
            | Self::FailedPrecondition
            | Self::Unimplemented
            | Self::Incompatible => Severity::Warning,
            Self::PermissionDenied
            | Self::Unauthenticated
            | Self::RateLimited
            | Self::DeadlineExceeded
            | Self::Unavailable
            | Self::ResourceExhausted
            | Self::HealthCheckFailed => Severity::Error,
            Self::Internal | Self::DataLoss | Self::DeploymentFailed | Self::RollbackRequired => Severity::Critical,
            Self::Unknown => Severity::Error,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidArgument => "invalid-argument",
            Self::NotFound => "not-found",
            Self::AlreadyExists => "already-exists",
            Self::PermissionDenied => "permission-denied",
            Self::RateLimited => "rate-limited",
            Self::FailedPrecondition => "failed-precondition",
            Self::Unauthenticated => "unauthenticated",
            Self::DeadlineExceeded => "deadline-exceeded",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
            Self::DataLoss => "data-loss",
            Self::Unimplemented => "unimplemented",
            Self::ResourceExhausted => "resource-exhausted",
            Self::DeploymentFailed => "deployment-failed",
            Self::RollbackRequired => "rollback-required",
            Self::HealthCheckFailed => "health-check-failed",
            Self::Incompatible => "incompatible",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Severity ordering, debug being least severe and fatal the most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// A single typed error value, carrying enough context to diagnose a failure
/// without a debugger and enough structure to drive automated retry/alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
    pub severity: Severity,
    pub cause: Option<Box<Error>>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub stack: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
}

impl Error {
    /// Construct a new error, deriving severity and retryability from `code`.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.default_retryable();
        Self {
            code,
            message: message.into(),
            details: None,
            severity: code.default_severity(),
            cause: None,
            metadata: HashMap::new(),
            stack: None,
            timestamp: Utc::now(),
            request_id: None,
            retryable,
            retry_after: if retryable { Some(Duration::ZERO) } else { None },
        }
    }

    /// Wrap an existing error under a new code/message, preserving the cause
    /// chain so the root cause stays discoverable via [`Error::root_cause`].
    ///
    /// Inherits `request_id` and merges `metadata` from `inner` when the new
    /// error doesn't already set them — wrapping must never *lose* context.
    #[must_use]
    pub fn wrap(inner: Error, code: ErrorCode, message: impl Into<String>) -> Self {
        let mut wrapped = Self::new(code, message);
        wrapped.request_id = inner.request_id.clone();
        wrapped.metadata = inner.metadata.clone();
        wrapped.cause = Some(Box::new(inner));
        wrapped
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        if retryable && self.retry_after.is_none() {
            self.retry_after = Some(Duration::ZERO);
        }
        if !retryable {
            self.retry_after = None;
        }
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retryable = true;
        self.retry_after = Some(retry_after);
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Walk the cause chain and return the innermost error.
    #[must_use]
    pub fn root_cause(&self) -> &Error {
        let mut current = self;
        while let Some(cause) = &current.cause {
            current = cause;
        }
        current
    }

    /// True if `self` or any error in its cause chain has `code`.
    #[must_use]
    pub fn is(&self, code: ErrorCode) -> bool {
        let mut current = Some(self);
        while let Some(err) = current {
            if err.code == code {
                return true;
            }
            current = err.cause.as_deref();
        }
        false
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// `code_of(err)` from spec §4.A — returns [`ErrorCode::Unknown`] for any
/// error that isn't (or doesn't wrap) a core [`Error`].
#[must_use]
pub fn code_of(err: &(dyn std::error::Error + 'static)) -> ErrorCode {
    err.downcast_ref::<Error>().map_or(ErrorCode::Unknown, |e| e.code)
}

/// `is(err, target)` from spec §4.A for arbitrary `dyn Error` values — unlike
/// [`Error::is`], this first downcasts, so it is safe to call on boxed errors
/// that didn't originate as [`Error`].
#[must_use]
pub fn is(err: &(dyn std::error::Error + 'static), target: ErrorCode) -> bool {
    err.downcast_ref::<Error>().is_some_and(|e| e.is(target))
}

/// Convert a recovered panic payload (as returned by `std::panic::catch_unwind`)
/// into an [`Error`] with `code = internal`, `severity = fatal`.
///
/// Used by the managed-process log pumps and the panic handler around
/// subagent/task bodies so a panic degrades into a reportable error instead of
/// silently killing a supervisor task (spec §4.G: "a panic inside a pump
/// recovers, logs at error, and posts an internal error to the error
/// channel").
#[must_use]
pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Error {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_owned()
    };

    Error::new(ErrorCode::Internal, format!("recovered panic: {message}"))
        .with_severity(Severity::Fatal)
        .with_retryable(false)
        .with_stack(std::backtrace::Backtrace::force_capture().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_derives_severity_and_retryability() {
        let err = Error::new(ErrorCode::Unavailable, "db down");
        assert!(err.retryable);
        assert_eq!(err.retry_after, Some(Duration::ZERO));
        assert_eq!(err.severity, Severity::Error);
    }

    #[test]
    fn not_retryable_codes_carry_no_retry_after() {
        let err = Error::new(ErrorCode::InvalidArgument, "bad");
        assert!(!err.retryable);
        assert!(err.retry_after.is_none());
    }

    #[test]
    fn wrap_preserves_chain_and_inherits_request_id() {
        let root = Error::new(ErrorCode::Unavailable, "connection refused").with_request_id("req-1");
        let wrapped = Error::wrap(root, ErrorCode::ResourceExhausted, "operation failed after 3 attempts");
        assert_eq!(wrapped.request_id.as_deref(), Some("req-1"));
        assert_eq!(wrapped.root_cause().code, ErrorCode::Unavailable);
    }

    #[test]
    fn wrap_does_not_override_explicit_request_id() {
        let root = Error::new(ErrorCode::Unavailable, "x").with_request_id("inner");
        let mut wrapped = Error::wrap(root, ErrorCode::Internal, "y");
        wrapped = wrapped.with_request_id("outer");
        assert_eq!(wrapped.request_id.as_deref(), Some("outer"));
    }

    #[test]
    fn is_matches_anywhere_in_chain() {
        let root = Error::new(ErrorCode::Unavailable, "conn reset");
        let wrapped = Error::wrap(root, ErrorCode::ResourceExhausted, "gave up");
        assert!(wrapped.is(ErrorCode::ResourceExhausted));
        assert!(wrapped.is(ErrorCode::Unavailable));
        assert!(!wrapped.is(ErrorCode::NotFound));
    }

    #[test]
    fn code_of_downcasts_core_error() {
        let err = Error::new(ErrorCode::NotFound, "missing");
        let dyn_err: &(dyn std::error::Error + 'static) = &err;
        assert_eq!(code_of(dyn_err), ErrorCode::NotFound);
    }

    #[test]
    fn code_of_returns_unknown_for_foreign_errors() {
        #[derive(Debug)]
        struct Foreign;
        impl fmt::Display for Foreign {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("foreign")
            }
        }
        impl std::error::Error for Foreign {}

        let foreign = Foreign;
        let dyn_err: &(dyn std::error::Error + 'static) = &foreign;
        assert_eq!(code_of(dyn_err), ErrorCode::Unknown);
    }

    #[test]
    fn severity_ordering_is_total() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
        assert!(Severity::Critical < Severity::Fatal);
    }

    #[test]
    fn from_panic_captures_string_payload() {
        let result = std::panic::catch_unwind(|| {
            panic!("boom");
        });
        let payload = result.expect_err("should have panicked");
        let err = from_panic(payload.as_ref());
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.severity, Severity::Fatal);
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn with_retryable_false_clears_retry_after() {
        let err = Error::new(ErrorCode::Unavailable, "x").with_retryable(false);
        assert!(!err.retryable);
        assert!(err.retry_after.is_none());
    }
}
