//! Boundary error model shared by every mirrorline component.
//!
//! [`SyncError`] carries a taxonomy [`ErrorKind`], a stable code, and retry
//! metadata. Construct via kind-specific factory methods.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a sync failure.
///
/// Every error that crosses a component boundary carries exactly one kind, so
/// log processors can group failures without parsing free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid or missing configuration (fatal, never retried).
    Config,
    /// Rejected credentials (fatal, never retried).
    Auth,
    /// Remote throttled the caller (retried per policy).
    RateLimit,
    /// Transport fault, timeout, or server-side failure.
    Network,
    /// Malformed remote response.
    DataFormat,
    /// Retry budget spent; wraps the last cause.
    RetryExhausted,
    /// Aggregate marker for runs with mixed outcomes. Never a cause.
    PartialFailure,
    /// Another live process holds the session resource.
    SessionLocked,
    /// Persistence layer failure.
    Storage,
}

impl ErrorKind {
    /// Stable taxonomy code emitted in summaries and ledger rows.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Config => "CONFIG_ERROR",
            Self::Auth => "AUTH_ERROR",
            Self::RateLimit => "RATE_LIMIT",
            Self::Network => "NETWORK_ERROR",
            Self::DataFormat => "DATA_FORMAT_ERROR",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::PartialFailure => "PARTIAL_FAILURE",
            Self::SessionLocked => "SESSION_LOCKED",
            Self::Storage => "STORAGE_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::DataFormat => "data_format",
            Self::RetryExhausted => "retry_exhausted",
            Self::PartialFailure => "partial_failure",
            Self::SessionLocked => "session_locked",
            Self::Storage => "storage",
        };
        f.write_str(s)
    }
}

/// Detail codes shared between the fetch loop and the pipeline drivers.
pub mod codes {
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const FLOOD_WAIT: &str = "FLOOD_WAIT";
    pub const REFERENCE_EXPIRED: &str = "FILE_REFERENCE_EXPIRED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
    pub const HTTP_STATUS: &str = "HTTP_STATUS";
    pub const INVALID_JSON: &str = "INVALID_JSON";
}

/// Structured error from a sync operation.
///
/// Construct via kind-specific factory methods (e.g., [`SyncError::config`]).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{kind}] {code}: {message}")]
pub struct SyncError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    /// Server-provided delay hint in seconds (e.g. `Retry-After`).
    pub retry_after_secs: Option<u64>,
    /// Mandatory platform throttle. Honored exactly; does not consume the
    /// retry budget.
    pub throttle_secs: Option<u64>,
    /// HTTP status that produced this error, when there was one.
    pub status: Option<u16>,
    #[source]
    pub cause: Option<Box<SyncError>>,
}

impl SyncError {
    fn new(
        kind: ErrorKind,
        retryable: bool,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            retryable,
            retry_after_secs: None,
            throttle_secs: None,
            status: None,
            cause: None,
        }
    }

    /// Configuration error (not retryable).
    #[must_use]
    pub fn config(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, false, code, message)
    }

    /// Authentication error (not retryable).
    #[must_use]
    pub fn auth(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, false, code, message)
    }

    /// Rate limit error (retryable), optionally carrying a server delay hint.
    #[must_use]
    pub fn rate_limit(
        code: impl Into<String>,
        message: impl Into<String>,
        retry_after_secs: Option<u64>,
    ) -> Self {
        let mut err = Self::new(ErrorKind::RateLimit, true, code, message);
        err.retry_after_secs = retry_after_secs;
        err
    }

    /// Mandatory platform throttle: wait exactly `seconds` before the next call.
    #[must_use]
    pub fn throttled(seconds: u64) -> Self {
        let mut err = Self::new(
            ErrorKind::RateLimit,
            true,
            codes::FLOOD_WAIT,
            format!("remote requires a {seconds}s pause"),
        );
        err.throttle_secs = Some(seconds);
        err
    }

    /// Transient network error (retryable).
    #[must_use]
    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, true, code, message)
    }

    /// Per-call timeout expiry (retryable network error).
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::network(codes::TIMEOUT, message)
    }

    /// Terminal network-level failure such as not-found or bad-request.
    #[must_use]
    pub fn terminal_network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, false, code, message)
    }

    /// Downloadable reference went stale; recoverable only by re-fetching the
    /// parent item.
    #[must_use]
    pub fn reference_expired(message: impl Into<String>) -> Self {
        Self::terminal_network(codes::REFERENCE_EXPIRED, message)
    }

    /// Malformed response (not retryable).
    #[must_use]
    pub fn data_format(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataFormat, false, code, message)
    }

    /// Retry budget exhausted; wraps the last observed failure.
    #[must_use]
    pub fn retry_exhausted(attempts: u32, last: SyncError) -> Self {
        let mut err = Self::new(
            ErrorKind::RetryExhausted,
            false,
            last.code.clone(),
            format!("gave up after {attempts} attempts: {}", last.message),
        );
        err.cause = Some(Box::new(last));
        err
    }

    /// Aggregate marker for a run that only partly succeeded.
    #[must_use]
    pub fn partial_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PartialFailure, false, ErrorKind::PartialFailure.code(), message)
    }

    /// Session resource busy (held by a live process).
    #[must_use]
    pub fn session_locked(resource: impl fmt::Display, holder_pid: Option<u32>) -> Self {
        let holder = holder_pid.map_or_else(|| "unknown".to_string(), |p| p.to_string());
        Self::new(
            ErrorKind::SessionLocked,
            false,
            "SESSION_BUSY",
            format!("session {resource} is held by process {holder}"),
        )
    }

    /// Persistence layer failure (not retryable).
    #[must_use]
    pub fn storage(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, false, code, message)
    }

    /// Attach the HTTP status that produced this error.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether this is a mandatory platform throttle rather than a failure.
    #[must_use]
    pub fn is_throttle(&self) -> bool {
        self.throttle_secs.is_some()
    }

    /// Whether the error is a stale download reference.
    #[must_use]
    pub fn is_reference_expired(&self) -> bool {
        self.code == codes::REFERENCE_EXPIRED
    }

    /// Whether the last cause behind this error was a per-call timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.root_cause().code == codes::TIMEOUT
    }

    /// Innermost wrapped error (self when nothing is wrapped).
    #[must_use]
    pub fn root_cause(&self) -> &SyncError {
        let mut current = self;
        while let Some(inner) = current.cause.as_deref() {
            current = inner;
        }
        current
    }

    /// Taxonomy code for summaries and ledger rows.
    #[must_use]
    pub fn taxonomy_code(&self) -> &'static str {
        self.kind.code()
    }
}
