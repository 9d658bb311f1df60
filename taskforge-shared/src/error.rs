/// Unified runtime error taxonomy
///
/// Individual components (`taskforge-core::queue`, `taskforge-net::session`,
/// ...) define their own `thiserror` enums for the errors they can actually
/// produce. `RuntimeError` exists for callers that want one error type
/// across the whole runtime — it mirrors the abstract error kinds listed
/// in the error-handling design (not_ready, closed, full, timeout,
/// cancelled, execution_failure, integrity_failure, tls_failure,
/// parse_failure) without depending on any downstream crate.
use std::fmt;
use thiserror::Error;

/// A runtime-wide error kind, independent of which component raised it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Operation attempted while the target was not in a state that
    /// permits it (e.g. sending on a disconnected session).
    #[error("not ready: {0}")]
    NotReady(String),

    /// The accepting side has been closed or is shutting down; producer
    /// side rejection.
    #[error("closed: {0}")]
    Closed(String),

    /// A bounded resource (queue, pool) was at capacity and the caller's
    /// backpressure policy demanded a hard failure.
    #[error("full: {0}")]
    Full(String),

    /// A bound (borrow timeout, deadline, shutdown timeout, upstream wait)
    /// elapsed before the operation completed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The operation was cancelled before it began.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The user-supplied callable failed during execution.
    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    /// A message's checksum or framing did not match its content.
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    /// A TLS handshake or peer verification failed.
    #[error("tls failure: {0}")]
    TlsFailure(String),

    /// A header or message could not be decoded.
    #[error("parse failure: {0}")]
    ParseFailure(String),
}

impl RuntimeError {
    /// Returns a short machine-stable tag for this error kind, suitable for
    /// metrics labels or event payloads.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            RuntimeError::NotReady(_) => "not_ready",
            RuntimeError::Closed(_) => "closed",
            RuntimeError::Full(_) => "full",
            RuntimeError::Timeout(_) => "timeout",
            RuntimeError::Cancelled(_) => "cancelled",
            RuntimeError::ExecutionFailure(_) => "execution_failure",
            RuntimeError::IntegrityFailure(_) => "integrity_failure",
            RuntimeError::TlsFailure(_) => "tls_failure",
            RuntimeError::ParseFailure(_) => "parse_failure",
        }
    }
}

/// Wraps an arbitrary captured panic/exception payload from a user callable.
///
/// `taskforge-core` catches unwinding panics from task callables at the
/// worker boundary (see `taskforge-core::worker`) and stores the message
/// here rather than propagating the panic across the thread boundary.
#[derive(Debug, Clone)]
pub struct CapturedFailure {
    pub message: String,
}

impl fmt::Display for CapturedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CapturedFailure {}

impl CapturedFailure {
    pub fn from_panic_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked with a non-string payload".to_string()
        };
        CapturedFailure { message }
    }
}
