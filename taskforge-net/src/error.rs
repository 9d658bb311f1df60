/// Error taxonomy for the session/connection-pool/forwarder layer.
///
/// Mirrors the shape of `taskforge_core`'s per-component `thiserror` enums
/// (`QueueError`, `SchedulerError`, `PoolError`): one leaf enum per
/// component, convertible into `taskforge_shared::error::RuntimeError` for
/// callers that want a single cross-runtime error type.
use taskforge_shared::error::RuntimeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("message exceeds max_message_size ({0} bytes)")]
    MessageTooLarge(usize),

    #[error("peer closed the connection")]
    PeerClosed,
}

impl From<SessionError> for RuntimeError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotConnected => RuntimeError::NotReady(err.to_string()),
            SessionError::AlreadyConnected => RuntimeError::NotReady(err.to_string()),
            SessionError::Connect { .. } => RuntimeError::NotReady(err.to_string()),
            SessionError::Tls(_) => RuntimeError::TlsFailure(err.to_string()),
            SessionError::Io(_) => RuntimeError::NotReady(err.to_string()),
            SessionError::ConnectTimeout(_) => RuntimeError::Timeout(err.to_string()),
            SessionError::MessageTooLarge(_) => RuntimeError::Full(err.to_string()),
            SessionError::PeerClosed => RuntimeError::Closed(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionPoolError {
    #[error("no endpoint registered for {0}:{1}")]
    UnknownEndpoint(String, u16),

    #[error("borrow from {0}:{1} timed out after {2:?}")]
    BorrowTimeout(String, u16, std::time::Duration),

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

impl From<ConnectionPoolError> for RuntimeError {
    fn from(err: ConnectionPoolError) -> Self {
        match err {
            ConnectionPoolError::UnknownEndpoint(..) => RuntimeError::NotReady(err.to_string()),
            ConnectionPoolError::BorrowTimeout(..) => RuntimeError::Timeout(err.to_string()),
            ConnectionPoolError::Session(inner) => inner.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("missing or unparseable Host header")]
    MissingHost,

    #[error("no upstream configured for host {0}")]
    NoUpstream(String),

    #[error("host {0} is denied by configuration")]
    HostDenied(String),

    #[error("upstream wait timed out after {0:?}")]
    UpstreamTimeout(std::time::Duration),

    #[error("too many in-flight requests")]
    Saturated,

    #[error("shutting down")]
    ShuttingDown,

    #[error("connection pool error: {0}")]
    Pool(#[from] ConnectionPoolError),

    #[error("parse failure: {0}")]
    Parse(String),
}

impl From<ForwarderError> for RuntimeError {
    fn from(err: ForwarderError) -> Self {
        match err {
            ForwarderError::MissingHost => RuntimeError::ParseFailure(err.to_string()),
            ForwarderError::NoUpstream(_) => RuntimeError::NotReady(err.to_string()),
            ForwarderError::HostDenied(_) => RuntimeError::NotReady(err.to_string()),
            ForwarderError::UpstreamTimeout(_) => RuntimeError::Timeout(err.to_string()),
            ForwarderError::Saturated => RuntimeError::Full(err.to_string()),
            ForwarderError::ShuttingDown => RuntimeError::Closed(err.to_string()),
            ForwarderError::Pool(inner) => inner.into(),
            ForwarderError::Parse(_) => RuntimeError::ParseFailure(err.to_string()),
        }
    }
}
