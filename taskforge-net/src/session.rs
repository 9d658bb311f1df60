/// Session: one logical connection, TCP or TLS, client or server.
///
/// ```text
/// disconnected ─connect─► connecting ─success─► connected
///                     │                    └error─► disconnected
///                     │
/// connected ─close─► disconnecting ─► disconnected
/// any ─error─► error ─close─► disconnected
/// ```
///
/// Reads run on a single dedicated task per session (the design note's
/// "event-driven object whose handlers are scheduled on a single executor
/// per session"); writes serialize through a `tokio::sync::Mutex` guarding
/// the write half, so two concurrent `send_bytes` calls never interleave
/// their bytes on the wire.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use taskforge_shared::config::SessionConfig;
use taskforge_shared::events::{emit, EventCategory, EventHandler};
use taskforge_shared::ids::SessionId;

use crate::error::SessionError;
use crate::tls;
use crate::wire::Wire;

/// Blanket trait so a TCP stream and either TLS stream flavor can share one
/// boxed, type-erased storage slot.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    TcpClient,
    TcpServer,
    TlsClient,
    TlsServer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
    Error = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Disconnected,
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Disconnecting,
            _ => SessionState::Error,
        }
    }
}

#[derive(Debug)]
struct AtomicSessionState(AtomicU8);

impl AtomicSessionState {
    fn new(state: SessionState) -> Self {
        AtomicSessionState(AtomicU8::new(state as u8))
    }
    fn load(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }
    fn store(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }
    /// CAS from any of `from` into `to`; returns whether it took effect.
    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        let current = self.0.load(Ordering::Acquire);
        if from.iter().any(|s| *s as u8 == current) {
            self.0.store(to as u8, Ordering::Release);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionStatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub uptime: Duration,
    pub idle: Duration,
}

struct SessionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    created_at: Instant,
    last_active: SyncMutex<Instant>,
}

impl SessionStats {
    fn new() -> Self {
        let now = Instant::now();
        SessionStats {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            created_at: now,
            last_active: SyncMutex::new(now),
        }
    }

    fn record_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        *self.last_active.lock() = Instant::now();
    }

    fn record_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        *self.last_active.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_active.lock().elapsed()
    }

    fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            uptime: self.created_at.elapsed(),
            idle: self.idle_for(),
        }
    }
}

type BoxedDuplex = Box<dyn AsyncDuplex>;
type BoxedWriter = WriteHalf<BoxedDuplex>;
type BoxedReader = ReadHalf<BoxedDuplex>;

type ReceiveHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// One logical connection and its state machine.
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    kind: SyncMutex<Option<SessionKind>>,
    state: AtomicSessionState,
    remote: SyncMutex<Option<SocketAddr>>,
    stats: SessionStats,
    handler: SyncMutex<Option<ReceiveHandler>>,
    writer: AsyncMutex<Option<BoxedWriter>>,
    pending_stream: SyncMutex<Option<(BoxedDuplex, SessionKind)>>,
    read_task: SyncMutex<Option<JoinHandle<()>>>,
    heartbeat_task: SyncMutex<Option<JoinHandle<()>>>,
    closing: std::sync::atomic::AtomicBool,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl Session {
    pub fn new(config: SessionConfig, event_handler: Option<Arc<dyn EventHandler>>) -> Arc<Self> {
        Arc::new(Session {
            id: SessionId::generate(),
            config,
            kind: SyncMutex::new(None),
            state: AtomicSessionState::new(SessionState::Disconnected),
            remote: SyncMutex::new(None),
            stats: SessionStats::new(),
            handler: SyncMutex::new(None),
            writer: AsyncMutex::new(None),
            pending_stream: SyncMutex::new(None),
            read_task: SyncMutex::new(None),
            heartbeat_task: SyncMutex::new(None),
            closing: std::sync::atomic::AtomicBool::new(false),
            event_handler,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn kind(&self) -> Option<SessionKind> {
        *self.kind.lock()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn set_reception_processing(&self, handler: ReceiveHandler) {
        *self.handler.lock() = Some(handler);
    }

    /// Clears the receive handler without closing the session, so a
    /// connection-pool session can be handed to the next borrower without
    /// carrying over the previous request's decode closure.
    pub fn clear_reception_processing(&self) {
        *self.handler.lock() = None;
    }

    /// Resolves `host:port` (parsing an IP literal directly if possible,
    /// else via DNS) and connects, TLS-handshaking first if
    /// `config.enable_ssl` is set.
    pub async fn connect(self: &Arc<Self>, host: &str, port: u16) -> Result<(), SessionError> {
        if !self
            .state
            .transition(&[SessionState::Disconnected, SessionState::Error], SessionState::Connecting)
        {
            return Err(SessionError::AlreadyConnected);
        }

        let result = tokio::time::timeout(self.config.connect_timeout, self.connect_inner(host, port)).await;

        match result {
            Ok(Ok(())) => {
                emit(&self.event_handler, EventCategory::Lifecycle, format!("session {} connected to {host}:{port}", self.id));
                Ok(())
            }
            Ok(Err(e)) => {
                self.state.store(SessionState::Disconnected);
                Err(e)
            }
            Err(_) => {
                self.state.store(SessionState::Disconnected);
                Err(SessionError::ConnectTimeout(self.config.connect_timeout))
            }
        }
    }

    async fn connect_inner(self: &Arc<Self>, host: &str, port: u16) -> Result<(), SessionError> {
        let addr = resolve(host, port).await?;
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| SessionError::Connect { host: host.to_string(), port, source: e })?;

        let (stream, kind): (BoxedDuplex, SessionKind) = if self.config.enable_ssl {
            let client_config = tls::build_client_config(&self.config)?;
            let connector = TlsConnector::from(Arc::new(client_config));
            let server_name = tls::server_name_for(&self.config, host)?;
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| SessionError::Tls(e.to_string()))?;
            (Box::new(tls_stream), SessionKind::TlsClient)
        } else {
            (Box::new(tcp), SessionKind::TcpClient)
        };

        *self.remote.lock() = Some(addr);
        *self.kind.lock() = Some(kind);
        self.state.store(SessionState::Connected);
        self.spawn_io_tasks(stream);
        Ok(())
    }

    /// Takes ownership of an externally-accepted socket. Only valid from
    /// `disconnected`. Server-side TLS (if configured) is deferred to
    /// [`Session::start`].
    pub fn adopt_socket(self: &Arc<Self>, socket: TcpStream, remote: SocketAddr) -> Result<(), SessionError> {
        if !self
            .state
            .transition(&[SessionState::Disconnected], SessionState::Connected)
        {
            return Err(SessionError::AlreadyConnected);
        }
        *self.remote.lock() = Some(remote);
        let kind = if self.config.enable_ssl { SessionKind::TlsServer } else { SessionKind::TcpServer };
        *self.kind.lock() = Some(kind);

        if self.config.enable_ssl {
            *self.pending_stream.lock() = Some((Box::new(socket), kind));
        } else {
            self.spawn_io_tasks(Box::new(socket));
        }
        Ok(())
    }

    /// For sessions adopted via [`Session::adopt_socket`]: performs the
    /// deferred server-side TLS handshake (if configured) and starts the
    /// read loop and heartbeat.
    pub async fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        let pending = self.pending_stream.lock().take();
        let Some((stream, _kind)) = pending else {
            // Nothing deferred (plain TCP adoption already started, or
            // start() called twice); treat as a no-op rather than an error.
            return Ok(());
        };

        let server_config = tls::build_server_config(&self.config)?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        // SAFETY: `stream` was boxed from a concrete `TcpStream` in
        // `adopt_socket`; TlsAcceptor only needs AsyncRead+AsyncWrite+Unpin,
        // which the boxed trait object still provides.
        let tls_stream = acceptor
            .accept(stream)
            .await
            .map_err(|e| SessionError::Tls(e.to_string()))?;
        self.spawn_io_tasks(Box::new(tls_stream));
        Ok(())
    }

    fn spawn_io_tasks(self: &Arc<Self>, stream: BoxedDuplex) {
        let (read_half, write_half) = tokio::io::split(stream);
        if let Ok(mut guard) = self.writer.try_lock() {
            *guard = Some(write_half);
        }
        let read_handle = tokio::spawn(read_loop(self.clone(), read_half));
        *self.read_task.lock() = Some(read_handle);

        if self.config.enable_heartbeat {
            let heartbeat_handle = tokio::spawn(heartbeat_loop(self.clone()));
            *self.heartbeat_task.lock() = Some(heartbeat_handle);
        }
    }

    /// Writes bytes. Returns `not_connected` if the session isn't
    /// currently connected.
    pub async fn send_bytes(&self, bytes: &[u8]) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        if bytes.len() > self.config.max_message_size {
            return Err(SessionError::MessageTooLarge(bytes.len()));
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::NotConnected)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        self.stats.record_sent(bytes.len());
        Ok(())
    }

    /// Fire-and-forget variant: spawns the write and invokes `callback`
    /// with the result once it completes.
    pub fn async_send_bytes(
        self: &Arc<Self>,
        bytes: Vec<u8>,
        callback: impl FnOnce(Result<(), SessionError>) + Send + 'static,
    ) {
        let session = self.clone();
        tokio::spawn(async move {
            let result = session.send_bytes(&bytes).await;
            callback(result);
        });
    }

    pub async fn send_request<R: Wire + Sync>(&self, request: &R) -> Result<(), SessionError> {
        self.send_bytes(request.to_wire().as_bytes()).await
    }

    pub async fn send_response<R: Wire + Sync>(&self, response: &R) -> Result<(), SessionError> {
        self.send_bytes(response.to_wire().as_bytes()).await
    }

    /// Idempotent: cancels the heartbeat, clears the handler, shuts the
    /// underlying socket, and transitions through `disconnecting` to
    /// `disconnected`. Safe to call from any state, any number of times.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.store(SessionState::Disconnecting);

        if let Some(handle) = self.read_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.heartbeat_task.lock().take() {
            handle.abort();
        }
        *self.handler.lock() = None;

        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
        drop(guard);

        self.state.store(SessionState::Disconnected);
        emit(&self.event_handler, EventCategory::Lifecycle, format!("session {} closed", self.id));
        self.closing.store(false, Ordering::Release);
    }

    /// Transitions to `error` and tears down, used internally when the
    /// read loop observes EOF or an I/O error.
    async fn fail(&self, reason: impl Into<String>) {
        self.state.store(SessionState::Error);
        emit(&self.event_handler, EventCategory::Error, format!("session {} error: {}", self.id, reason.into()));
        self.close().await;
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, SessionError> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SessionError::Connect { host: host.to_string(), port, source: e })?;
    addrs
        .next()
        .ok_or_else(|| SessionError::Connect {
            host: host.to_string(),
            port,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "dns resolution returned no addresses"),
        })
}

async fn read_loop(session: Arc<Session>, mut reader: BoxedReader) {
    let mut buf = vec![0u8; session.config.max_buffer_size.max(4096)];
    loop {
        let read_result = tokio::time::timeout(session.config.read_timeout, reader.read(&mut buf)).await;
        match read_result {
            Ok(Ok(0)) => {
                session.fail("peer closed the connection").await;
                break;
            }
            Ok(Ok(n)) => {
                session.stats.record_received(n);
                let handler = session.handler.lock().clone();
                if let Some(handler) = handler {
                    handler(&buf[..n]);
                }
            }
            Ok(Err(e)) => {
                session.fail(e.to_string()).await;
                break;
            }
            Err(_elapsed) => {
                // read_timeout bounds a single read call, not session
                // idleness; idle detection is the heartbeat's job.
                continue;
            }
        }
    }
}

async fn heartbeat_loop(session: Arc<Session>) {
    let interval = session.config.heartbeat_interval;
    if interval.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if session.state() != SessionState::Connected {
            break;
        }
        if session.stats.idle_for() > interval.saturating_mul(2) {
            tracing::info!(session_id = %session.id(), "heartbeat idle timeout, closing session");
            session.close().await;
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::{TcpListener, TcpStream as TokioTcpStream};

    async fn loopback_pair() -> (TokioTcpStream, TokioTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TokioTcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_adopt_socket_transitions_to_connected() {
        let (_client, server) = loopback_pair().await;
        let remote = server.peer_addr().unwrap();
        let session = Session::new(SessionConfig::default(), None);
        session.adopt_socket(server, remote).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_send_bytes_requires_connection() {
        let session = Session::new(SessionConfig::default(), None);
        let err = session.send_bytes(b"hi").await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
    }

    #[tokio::test]
    async fn test_receive_handler_sees_sent_bytes() {
        let (mut client, server) = loopback_pair().await;
        let remote = server.peer_addr().unwrap();
        let session = Session::new(SessionConfig::default(), None);
        session.adopt_socket(server, remote).unwrap();

        let received: Arc<SyncMutex<Vec<u8>>> = Arc::new(SyncMutex::new(Vec::new()));
        let received_clone = received.clone();
        session.set_reception_processing(Arc::new(move |chunk: &[u8]| {
            received_clone.lock().extend_from_slice(chunk);
        }));

        client.write_all(b"ping").await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while received.lock().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(received.lock().as_slice(), b"ping");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_client, server) = loopback_pair().await;
        let remote = server.peer_addr().unwrap();
        let session = Session::new(SessionConfig::default(), None);
        session.adopt_socket(server, remote).unwrap();

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_peer_close_transitions_through_error_to_disconnected() {
        let (client, server) = loopback_pair().await;
        let remote = server.peer_addr().unwrap();
        let session = Session::new(SessionConfig::default(), None);
        session.adopt_socket(server, remote).unwrap();
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(2);
        while session.state() == SessionState::Connected && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
