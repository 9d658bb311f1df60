/// Connection pool: a bounded population of sessions per (host, port)
/// endpoint, partitioned into an idle deque and a borrowed set.
///
/// Invariants upheld here: a session is in exactly one of {idle, borrowed};
/// `total` (idle + borrowed) never exceeds `max`; idle entries are always
/// connected when held.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use taskforge_shared::config::{ConnectionPoolConfig, SessionConfig};
use taskforge_shared::events::{emit, EventCategory, EventHandler};
use taskforge_shared::ids::SessionId;

use crate::error::ConnectionPoolError;
use crate::session::Session;

/// Poll granularity for the background health-check task. Each endpoint's
/// own `health_check_interval` still gates how often it is actually
/// checked; this only bounds how promptly a newly-registered endpoint with
/// a short interval gets its first pass.
const HEALTH_TICK: Duration = Duration::from_millis(250);

struct Endpoint {
    host: String,
    port: u16,
    config: ConnectionPoolConfig,
    session_config: SessionConfig,
    idle: SyncMutex<VecDeque<Arc<Session>>>,
    borrowed: SyncMutex<HashMap<SessionId, Weak<Session>>>,
    total: AtomicUsize,
    notify: Notify,
    last_health_check: SyncMutex<Instant>,
}

impl Endpoint {
    fn occupied(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Atomically reserves one slot against `bound` before any connect
    /// attempt starts, so concurrent callers can't all observe room and
    /// all open sessions past it. Returns whether a slot was reserved;
    /// the caller must release it with `release` on any failure path.
    fn try_reserve(&self, bound: usize) -> bool {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current < bound {
                    Some(current + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn release_reserved(&self) {
        self.total.fetch_sub(1, Ordering::Relaxed);
    }

    async fn open_session(&self, event_handler: Option<Arc<dyn EventHandler>>) -> Result<Arc<Session>, ConnectionPoolError> {
        let session = Session::new(self.session_config.clone(), event_handler);
        session
            .connect(&self.host, self.port)
            .await
            .map_err(ConnectionPoolError::Session)?;
        Ok(session)
    }

    /// Opens new idle sessions until `idle + borrowed` reaches `min`.
    async fn preheat(self: &Arc<Self>, event_handler: Option<Arc<dyn EventHandler>>) {
        loop {
            if !self.try_reserve(self.config.min_connections) {
                break;
            }
            match self.open_session(event_handler.clone()).await {
                Ok(session) => {
                    self.idle.lock().push_back(session);
                    self.notify.notify_one();
                }
                Err(e) => {
                    self.release_reserved();
                    tracing::warn!(host = %self.host, port = self.port, error = %e, "preheat connect failed");
                    break;
                }
            }
        }
    }

    fn health_pass(&self) {
        let mut idle = self.idle.lock();
        let before = idle.len();
        idle.retain(|s| s.is_connected());
        let dropped_idle = before - idle.len();
        drop(idle);

        let mut borrowed = self.borrowed.lock();
        let before = borrowed.len();
        borrowed.retain(|_, weak| matches!(weak.upgrade(), Some(s) if s.is_connected()));
        let dropped_borrowed = before - borrowed.len();
        drop(borrowed);

        if dropped_idle + dropped_borrowed > 0 {
            self.total.fetch_sub(dropped_idle + dropped_borrowed, Ordering::Relaxed);
        }
    }
}

/// Per-(host, port) session pool with preheat, borrow/give-back, and a
/// background health-check pass.
pub struct ConnectionPool {
    endpoints: RwLock<HashMap<(String, u16), Arc<Endpoint>>>,
    event_handler: Option<Arc<dyn EventHandler>>,
    health_task: SyncMutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ConnectionPool {
    pub fn new(event_handler: Option<Arc<dyn EventHandler>>) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool {
            endpoints: RwLock::new(HashMap::new()),
            event_handler,
            health_task: SyncMutex::new(None),
            stopped: AtomicBool::new(false),
        });
        let handle = tokio::spawn(health_loop(pool.clone()));
        *pool.health_task.lock() = Some(handle);
        pool
    }

    /// Registers an endpoint and preheats it to `min_connections`.
    pub async fn add_endpoint(self: &Arc<Self>, host: impl Into<String>, port: u16, config: ConnectionPoolConfig, session_config: SessionConfig) {
        let host = host.into();
        let endpoint = Arc::new(Endpoint {
            host: host.clone(),
            port,
            config,
            session_config,
            idle: SyncMutex::new(VecDeque::new()),
            borrowed: SyncMutex::new(HashMap::new()),
            total: AtomicUsize::new(0),
            notify: Notify::new(),
            last_health_check: SyncMutex::new(Instant::now()),
        });
        self.endpoints.write().insert((host, port), endpoint.clone());
        endpoint.preheat(self.event_handler.clone()).await;
    }

    /// Closes all idle sessions, wakes any waiters (who will then observe
    /// the endpoint gone and fail), and drops the entry.
    pub async fn remove_endpoint(&self, host: &str, port: u16) {
        let endpoint = self.endpoints.write().remove(&(host.to_string(), port));
        if let Some(endpoint) = endpoint {
            let idle: Vec<_> = endpoint.idle.lock().drain(..).collect();
            for session in idle {
                session.close().await;
            }
            endpoint.notify.notify_waiters();
        }
    }

    fn endpoint(&self, host: &str, port: u16) -> Result<Arc<Endpoint>, ConnectionPoolError> {
        self.endpoints
            .read()
            .get(&(host.to_string(), port))
            .cloned()
            .ok_or_else(|| ConnectionPoolError::UnknownEndpoint(host.to_string(), port))
    }

    /// Returns an idle session if one exists; opens a new one
    /// synchronously if below `max`; else waits up to `timeout` (the
    /// endpoint's configured `borrow_timeout` if `None`) for a give-back.
    pub async fn borrow(self: &Arc<Self>, host: &str, port: u16, timeout: Option<Duration>) -> Result<Arc<Session>, ConnectionPoolError> {
        let endpoint = self.endpoint(host, port)?;
        let timeout = timeout.unwrap_or(endpoint.config.borrow_timeout);
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(session) = Self::take_idle(&endpoint) {
                return Ok(session);
            }

            if endpoint.try_reserve(endpoint.config.max_connections) {
                match endpoint.open_session(self.event_handler.clone()).await {
                    Ok(session) => {
                        Self::mark_borrowed(&endpoint, &session);
                        return Ok(session);
                    }
                    Err(e) => {
                        endpoint.release_reserved();
                        return Err(e);
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ConnectionPoolError::BorrowTimeout(host.to_string(), port, timeout));
            }
            let _ = tokio::time::timeout(remaining, endpoint.notify.notified()).await;
        }
    }

    /// Non-blocking variant: returns immediately if no idle session and
    /// the endpoint is already at capacity.
    pub async fn try_borrow(self: &Arc<Self>, host: &str, port: u16) -> Result<Arc<Session>, ConnectionPoolError> {
        self.borrow(host, port, Some(Duration::ZERO)).await
    }

    fn take_idle(endpoint: &Arc<Endpoint>) -> Option<Arc<Session>> {
        loop {
            let candidate = endpoint.idle.lock().pop_front()?;
            if candidate.is_connected() {
                Self::mark_borrowed(endpoint, &candidate);
                return Some(candidate);
            }
            endpoint.total.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn mark_borrowed(endpoint: &Arc<Endpoint>, session: &Arc<Session>) {
        endpoint.borrowed.lock().insert(session.id(), Arc::downgrade(session));
    }

    /// Returns a borrowed session to idle if still connected (and wakes
    /// one waiter), else closes it. Either way, triggers a preheat pass.
    pub fn give_back(self: &Arc<Self>, host: &str, port: u16, session: Arc<Session>) {
        let Ok(endpoint) = self.endpoint(host, port) else {
            return;
        };
        endpoint.borrowed.lock().remove(&session.id());

        if session.is_connected() {
            endpoint.idle.lock().push_back(session);
            endpoint.notify.notify_one();
        } else {
            endpoint.total.fetch_sub(1, Ordering::Relaxed);
            let session = session.clone();
            tokio::spawn(async move { session.close().await });
        }

        let pool = self.clone();
        let endpoint = endpoint.clone();
        tokio::spawn(async move { endpoint.preheat(pool.event_handler.clone()).await });
    }

    /// Forcibly closes and drops a session from tracking, regardless of
    /// connectedness, then triggers a preheat pass.
    pub fn invalidate(self: &Arc<Self>, host: &str, port: u16, session: Arc<Session>) {
        let Ok(endpoint) = self.endpoint(host, port) else {
            return;
        };
        let was_borrowed = endpoint.borrowed.lock().remove(&session.id()).is_some();
        let was_idle = {
            let mut idle = endpoint.idle.lock();
            let before = idle.len();
            idle.retain(|s| s.id() != session.id());
            before != idle.len()
        };
        if was_borrowed || was_idle {
            endpoint.total.fetch_sub(1, Ordering::Relaxed);
        }
        emit(&self.event_handler, EventCategory::Queue, format!("session {} invalidated", session.id()));

        tokio::spawn(async move { session.close().await });

        let pool = self.clone();
        let endpoint = endpoint.clone();
        tokio::spawn(async move { endpoint.preheat(pool.event_handler.clone()).await });
    }

    /// Closes all idle sessions across all endpoints and wakes every
    /// waiter. Borrowed sessions are left to their holders.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.health_task.lock().take() {
            handle.abort();
        }
        let endpoints: Vec<_> = self.endpoints.read().values().cloned().collect();
        for endpoint in endpoints {
            let idle: Vec<_> = endpoint.idle.lock().drain(..).collect();
            for session in idle {
                session.close().await;
            }
            endpoint.notify.notify_waiters();
        }
    }
}

async fn health_loop(pool: Arc<ConnectionPool>) {
    let mut ticker = tokio::time::interval(HEALTH_TICK);
    loop {
        ticker.tick().await;
        if pool.stopped.load(Ordering::Acquire) {
            break;
        }
        let endpoints: Vec<_> = pool.endpoints.read().values().cloned().collect();
        for endpoint in endpoints {
            let due = {
                let mut last = endpoint.last_health_check.lock();
                if last.elapsed() >= endpoint.config.health_check_interval {
                    *last = Instant::now();
                    true
                } else {
                    false
                }
            };
            if due {
                endpoint.health_pass();
                endpoint.preheat(pool.event_handler.clone()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn echo_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    use tokio::io::AsyncWriteExt;
                    let mut buf = [0u8; 1024];
                    use tokio::io::AsyncReadExt;
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if socket.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_borrow_then_give_back_cycles_the_session() {
        let (addr, _server) = echo_server().await;
        let pool = ConnectionPool::new(None);
        let mut config = ConnectionPoolConfig::default();
        config.min_connections = 0;
        config.max_connections = 1;
        config.borrow_timeout = Duration::from_millis(200);
        pool.add_endpoint(addr.ip().to_string(), addr.port(), config, SessionConfig::default()).await;

        let session = pool.borrow(&addr.ip().to_string(), addr.port(), None).await.unwrap();
        let id = session.id();
        pool.give_back(&addr.ip().to_string(), addr.port(), session);

        let second = pool.borrow(&addr.ip().to_string(), addr.port(), None).await.unwrap();
        assert_eq!(second.id(), id);
    }

    #[tokio::test]
    async fn test_borrow_contention_times_out_then_give_back_wakes_waiter() {
        let (addr, _server) = echo_server().await;
        let pool = ConnectionPool::new(None);
        let mut config = ConnectionPoolConfig::default();
        config.min_connections = 0;
        config.max_connections = 1;
        config.borrow_timeout = Duration::from_millis(200);
        let host = addr.ip().to_string();
        pool.add_endpoint(host.clone(), addr.port(), config, SessionConfig::default()).await;

        let first = pool.borrow(&host, addr.port(), None).await.unwrap();

        let second = pool.borrow(&host, addr.port(), Some(Duration::from_millis(200))).await;
        assert!(matches!(second, Err(ConnectionPoolError::BorrowTimeout(..))));

        let pool2 = pool.clone();
        let host2 = host.clone();
        let port = addr.port();
        let waiter = tokio::spawn(async move { pool2.borrow(&host2, port, Some(Duration::from_secs(2))).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.give_back(&host, addr.port(), first);

        let woken = tokio::time::timeout(Duration::from_millis(500), waiter).await.unwrap().unwrap();
        assert!(woken.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_endpoint_errors() {
        let pool = ConnectionPool::new(None);
        let err = pool.borrow("127.0.0.1", 1, None).await.unwrap_err();
        assert!(matches!(err, ConnectionPoolError::UnknownEndpoint(..)));
    }
}
