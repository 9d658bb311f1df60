/// Session manager: holds every live session keyed by id, dispatches
/// per-session work onto the Tokio executor rather than a separate
/// blocking pool — dispatch work here is I/O, not CPU, so it belongs on
/// the same executor sessions already run on — and runs a periodic
/// cleanup pass that closes long-idle sessions.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::task::JoinHandle;

use taskforge_shared::events::{emit, EventCategory, EventHandler};
use taskforge_shared::ids::SessionId;

use crate::error::SessionError;
use crate::session::Session;
use crate::wire::Wire;

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_IDLE_LIMIT: Duration = Duration::from_secs(600);

pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    cleanup_interval: Duration,
    idle_limit: Duration,
    cleanup_task: SyncMutex<Option<JoinHandle<()>>>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl SessionManager {
    pub fn new(event_handler: Option<Arc<dyn EventHandler>>) -> Arc<Self> {
        Self::with_intervals(DEFAULT_CLEANUP_INTERVAL, DEFAULT_IDLE_LIMIT, event_handler)
    }

    pub fn with_intervals(cleanup_interval: Duration, idle_limit: Duration, event_handler: Option<Arc<dyn EventHandler>>) -> Arc<Self> {
        let manager = Arc::new(SessionManager {
            sessions: RwLock::new(HashMap::new()),
            cleanup_interval,
            idle_limit,
            cleanup_task: SyncMutex::new(None),
            event_handler,
        });
        let handle = tokio::spawn(cleanup_loop(manager.clone()));
        *manager.cleanup_task.lock() = Some(handle);
        manager
    }

    pub fn register(&self, session: Arc<Session>) {
        self.sessions.write().insert(session.id(), session);
    }

    pub fn deregister(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatches `f` onto the session's own executor slot if `id` is
    /// registered; no-ops otherwise.
    pub fn with_session(self: &Arc<Self>, id: SessionId, f: impl FnOnce(Arc<Session>) + Send + 'static) {
        if let Some(session) = self.get(id) {
            tokio::spawn(async move { f(session) });
        }
    }

    pub fn with_sessions(self: &Arc<Self>, ids: &[SessionId], f: impl Fn(Arc<Session>) + Send + Sync + 'static) {
        let f = Arc::new(f);
        for id in ids {
            if let Some(session) = self.get(*id) {
                let f = f.clone();
                tokio::spawn(async move { f(session) });
            }
        }
    }

    pub fn for_each_session(self: &Arc<Self>, f: impl Fn(Arc<Session>) + Send + Sync + 'static) {
        let f = Arc::new(f);
        for session in self.sessions.read().values().cloned().collect::<Vec<_>>() {
            let f = f.clone();
            tokio::spawn(async move { f(session) });
        }
    }

    /// Best-effort per-recipient order, not globally ordered.
    pub async fn broadcast_bytes(&self, bytes: Arc<[u8]>) -> usize {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        let mut delivered = 0;
        for session in sessions {
            let bytes = bytes.clone();
            if session.send_bytes(&bytes).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub async fn broadcast_request<R: Wire + Sync>(&self, request: &R) -> usize {
        let wire = request.to_wire();
        self.broadcast_bytes(Arc::from(wire.into_bytes().into_boxed_slice())).await
    }

    pub async fn broadcast_response<R: Wire + Sync>(&self, response: &R) -> usize {
        let wire = response.to_wire();
        self.broadcast_bytes(Arc::from(wire.into_bytes().into_boxed_slice())).await
    }

    pub async fn close_all(&self) {
        if let Some(handle) = self.cleanup_task.lock().take() {
            handle.abort();
        }
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}

async fn cleanup_loop(manager: Arc<SessionManager>) {
    let mut ticker = tokio::time::interval(manager.cleanup_interval);
    loop {
        ticker.tick().await;
        let stale: Vec<_> = manager
            .sessions
            .read()
            .values()
            .filter(|s| s.stats().idle > manager.idle_limit)
            .cloned()
            .collect();
        for session in stale {
            emit(
                &manager.event_handler,
                EventCategory::Cleanup,
                format!("session {} idle beyond limit, closing", session.id()),
            );
            session.close().await;
            manager.deregister(session.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_shared::config::SessionConfig;
    use tokio::net::TcpListener;

    async fn adopted_session() -> Arc<Session> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, remote) = listener.accept().await.unwrap();
        let session = Session::new(SessionConfig::default(), None);
        session.adopt_socket(server, remote).unwrap();
        session
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let manager = SessionManager::with_intervals(Duration::from_secs(60), Duration::from_secs(600), None);
        let session = adopted_session().await;
        let id = session.id();
        manager.register(session);
        assert!(manager.get(id).is_some());
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_deregister_removes_session() {
        let manager = SessionManager::with_intervals(Duration::from_secs(60), Duration::from_secs(600), None);
        let session = adopted_session().await;
        let id = session.id();
        manager.register(session);
        manager.deregister(id);
        assert!(manager.get(id).is_none());
    }

    #[tokio::test]
    async fn test_cleanup_closes_idle_sessions() {
        let manager = SessionManager::with_intervals(Duration::from_millis(30), Duration::from_millis(20), None);
        let session = adopted_session().await;
        let id = session.id();
        manager.register(session);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(manager.get(id).is_none());
    }
}
