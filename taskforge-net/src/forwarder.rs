/// Forwarder: routes a client request to an upstream
/// chosen by its Host header, borrowing a session from the connection
/// pool to relay it and decode the response.
///
/// Grounded on `original_source/server/model/network/business/forwarder.hpp`
/// (`transponder`): a domain -> upstream multimap keyed by Host, a deny
/// list consulted before the lookup, and an in-flight task ceiling
/// guarding the async dispatch path. The session manager's registry and
/// broadcast half of C8 lives in `manager`; this module is purely the
/// request-routing half.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{oneshot, Semaphore};

use taskforge_shared::config::{ConnectionPoolConfig, ForwarderConfig, SessionConfig, UpstreamEntry};
use taskforge_shared::events::{emit, EventCategory, EventHandler};

use crate::connection_pool::ConnectionPool;
use crate::error::ForwarderError;
use crate::wire::{try_decode_response, HttpRequest, HttpResponse};

/// Rewrites a request before it's relayed upstream, e.g. to add headers.
pub type RequestFilter = Arc<dyn Fn(&mut HttpRequest) + Send + Sync>;
/// Rewrites a response before it's returned to the caller.
pub type ResponseFilter = Arc<dyn Fn(&mut HttpResponse) + Send + Sync>;

#[derive(Debug, Clone)]
struct Upstream {
    domain: String,
    host: String,
    port: u16,
    https: bool,
}

impl Upstream {
    /// The canonical `Host` value for this upstream: the default port for
    /// the scheme is omitted.
    fn canonical_host_header(&self) -> String {
        let default_port = if self.https { 443 } else { 80 };
        let name = if self.host.is_empty() { self.domain.as_str() } else { self.host.as_str() };
        if self.port == default_port {
            name.to_string()
        } else {
            format!("{name}:{}", self.port)
        }
    }
}

/// Routes client requests to configured upstreams and relays them over
/// sessions borrowed from its own connection pool.
pub struct Forwarder {
    pool: Arc<ConnectionPool>,
    upstreams: RwLock<HashMap<String, Vec<Upstream>>>,
    config: ForwarderConfig,
    pool_config: ConnectionPoolConfig,
    in_flight: Arc<Semaphore>,
    stopping: AtomicBool,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl Forwarder {
    pub fn new(
        config: ForwarderConfig,
        pool_config: ConnectionPoolConfig,
        event_handler: Option<Arc<dyn EventHandler>>,
    ) -> Arc<Self> {
        let max_in_flight = config.max_in_flight.max(1);
        Arc::new(Forwarder {
            pool: ConnectionPool::new(event_handler.clone()),
            upstreams: RwLock::new(HashMap::new()),
            config,
            pool_config,
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            stopping: AtomicBool::new(false),
            event_handler,
        })
    }

    /// Loads upstreams from the forwarder's configuration shape: an
    /// array of `{domain, ip, port, https}`.
    pub async fn load_upstreams(self: &Arc<Self>, entries: &[UpstreamEntry]) {
        for entry in entries {
            self.add_upstream(&entry.domain, &entry.ip, entry.port, entry.https).await;
        }
    }

    /// Registers an upstream and preheats its connection pool endpoint.
    /// An empty `ip` triggers DNS resolution of `domain`; resolution
    /// failure falls back to using `domain` as the host.
    pub async fn add_upstream(self: &Arc<Self>, domain: &str, ip: &str, port: u16, https: bool) {
        let host = if ip.is_empty() {
            resolve_first(domain, port).await.unwrap_or_else(|| domain.to_string())
        } else {
            ip.to_string()
        };

        let upstream = Upstream {
            domain: domain.to_ascii_lowercase(),
            host: host.clone(),
            port,
            https,
        };

        let session_config = SessionConfig {
            enable_ssl: https,
            tls_server_name: Some(domain.to_string()),
            ssl_ca_file: self.config.ssl_ca_file.clone(),
            ssl_cert_file: self.config.ssl_cert_file.clone(),
            ssl_key_file: self.config.ssl_key_file.clone(),
            ssl_insecure_skip_verify: self.config.ssl_insecure_skip_verify,
            ..SessionConfig::default()
        };

        self.pool.add_endpoint(host.clone(), port, self.pool_config.clone(), session_config).await;
        self.upstreams.write().entry(upstream.domain.clone()).or_default().push(upstream);
        emit(
            &self.event_handler,
            EventCategory::Lifecycle,
            format!("upstream registered: {domain} -> {host}:{port} (https={https})"),
        );
    }

    /// Removes every upstream registered for `domain` and its pool
    /// endpoints.
    pub async fn remove_upstream(&self, domain: &str) {
        let domain = domain.to_ascii_lowercase();
        let removed = self.upstreams.write().remove(&domain);
        if let Some(entries) = removed {
            for entry in entries {
                self.pool.remove_endpoint(&entry.host, entry.port).await;
            }
        }
    }

    /// Prefers the entry whose port matches the request's explicit Host
    /// port; falls back to the first configured entry for the domain.
    fn match_upstream(&self, name: &str, port: Option<u16>) -> Option<Upstream> {
        let upstreams = self.upstreams.read();
        let candidates = upstreams.get(name)?;
        if let Some(port) = port {
            if let Some(found) = candidates.iter().find(|u| u.port == port) {
                return Some(found.clone());
            }
        }
        candidates.first().cloned()
    }

    /// Resolves the upstream a request should be relayed to, or the
    /// reason it can't be: missing Host header, a denied host, or no
    /// configured upstream for the domain.
    fn route(&self, req: &HttpRequest) -> Result<Upstream, ForwarderError> {
        let (name, port) = req.host().ok_or(ForwarderError::MissingHost)?;

        if self.config.denied_hosts.iter().any(|denied| denied.eq_ignore_ascii_case(&name)) {
            emit(&self.event_handler, EventCategory::Warning, format!("host {name} denied by configuration"));
            return Err(ForwarderError::HostDenied(name));
        }

        self.match_upstream(&name, port).ok_or(ForwarderError::NoUpstream(name))
    }

    /// Routes and relays one request. Always returns a response; routing
    /// and upstream failures (`ForwarderError`) are encoded as HTTP error
    /// responses rather than surfaced as an `Err`, mirroring the
    /// original's `forward_sync`.
    pub async fn forward(
        &self,
        mut req: HttpRequest,
        request_filter: Option<RequestFilter>,
        response_filter: Option<ResponseFilter>,
    ) -> HttpResponse {
        let upstream = match self.route(&req) {
            Ok(upstream) => upstream,
            Err(err) => return forwarder_error_response(err),
        };

        if let Some(filter) = &request_filter {
            filter(&mut req);
        }

        req.set_host_if_missing(&upstream.canonical_host_header());

        let mut response = match self.perform_upstream(&req, &upstream).await {
            Ok(response) => response,
            Err(err) => forwarder_error_response(err),
        };

        if let Some(filter) = &response_filter {
            filter(&mut response);
        }
        response
    }

    /// Dispatches `forward` onto the Tokio executor, bounding concurrent
    /// in-flight forwards to `max_in_flight`. Callers either wait briefly
    /// for a free slot or, if the forwarder is shutting down, get a 503
    /// immediately.
    pub async fn forward_async(
        self: &Arc<Self>,
        req: HttpRequest,
        request_filter: Option<RequestFilter>,
        response_filter: Option<ResponseFilter>,
    ) -> HttpResponse {
        if self.stopping.load(Ordering::Acquire) {
            return forwarder_error_response(ForwarderError::ShuttingDown);
        }

        let permit = match Arc::clone(&self.in_flight).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => match tokio::time::timeout(Duration::from_millis(50), Arc::clone(&self.in_flight).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                _ => return forwarder_error_response(ForwarderError::Saturated),
            },
        };

        if self.stopping.load(Ordering::Acquire) {
            return forwarder_error_response(ForwarderError::ShuttingDown);
        }

        let forwarder = self.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            forwarder.forward(req, request_filter, response_filter).await
        });
        task.await
            .unwrap_or_else(|_| error_response(502, "Bad Gateway", "forward task panicked"))
    }

    /// Borrows a session, wires a one-shot decode handler, sends the
    /// request, and waits up to `upstream_wait` for a full response. Gives
    /// the session back on success, invalidates it on send failure or
    /// timeout.
    async fn perform_upstream(&self, req: &HttpRequest, upstream: &Upstream) -> Result<HttpResponse, ForwarderError> {
        let session = self.pool.borrow(&upstream.host, upstream.port, None).await.map_err(|e| {
            emit(
                &self.event_handler,
                EventCategory::Error,
                format!("borrow from {}:{} failed: {e}", upstream.host, upstream.port),
            );
            ForwarderError::Pool(e)
        })?;

        let buffer: Arc<SyncMutex<Vec<u8>>> = Arc::new(SyncMutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel::<Result<HttpResponse, ForwarderError>>();
        let tx = Arc::new(SyncMutex::new(Some(tx)));
        {
            let buffer = buffer.clone();
            let tx = tx.clone();
            session.set_reception_processing(Arc::new(move |chunk: &[u8]| {
                let mut buf = buffer.lock();
                buf.extend_from_slice(chunk);
                match try_decode_response(&buf) {
                    Ok(Some(response)) => {
                        if let Some(sender) = tx.lock().take() {
                            let _ = sender.send(Ok(response));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if let Some(sender) = tx.lock().take() {
                            let _ = sender.send(Err(ForwarderError::Parse(e.to_string())));
                        }
                    }
                }
            }));
        }

        if let Err(e) = session.send_request(req).await {
            session.clear_reception_processing();
            self.pool.invalidate(&upstream.host, upstream.port, session);
            return Err(ForwarderError::Pool(crate::error::ConnectionPoolError::Session(e)));
        }

        match tokio::time::timeout(self.config.upstream_wait, rx).await {
            Ok(Ok(Ok(response))) => {
                session.clear_reception_processing();
                self.pool.give_back(&upstream.host, upstream.port, session);
                Ok(response)
            }
            Ok(Ok(Err(parse_err))) => {
                session.clear_reception_processing();
                self.pool.invalidate(&upstream.host, upstream.port, session);
                Err(parse_err)
            }
            _ => {
                session.clear_reception_processing();
                self.pool.invalidate(&upstream.host, upstream.port, session);
                Err(ForwarderError::UpstreamTimeout(self.config.upstream_wait))
            }
        }
    }

    /// Stops accepting new forwards; in-flight forwards are allowed to
    /// complete. Does not touch the connection pool itself.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    /// Signals stop and waits up to `timeout` for in-flight forwards to
    /// drain, then stops the connection pool regardless. Returns whether
    /// every forward drained before the timeout.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.stop();
        let capacity = self.config.max_in_flight.max(1);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut quiescent = false;
        loop {
            if self.in_flight.available_permits() >= capacity {
                quiescent = true;
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.pool.stop().await;
        quiescent
    }
}

fn error_response(status: u16, reason: &str, detail: impl Into<String>) -> HttpResponse {
    HttpResponse::with_body(status, reason, detail.into().into_bytes())
}

/// Maps a routing/relay failure to the HTTP status a caller sees. The
/// forwarder's public surface is "always returns a response", so every
/// `ForwarderError` variant needs a status here rather than an `Err`.
fn forwarder_error_response(err: ForwarderError) -> HttpResponse {
    let status = match &err {
        ForwarderError::MissingHost => 502,
        ForwarderError::NoUpstream(_) | ForwarderError::HostDenied(_) => 403,
        ForwarderError::UpstreamTimeout(_) => 504,
        ForwarderError::Saturated => 503,
        ForwarderError::ShuttingDown => 503,
        ForwarderError::Pool(_) => 502,
        ForwarderError::Parse(_) => 502,
    };
    let reason = match status {
        403 => "Forbidden",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    };
    error_response(status, reason, err.to_string())
}

async fn resolve_first(domain: &str, port: u16) -> Option<String> {
    tokio::net::lookup_host((domain, port)).await.ok()?.next().map(|addr| addr.ip().to_string())
}
