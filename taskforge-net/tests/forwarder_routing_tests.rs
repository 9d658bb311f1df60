/// Integration tests for the forwarder routing real requests through its
/// own connection pool to live upstreams (Scenario 8: forwarder +
/// connection_pool + session + wire acting together).
use std::time::Duration;

use taskforge_net::forwarder::Forwarder;
use taskforge_net::wire::{HttpRequest, HttpResponse, Wire};
use taskforge_shared::config::{ConnectionPoolConfig, ForwarderConfig, UpstreamEntry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

async fn mock_upstream(body: &'static str) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let response = HttpResponse::with_body(200, "OK", body.as_bytes().to_vec());
                let _ = socket.write_all(response.to_wire().as_bytes()).await;
            });
        }
    });
    addr
}

fn test_config() -> (ForwarderConfig, ConnectionPoolConfig) {
    let mut forwarder_config = ForwarderConfig::default();
    forwarder_config.upstream_wait = Duration::from_secs(2);
    let mut pool_config = ConnectionPoolConfig::default();
    pool_config.min_connections = 0;
    pool_config.max_connections = 4;
    pool_config.borrow_timeout = Duration::from_millis(500);
    (forwarder_config, pool_config)
}

/// Upstreams loaded from `ForwarderConfig`-shaped entries (the config-file
/// path) route identically to ones added one at a time, and a denied host
/// is rejected before any upstream lookup or connection attempt.
#[tokio::test]
async fn test_load_upstreams_routes_and_denylist_blocks_before_lookup() {
    let addr = mock_upstream("hello").await;
    let (mut fc, pc) = test_config();
    fc.denied_hosts = vec!["blocked.local".to_string()];
    let forwarder = Forwarder::new(fc, pc, None);

    forwarder
        .load_upstreams(&[UpstreamEntry {
            domain: "svc.local".to_string(),
            ip: "127.0.0.1".to_string(),
            port: addr.port(),
            https: false,
        }])
        .await;

    let mut req = HttpRequest::new("GET", "/");
    req.headers.insert("Host", "svc.local");
    let response = forwarder.forward(req, None, None).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hello");

    let mut denied_req = HttpRequest::new("GET", "/");
    denied_req.headers.insert("Host", "blocked.local");
    let denied_response = forwarder.forward(denied_req, None, None).await;
    assert_eq!(denied_response.status, 403);
}

/// `forward_async` dispatches onto the executor and relays through the
/// pool just like `forward`, and a burst of concurrent requests against
/// the same upstream all complete successfully by sharing/recycling
/// pooled sessions rather than failing under contention.
#[tokio::test]
async fn test_forward_async_relays_concurrent_requests_through_pool() {
    let addr = mock_upstream("pong").await;
    let (fc, pc) = test_config();
    let forwarder = Forwarder::new(fc, pc, None);
    forwarder.add_upstream("svc.local", "127.0.0.1", addr.port(), false).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let forwarder = forwarder.clone();
        tasks.push(tokio::spawn(async move {
            let mut req = HttpRequest::new("GET", "/ping");
            req.headers.insert("Host", "svc.local");
            forwarder.forward_async(req, None, None).await
        }));
    }

    for task in tasks {
        let response = task.await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"pong");
    }

    forwarder.shutdown(Duration::from_secs(2)).await;
}
