//! # taskforge-net
//!
//! The session / connection-pool / forwarder layer (C6-C8): sessions are
//! stateful TCP/TLS connections with a receive-callback model running on
//! a Tokio executor; the connection pool multiplexes a bounded
//! per-endpoint population of them; the forwarder routes client requests
//! to upstreams by Host header and relays them over borrowed sessions;
//! the session manager is the registry/broadcast half of C8.
//!
//! ## Modules
//!
//! - `session`: one logical connection, TCP or TLS, client or server
//! - `connection_pool`: per-(host, port) bounded session pool
//! - `manager`: session registry, broadcast, idle cleanup
//! - `forwarder`: Host-header request routing and relay
//! - `wire`: the `Wire` trait and the HTTP/1.1 request/response types
//! - `tls`: rustls client/server config construction
//! - `error`: session/pool/forwarder error taxonomy

pub mod connection_pool;
pub mod error;
pub mod forwarder;
pub mod manager;
pub mod session;
pub mod tls;
pub mod wire;
