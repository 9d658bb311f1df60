//! # taskforge-net
//!
//! Standalone bootstrap for the session/forwarder layer: loads
//! configuration, registers upstreams, and blocks until a shutdown
//! signal arrives. Most consumers embed `taskforge-net` as a library
//! instead (see the crate's module docs); this binary exists for
//! smoke-testing a forwarder configuration standalone.
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taskforge_net::forwarder::Forwarder;
use taskforge_shared::config::RuntimeConfig;
use taskforge_shared::events::{ClosureEventHandler, EventHandler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskforge_net=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("taskforge-net v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = RuntimeConfig::load()?;
    let event_handler: Arc<dyn EventHandler> = Arc::new(ClosureEventHandler::new(|event| {
        tracing::info!(category = %event.category, "{}", event.message);
    }));

    let forwarder = Forwarder::new(
        config.forwarder.clone(),
        config.connection_pool.clone(),
        Some(event_handler),
    );
    forwarder.load_upstreams(&config.forwarder.upstreams).await;
    tracing::info!(upstreams = config.forwarder.upstreams.len(), "forwarder ready");

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutdown signal received, draining forwarder");
    let quiescent = forwarder.shutdown(Duration::from_secs(15)).await;
    if !quiescent {
        tracing::warn!("forwarder shutdown timed out before in-flight forwards drained; forced stop");
    }

    Ok(())
}
