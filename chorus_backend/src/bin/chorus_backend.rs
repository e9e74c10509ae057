use std::sync::Arc;

use anyhow::{Context, Result};
use chorus_backend::config::EngineConfig;
use chorus_backend::engine::PersonaEngineBuilder;
use chorus_backend::server::serve_backend;
use flume::unbounded;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chorus_backend=debug")),
        )
        .init();

    let config = EngineConfig::load();
    let (event_tx, event_rx) = unbounded();
    let engine = PersonaEngineBuilder::new(config)
        .with_event_sender(event_tx)
        .build()
        .context("failed to bootstrap persona engine")?;

    tracing::info!(
        "Starting chorus backend (set CHORUS_BACKEND_TOKEN + optional CHORUS_BACKEND_BIND; auth mode via CHORUS_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(Arc::new(engine), event_rx))
}
