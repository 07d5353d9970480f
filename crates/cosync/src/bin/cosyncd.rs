//! Collaboration daemon: HTTP reconciliation API plus WebSocket relay.
//!
//! Configured through the environment: `COSYNC_BIND_ADDRESS`,
//! `COSYNC_HTTP_PORT`, `COSYNC_RELAY_PORT` and (for a durable operation
//! log) `COSYNC_DATA_DIR`. Without a data directory the daemon runs on an
//! in-memory store. Shuts down on ctrl-c.

use anyhow::Context;
use cosync::presence::MemoryPresenceStore;
use cosync::server::auth::{AcceptAllAuthProvider, AllowAllPolicy};
use cosync::server::{router, RelayServer, ServerConfig, ServerContext};
use cosync::store::{FileOperationStore, MemoryOperationStore, OperationStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();

    let store: Arc<dyn OperationStore> = match std::env::var("COSYNC_DATA_DIR") {
        Ok(dir) => {
            tracing::info!("Using file-backed operation store at {}", dir);
            Arc::new(FileOperationStore::open(&dir).with_context(|| {
                format!("failed to open operation store at {dir}")
            })?)
        }
        Err(_) => {
            tracing::info!("COSYNC_DATA_DIR not set, using in-memory operation store");
            Arc::new(MemoryOperationStore::new())
        }
    };

    let context = ServerContext::new(
        Arc::clone(&store),
        Arc::new(MemoryPresenceStore::new()),
        AcceptAllAuthProvider,
        AllowAllPolicy,
    );

    let listener = tokio::net::TcpListener::bind(config.http_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr()))?;
    tracing::info!("HTTP API listening on {}", config.http_addr());

    let relay = RelayServer::new(config, Arc::clone(&store));
    let shutdown = relay.shutdown_handle();

    let http = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router(context)).await {
            tracing::error!("HTTP server failed: {}", err);
        }
    });
    let relay_task = tokio::spawn(async move {
        if let Err(err) = relay.run().await {
            tracing::error!("Relay failed: {}", err);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to install ctrl-c handler")?;
    tracing::info!("Shutdown signal received");

    shutdown.shutdown();
    http.abort();
    let _ = relay_task.await;

    tracing::info!("Daemon stopped");
    Ok(())
}
