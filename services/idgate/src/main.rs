//! idgate
//!
//! Transparent TCP proxy that routes by device ID.
//!
//! This service:
//! - Loads route mappings from a JSON file
//! - Resolves every backend endpoint once at startup
//! - Listens on each distinct listen port (dual-stack)
//! - Reads the 7-byte device header from each client
//! - Replays the header to the chosen backend and splices both streams

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use idgate::config::Config;
use idgate::mappings::{build_route_table, MappingsFile};
use idgate::proxy::serve;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to IDGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting idgate");

    let specs = MappingsFile::new(&config.routes_file).load()?;

    // Endpoint resolution blocks; keep it off the runtime threads.
    let (table, skipped) = tokio::task::spawn_blocking(move || build_route_table(specs))
        .await
        .context("Route table construction panicked")?;

    if table.is_empty() {
        bail!(
            "No usable route mappings in {} ({} skipped)",
            config.routes_file.display(),
            skipped.len()
        );
    }

    let table = Arc::new(table);
    let mut listeners = JoinSet::new();

    for port in table.ports() {
        let listener_config = config.listener_config(port);
        let table = Arc::clone(&table);
        listeners.spawn(async move {
            let bind_addr = listener_config.bind_addr;
            if let Err(e) = serve(listener_config, table).await {
                error!(bind_addr = %bind_addr, error = %e, "Listener error");
            }
        });
    }

    info!(listener_count = listeners.len(), "Listeners started");

    supervise(&mut listeners).await
}

/// Wait for Ctrl-C. Losing every listener before that is a failure.
async fn supervise(listeners: &mut JoinSet<()>) -> Result<()> {
    loop {
        tokio::select! {
            joined = listeners.join_next() => match joined {
                Some(Ok(())) => {}
                Some(Err(e)) => error!(error = %e, "Listener task failed"),
                None => bail!("All listeners stopped"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                listeners.shutdown().await;
                return Ok(());
            }
        }
    }
}
