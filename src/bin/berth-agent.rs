//! Main entry point for the berth agent.
//!
//! Starts the control plane against the local backend with configuration
//! from environment variables.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use berth::{
    AgentServer, CachedDownloader, Config, HttpUploader, LocalBackend, Registry, Transformer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting berth agent");

    let config = Config::from_env()?;
    info!(?config, "loaded configuration");

    for dir in [&config.temp_dir, &config.cache_dir, &config.sandbox_dir] {
        tokio::fs::create_dir_all(dir).await?;
    }

    let client = reqwest::Client::new();
    let backend = Arc::new(LocalBackend::new(config.sandbox_dir.clone()));
    let transformer = Transformer::new(
        Arc::new(CachedDownloader::new(
            client.clone(),
            config.cache_dir.clone(),
        )),
        Arc::new(HttpUploader::new(client.clone())),
        client.clone(),
        config.temp_dir.clone(),
    );
    let registry = Arc::new(Registry::new(
        config.capacity,
        backend,
        transformer,
        client,
        config.callback.clone(),
    ));

    let server = AgentServer::start(config.listen_addr, Arc::clone(&registry)).await?;
    info!(
        addr = %server.addr(),
        memory_mb = config.capacity.memory_mb,
        disk_mb = config.capacity.disk_mb,
        containers = config.capacity.containers,
        "berth agent started, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // Unwind every live container before exiting.
    for record in registry.list() {
        if let Err(err) = registry.delete(&record.guid).await {
            tracing::warn!(guid = %record.guid, error = %err, "failed to delete container during shutdown");
        }
    }
    server.shutdown().await;

    Ok(())
}
