#![forbid(unsafe_code)]

mod config;
mod error;
mod media;
mod metrics;
mod room;
mod signaling;

use anyhow::Result;
use config::Config;
use media::WorkerPool;
use metrics::Metrics;
use room::RoomRegistry;
use signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conclave=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Conclave - starting SFU signaling coordinator");

    let config = Arc::new(Config::from_env());
    if config.announced_ip.is_none() {
        info!("No ANNOUNCED_IP set; peers behind NAT will not reach this host");
    }

    let worker_pool = Arc::new(WorkerPool::new(&config).await?);
    info!("Worker pool ready ({} workers)", worker_pool.len());

    let metrics = Metrics::new();
    let registry = RoomRegistry::new(worker_pool, config.clone(), metrics.clone());

    let server = SignalingServer::new(registry.clone(), metrics);

    tokio::select! {
        result = server.serve(config.listen_port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            registry.shutdown().await;
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
