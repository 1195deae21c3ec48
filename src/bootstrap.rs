//! Process-entry wiring for a host program embedding the mesh core: tracing
//! init, config load, metrics install, then start registration + discovery +
//! pool and block until a shutdown signal arrives.
//!
//! Shape: init -> connect -> start long-lived tasks -> wait for signal ->
//! graceful close.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::MeshConfig;
use crate::discovery::DiscoveryClient;
use crate::etcd::EtcdClient;
use crate::metrics::Metrics;
use crate::pool::ConnectionPool;
use crate::registration::{NoopHost, RegistrationAgent, SignalTag};

pub struct BootstrapArgs {
    pub config_path: PathBuf,
}

/// Bring up the mesh core for a host process and run until SIGINT/SIGTERM
/// or a terminal registration failure.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();
    let _metrics = Metrics::install();

    let config = MeshConfig::load(&args.config_path)?;
    let etcd = EtcdClient::connect(&config.etcd).await?;

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<SignalTag>();
    let agent = RegistrationAgent::with_signal(
        etcd.clone(),
        config.registration.clone(),
        Arc::new(NoopHost),
        Some(signal_tx),
    );
    agent.start().await?;
    tracing::info!(key = %agent.key(), "bootstrap: registration agent started");

    let discovery = DiscoveryClient::new(etcd, &config.discovery);
    discovery.start().await?;
    tracing::info!("bootstrap: discovery client started");

    let pool = ConnectionPool::new(config.pool.clone(), Arc::clone(&discovery), None);
    pool.start_reaper();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("bootstrap: ctrl-c received, shutting down");
        }
        tag = signal_rx.recv() => {
            tracing::warn!(?tag, "bootstrap: agent-initiated shutdown signal received");
        }
    }

    agent.close().await;
    discovery.close();
    pool.close();
    tracing::info!("bootstrap: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(guard);
}
