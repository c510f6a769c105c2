//! objnbd Gateway
//!
//! Serves object-backed block volumes to NBD clients. Each export name maps
//! to a backend volume; byte-range I/O is translated into whole-object
//! get/put calls against the configured backend.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use objnbd_block::{AttachmentRegistry, MemoryBackend, ObjectBackend};
use objnbd_common::{BackendKind, GatewayConfig, VolumeConfig};
use objnbd_nbd::NbdServer;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "objnbd-gateway", about = "Object-backed NBD gateway")]
struct Args {
    /// JSON configuration file; flags below override it
    #[arg(long, env = "OBJNBD_CONFIG")]
    config: Option<PathBuf>,

    /// NBD TCP listen address
    #[arg(long, env = "OBJNBD_LISTEN")]
    listen: Option<SocketAddr>,

    /// Volume (export) name to serve
    #[arg(long)]
    volume: Option<String>,

    /// Backend object size in bytes
    #[arg(long)]
    object_size: Option<u64>,

    /// Volume capacity in bytes
    #[arg(long)]
    capacity: Option<u64>,

    /// Artificial latency per backend call in milliseconds
    #[arg(long)]
    latency_ms: Option<u64>,

    /// Largest accepted request length in bytes
    #[arg(long)]
    max_transfer_size: Option<u32>,

    /// Outstanding requests per connection before reading pauses
    #[arg(long)]
    max_inflight: Option<usize>,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, env = "OBJNBD_LOG", default_value = "info")]
    log_level: String,
}

impl Args {
    /// Load the config file (or defaults) and apply flag overrides.
    fn gateway_config(&self) -> Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::load(path)
                .with_context(|| format!("load config {}", path.display()))?,
            None => GatewayConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen.nbd = listen;
        }
        if let Some(latency) = self.latency_ms {
            config.backend.latency_ms = latency;
        }
        if let Some(max) = self.max_transfer_size {
            config.connector.max_transfer_size = max;
        }
        if let Some(max) = self.max_inflight {
            config.connector.max_inflight_requests = max;
        }

        // Any volume flag replaces the configured list with one volume
        if self.volume.is_some() || self.object_size.is_some() || self.capacity.is_some() {
            let base = config.backend.volumes.first().cloned().unwrap_or_default();
            config.backend.volumes = vec![VolumeConfig {
                name: self.volume.clone().unwrap_or(base.name),
                object_size: self.object_size.unwrap_or(base.object_size),
                capacity: self.capacity.unwrap_or(base.capacity),
            }];
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting objnbd gateway");
    let config = args.gateway_config()?;

    // ── Backend ───────────────────────────────────────────────────────────────
    let backend: Arc<dyn ObjectBackend> = match config.backend.kind {
        BackendKind::Memory => Arc::new(MemoryBackend::from_config(
            &config.backend.volumes,
            Duration::from_millis(config.backend.latency_ms),
        )),
    };

    // ── NBD server ────────────────────────────────────────────────────────────
    let registry = Arc::new(AttachmentRegistry::new(
        backend,
        config.connector.domain.clone(),
    ));
    let server = NbdServer::new(config.connector.clone(), registry);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => warn!("Ctrl-C handler failed: {e}"),
        }
        let _ = shutdown_tx.send(true);
    });

    info!("NBD server on {}", config.listen.nbd);
    server
        .serve(config.listen.nbd, shutdown_rx)
        .await
        .context("NBD server error")?;

    info!("objnbd gateway stopped");
    Ok(())
}
