//! ControlRelay
//!
//! Subscribes to a control channel on Redis and republishes every message
//! round-robin across `<BASE_CHANNEL>_1 .. <BASE_CHANNEL>_<WORKERS>`. Messages
//! whose `action` is `DELETE` go to `<BASE_CHANNEL>_*` for all workers.
//!
//! ```text
//! cr-relay <HOST> <BASE_CHANNEL> <WORKERS>
//! ```
//!
//! Runs until Ctrl+C / SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cr_relay::{Relay, RelayConfig};
use cr_transport::redis::{redis_url, RedisConnectionPool, RedisSubscriber};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cr-relay")]
#[command(about = "Fans control messages out from one channel to a fixed set of worker channels")]
struct Args {
    /// Transport host: `host`, `host:port` or a full redis:// URL
    host: String,

    /// Control channel to subscribe to; worker channels are named <BASE_CHANNEL>_<n>
    base_channel: String,

    /// Number of worker channels
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    workers: u32,

    /// Timeout for each probe, connect and publish call, in milliseconds
    #[arg(long, env = "CR_IO_TIMEOUT_MS", default_value = "5000")]
    io_timeout_ms: u64,

    /// Delay before resubscribing after the subscription connection drops
    #[arg(long, env = "CR_RESUBSCRIBE_DELAY_MS", default_value = "1000")]
    resubscribe_delay_ms: u64,

    /// Grace period for in-flight work on shutdown, in seconds
    #[arg(long, env = "CR_SHUTDOWN_TIMEOUT_SECS", default_value = "10")]
    shutdown_timeout_secs: u64,

    /// Expose Prometheus metrics on this port
    #[arg(long, env = "CR_METRICS_PORT")]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    cr_common::logging::init_logging("cr-relay");

    let args = Args::parse();

    let url = redis_url(&args.host);
    info!(
        url = %url,
        channel = %args.base_channel,
        workers = args.workers,
        "Starting ControlRelay"
    );

    if let Some(port) = args.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(port, "Metrics exporter listening on /metrics");
    }

    let config = RelayConfig::new(args.base_channel.clone(), args.workers)?
        .with_io_timeout(Duration::from_millis(args.io_timeout_ms))
        .with_shutdown_timeout(Duration::from_secs(args.shutdown_timeout_secs));

    let pool = Arc::new(RedisConnectionPool::new(url.clone())?);
    let subscriber = Arc::new(RedisSubscriber::new(
        &url,
        Duration::from_millis(args.resubscribe_delay_ms),
    )?);

    let handle = Relay::new(config, pool, subscriber)
        .start()
        .await
        .context("failed to connect to transport")?;

    info!("ControlRelay started. Press Ctrl+C to shutdown.");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let stats = handle.shutdown().await?;
    info!(
        unicast = stats.unicast,
        broadcast = stats.broadcast,
        dropped = stats.dropped(),
        reconnects = stats.reconnects,
        "ControlRelay shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
