//! Dispatcher - the relay's core loop
//!
//! For every queued payload:
//! 1. Decode it (drop on failure)
//! 2. Route it: DELETE goes to `<base>_*`, everything else round-robins to `<base>_<i>`
//! 3. Probe the connection, replacing it from the pool if the probe fails
//! 4. Publish the raw payload to the target channel
//!
//! At most one reconnect is attempted per message. No single message can
//! stop the loop; only the shutdown signal or a closed queue does.

use std::num::NonZeroU32;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cr_common::ControlMessage;
use cr_transport::{with_timeout, Connection, ConnectionPool, TransportError};
use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::queue::QueueReceiver;
use crate::routing::{Router, WorkerTarget};

/// Configuration for the dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Base name of the worker channels
    pub base_channel: String,
    /// Number of worker channels
    pub workers: NonZeroU32,
    /// Upper bound on each probe, acquire and publish call
    pub io_timeout: Duration,
}

impl DispatcherConfig {
    pub fn new(base_channel: impl Into<String>, workers: NonZeroU32) -> Self {
        Self {
            base_channel: base_channel.into(),
            workers,
            io_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }
}

/// Why a message was not published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Payload could not be decoded
    Decode,
    /// The connection was dead and no replacement could be acquired
    Reconnect,
    /// Publishing failed even after reconnecting
    Publish,
    /// Dispatching panicked
    Panic,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Decode => "decode",
            DropReason::Reconnect => "reconnect",
            DropReason::Publish => "publish",
            DropReason::Panic => "panic",
        }
    }
}

/// Result of dispatching a single payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Published { target: WorkerTarget, channel: String },
    Dropped(DropReason),
}

/// Counters shared between the dispatcher task and its observers
#[derive(Debug, Default)]
pub struct DispatcherStats {
    unicast: AtomicU64,
    broadcast: AtomicU64,
    dropped_decode: AtomicU64,
    dropped_reconnect: AtomicU64,
    dropped_publish: AtomicU64,
    dropped_panic: AtomicU64,
    reconnects: AtomicU64,
    failed_reconnects: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub unicast: u64,
    pub broadcast: u64,
    pub dropped_decode: u64,
    pub dropped_reconnect: u64,
    pub dropped_publish: u64,
    pub dropped_panic: u64,
    pub reconnects: u64,
    pub failed_reconnects: u64,
}

impl StatsSnapshot {
    pub fn published(&self) -> u64 {
        self.unicast + self.broadcast
    }

    pub fn dropped(&self) -> u64 {
        self.dropped_decode + self.dropped_reconnect + self.dropped_publish + self.dropped_panic
    }
}

impl DispatcherStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            unicast: self.unicast.load(Ordering::Relaxed),
            broadcast: self.broadcast.load(Ordering::Relaxed),
            dropped_decode: self.dropped_decode.load(Ordering::Relaxed),
            dropped_reconnect: self.dropped_reconnect.load(Ordering::Relaxed),
            dropped_publish: self.dropped_publish.load(Ordering::Relaxed),
            dropped_panic: self.dropped_panic.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            failed_reconnects: self.failed_reconnects.load(Ordering::Relaxed),
        }
    }

    fn record_published(&self, target: WorkerTarget) {
        match target {
            WorkerTarget::Worker(_) => self.unicast.fetch_add(1, Ordering::Relaxed),
            WorkerTarget::Broadcast => self.broadcast.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_dropped(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Decode => &self.dropped_decode,
            DropReason::Reconnect => &self.dropped_reconnect,
            DropReason::Publish => &self.dropped_publish,
            DropReason::Panic => &self.dropped_panic,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Dispatcher<P: ConnectionPool> {
    config: DispatcherConfig,
    router: Router,
    pool: Arc<P>,
    /// `None` after a failed reconnect; treated as a failed probe.
    conn: Option<P::Connection>,
    queue: QueueReceiver,
    stats: Arc<DispatcherStats>,
}

impl<P: ConnectionPool> Dispatcher<P> {
    pub fn new(
        config: DispatcherConfig,
        pool: Arc<P>,
        conn: P::Connection,
        queue: QueueReceiver,
    ) -> Self {
        Self {
            router: Router::new(config.workers),
            config,
            pool,
            conn: Some(conn),
            queue,
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        self.stats.clone()
    }

    /// Run until `shutdown` fires or the queue closes.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            base_channel = %self.config.base_channel,
            workers = self.config.workers.get(),
            "Dispatcher started"
        );

        loop {
            let raw = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Dispatcher shutting down");
                    break;
                }
                raw = self.queue.take() => match raw {
                    Some(raw) => raw,
                    None => {
                        info!("Dispatch queue closed - dispatcher stopping");
                        break;
                    }
                },
            };

            if let Err(panic) = AssertUnwindSafe(self.dispatch(raw)).catch_unwind().await {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(panic = %detail, "Dispatch panicked, message dropped");
                self.dropped(DropReason::Panic);
            }
        }

        self.queue.close();
        let snapshot = self.stats.snapshot();
        info!(
            published = snapshot.published(),
            dropped = snapshot.dropped(),
            reconnects = snapshot.reconnects,
            "Dispatcher stopped"
        );
    }

    /// Decode, route, health-check and publish one raw payload.
    pub async fn dispatch(&mut self, raw: String) -> DispatchOutcome {
        let message = match ControlMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable control message");
                return self.dropped(DropReason::Decode);
            }
        };

        let target = self.router.route(message.action());
        let channel = target.channel(&self.config.base_channel);
        let mut reconnected = false;

        if let Err(e) = self.probe().await {
            warn!(error = %e, "Connection failed health check - reconnecting");
            if let Err(e) = self.reconnect().await {
                error!(channel = %channel, error = %e, "Reconnect failed - dropping message");
                return self.dropped(DropReason::Reconnect);
            }
            reconnected = true;
        }

        match self.publish(&channel, message.payload()).await {
            Ok(()) => return self.published(target, channel),
            Err(e) if reconnected => {
                error!(channel = %channel, error = %e, "Publish failed on fresh connection - dropping message");
                return self.dropped(DropReason::Publish);
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Publish failed - reconnecting and retrying once");
            }
        }

        if let Err(e) = self.reconnect().await {
            error!(channel = %channel, error = %e, "Reconnect failed - dropping message");
            return self.dropped(DropReason::Reconnect);
        }

        match self.publish(&channel, message.payload()).await {
            Ok(()) => self.published(target, channel),
            Err(e) => {
                error!(channel = %channel, error = %e, "Publish retry failed - dropping message");
                self.dropped(DropReason::Publish)
            }
        }
    }

    async fn probe(&mut self) -> Result<(), TransportError> {
        let limit = self.config.io_timeout;
        match self.conn.as_mut() {
            Some(conn) => with_timeout(limit, conn.ping()).await,
            None => Err(TransportError::Closed),
        }
    }

    async fn publish(&mut self, channel: &str, payload: &str) -> Result<(), TransportError> {
        let limit = self.config.io_timeout;
        match self.conn.as_mut() {
            Some(conn) => with_timeout(limit, conn.publish(channel, payload)).await,
            None => Err(TransportError::Closed),
        }
    }

    /// Discard the current connection and acquire a new one.
    async fn reconnect(&mut self) -> Result<(), TransportError> {
        if let Some(old) = self.conn.take() {
            self.pool.discard(old);
        }

        match with_timeout(self.config.io_timeout, self.pool.acquire()).await {
            Ok(conn) => {
                self.conn = Some(conn);
                self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                metrics::record_reconnect(true);
                info!("Acquired fresh transport connection");
                Ok(())
            }
            Err(e) => {
                self.stats.failed_reconnects.fetch_add(1, Ordering::Relaxed);
                metrics::record_reconnect(false);
                Err(e)
            }
        }
    }

    fn published(&self, target: WorkerTarget, channel: String) -> DispatchOutcome {
        debug!(channel = %channel, target = %target, "Dispatched control message");
        self.stats.record_published(target);
        metrics::record_published(target.kind());
        DispatchOutcome::Published { target, channel }
    }

    fn dropped(&self, reason: DropReason) -> DispatchOutcome {
        self.stats.record_dropped(reason);
        metrics::record_dropped(reason.as_str());
        DispatchOutcome::Dropped(reason)
    }
}
