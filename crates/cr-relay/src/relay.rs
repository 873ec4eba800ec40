//! Relay wiring
//!
//! Connects the pieces: subscriber → listener → dispatch queue → dispatcher,
//! and owns the shutdown signal that stops both tasks.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use cr_transport::{with_timeout, ConnectionPool, EventHandler, Subscriber};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats, StatsSnapshot};
use crate::listener::InboundListener;
use crate::queue::dispatch_queue;
use crate::{RelayError, Result};

/// Configuration for a relay instance
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Control channel to subscribe to; also the base of the worker channel names
    pub base_channel: String,
    /// Number of worker channels
    pub workers: NonZeroU32,
    /// Upper bound on each transport call made by the dispatcher
    pub io_timeout: Duration,
    /// Grace period for tasks to finish after shutdown is signalled
    pub shutdown_timeout: Duration,
}

impl RelayConfig {
    pub fn new(base_channel: impl Into<String>, workers: u32) -> Result<Self> {
        let base_channel = base_channel.into();
        if base_channel.trim().is_empty() {
            return Err(RelayError::Config("base channel name cannot be empty".to_string()));
        }
        let workers = NonZeroU32::new(workers)
            .ok_or_else(|| RelayError::Config("worker count must be at least 1".to_string()))?;

        Ok(Self {
            base_channel,
            workers,
            io_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
        })
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::new(self.base_channel.clone(), self.workers)
            .with_io_timeout(self.io_timeout)
    }
}

pub struct Relay<P, S> {
    config: RelayConfig,
    pool: Arc<P>,
    subscriber: Arc<S>,
}

impl<P, S> Relay<P, S>
where
    P: ConnectionPool + 'static,
    S: Subscriber + 'static,
{
    pub fn new(config: RelayConfig, pool: Arc<P>, subscriber: Arc<S>) -> Self {
        Self { config, pool, subscriber }
    }

    /// Acquire the initial connection and spawn the subscriber and dispatcher tasks.
    ///
    /// Fails if the initial connection cannot be acquired.
    pub async fn start(self) -> Result<RelayHandle> {
        let conn = with_timeout(self.config.io_timeout, self.pool.acquire()).await?;

        let (queue_tx, queue_rx) = dispatch_queue();
        let listener: Arc<dyn EventHandler> =
            Arc::new(InboundListener::new(self.config.base_channel.clone(), queue_tx));
        let (shutdown_tx, _) = broadcast::channel(1);

        let dispatcher = Dispatcher::new(
            self.config.dispatcher_config(),
            self.pool.clone(),
            conn,
            queue_rx,
        );
        let stats = dispatcher.stats();
        let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_tx.subscribe()));

        let subscriber_task = {
            let subscriber = self.subscriber.clone();
            let channel = self.config.base_channel.clone();
            let shutdown_rx = shutdown_tx.subscribe();

            tokio::spawn(async move {
                if let Err(e) = subscriber.run(&channel, listener, shutdown_rx).await {
                    error!(channel = %channel, error = %e, "Subscriber stopped with error");
                }
            })
        };

        info!(
            channel = %self.config.base_channel,
            workers = self.config.workers.get(),
            "Relay started"
        );

        Ok(RelayHandle {
            shutdown_tx,
            dispatcher_task,
            subscriber_task,
            stats,
            shutdown_timeout: self.config.shutdown_timeout,
        })
    }
}

/// Handle to a running relay.
///
/// Dropping it without calling [`RelayHandle::shutdown`] also stops both tasks.
pub struct RelayHandle {
    shutdown_tx: broadcast::Sender<()>,
    dispatcher_task: JoinHandle<()>,
    subscriber_task: JoinHandle<()>,
    stats: Arc<DispatcherStats>,
    shutdown_timeout: Duration,
}

impl RelayHandle {
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether the dispatcher is still consuming the queue
    pub fn is_running(&self) -> bool {
        !self.dispatcher_task.is_finished()
    }

    /// Signal shutdown, unsubscribe, and wait for both tasks.
    ///
    /// Tasks still running after the grace period are aborted.
    pub async fn shutdown(self) -> Result<StatsSnapshot> {
        let RelayHandle {
            shutdown_tx,
            dispatcher_task,
            subscriber_task,
            stats,
            shutdown_timeout,
        } = self;

        info!("Shutting down relay");
        let _ = shutdown_tx.send(());

        let dispatcher_abort = dispatcher_task.abort_handle();
        let subscriber_abort = subscriber_task.abort_handle();

        let joined = tokio::time::timeout(shutdown_timeout, async move {
            let (dispatcher, subscriber) = tokio::join!(dispatcher_task, subscriber_task);
            dispatcher?;
            subscriber?;
            Ok::<_, RelayError>(())
        })
        .await;

        match joined {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout = ?shutdown_timeout, "Relay tasks did not stop in time - aborting");
                dispatcher_abort.abort();
                subscriber_abort.abort();
            }
        }

        let snapshot = stats.snapshot();
        info!(
            published = snapshot.published(),
            dropped = snapshot.dropped(),
            "Relay stopped"
        );
        Ok(snapshot)
    }
}
