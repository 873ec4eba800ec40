//! ControlRelay Transport
//!
//! The seam between the relay core and the pub/sub transport:
//! - `Connection` / `ConnectionPool`: publishing side, health-checked before use
//! - `Subscriber` / `EventHandler`: callback-driven delivery of inbound events
//!
//! The Redis backend lives in [`redis`] (enabled by default).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub mod error;

#[cfg(feature = "redis")]
pub mod redis;

pub use error::TransportError;

pub type Result<T> = std::result::Result<T, TransportError>;

/// An event delivered by the transport on its own delivery context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A message published on a directly subscribed channel
    Message { channel: String, payload: String },
    /// A message matched through a pattern subscription
    PatternMessage { pattern: String, channel: String, payload: String },
    /// Subscription acknowledgement
    Subscribed { channel: String },
    /// Unsubscription acknowledgement
    Unsubscribed { channel: String },
}

/// Callback invoked by a [`Subscriber`] for every inbound event.
///
/// Runs synchronously on the transport's delivery path and must return
/// without blocking.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: InboundEvent);
}

/// A live handle to the transport used for publishing
#[async_trait]
pub trait Connection: Send {
    /// Lightweight liveness probe
    async fn ping(&mut self) -> Result<()>;

    /// Publish a payload verbatim to a channel
    async fn publish(&mut self, channel: &str, payload: &str) -> Result<()>;
}

/// Source of fresh transport connections
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    type Connection: Connection;

    /// Acquire a new connection
    async fn acquire(&self) -> Result<Self::Connection>;

    /// Return a connection that failed its health check.
    /// Default implementation just drops it.
    fn discard(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Subscribes to a single channel and feeds events to a handler
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe to `channel` and deliver events to `handler` until `shutdown` fires.
    async fn run(
        &self,
        channel: &str,
        handler: Arc<dyn EventHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<()>;
}

/// Bound a transport operation by `limit`, mapping expiry to [`TransportError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}
