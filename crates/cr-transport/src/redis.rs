//! Redis pub/sub backend
//!
//! - `RedisConnectionPool` hands out multiplexed async connections for publishing
//! - `RedisSubscriber` drives an async `PubSub` handle and resubscribes when
//!   the subscription connection drops
//!
//! Payloads are forwarded as text. A message whose payload is not valid UTF-8
//! is logged and skipped rather than converted lossily, since replacing bytes
//! would change what workers receive.

use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Msg, RedisResult};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{Connection, ConnectionPool, EventHandler, InboundEvent, Result, Subscriber, TransportError};

pub const DEFAULT_PORT: u16 = 6379;

/// Build a Redis URL from a startup host argument.
///
/// Full URLs are used as-is; bare hosts get the default port.
pub fn redis_url(host: &str) -> String {
    if host.contains("://") {
        return host.to_string();
    }

    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6, with or without port
        return if rest.contains("]:") {
            format!("redis://{}", host)
        } else {
            format!("redis://{}:{}", host, DEFAULT_PORT)
        };
    }

    match host.matches(':').count() {
        0 => format!("redis://{}:{}", host, DEFAULT_PORT),
        1 => format!("redis://{}", host),
        _ => format!("redis://[{}]:{}", host, DEFAULT_PORT),
    }
}

fn open_client(url: &str) -> Result<Client> {
    Client::open(url).map_err(|e| TransportError::Connection(e.to_string()))
}

// ============================================================================
// Publishing
// ============================================================================

pub struct RedisConnection {
    conn: MultiplexedConnection,
}

#[async_trait]
impl Connection for RedisConnection {
    async fn ping(&mut self) -> Result<()> {
        let pong: String = ::redis::cmd("PING").query_async(&mut self.conn).await?;
        if pong != "PONG" {
            return Err(TransportError::Connection(format!("unexpected PING reply: {}", pong)));
        }
        Ok(())
    }

    async fn publish(&mut self, channel: &str, payload: &str) -> Result<()> {
        let receivers: i64 = ::redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut self.conn)
            .await?;

        debug!(channel = %channel, receivers, "Published");
        Ok(())
    }
}

/// Opens a fresh multiplexed connection per `acquire`.
pub struct RedisConnectionPool {
    client: Client,
    url: String,
}

impl RedisConnectionPool {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let client = open_client(&url)?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ConnectionPool for RedisConnectionPool {
    type Connection = RedisConnection;

    async fn acquire(&self) -> Result<RedisConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!(url = %self.url, "Acquired Redis connection");
        Ok(RedisConnection { conn })
    }

    fn discard(&self, conn: RedisConnection) {
        debug!(url = %self.url, "Discarding Redis connection");
        drop(conn);
    }
}

// ============================================================================
// Subscribing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    StreamClosed,
}

pub struct RedisSubscriber {
    client: Client,
    resubscribe_delay: Duration,
}

impl RedisSubscriber {
    pub fn new(url: &str, resubscribe_delay: Duration) -> Result<Self> {
        Ok(Self {
            client: open_client(url)?,
            resubscribe_delay,
        })
    }

    /// One subscription session, from SUBSCRIBE until the stream ends or shutdown.
    async fn session(
        &self,
        channel: &str,
        handler: &Arc<dyn EventHandler>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<SessionEnd> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        handler.on_event(InboundEvent::Subscribed { channel: channel.to_string() });
        info!(channel = %channel, "Subscribed to control channel");

        let end = {
            let mut messages = std::pin::pin!(pubsub.on_message());
            loop {
                tokio::select! {
                    msg = messages.next() => match msg {
                        Some(msg) => match to_event(&msg) {
                            Ok(event) => handler.on_event(event),
                            Err(e) => warn!(channel = %channel, error = %e, "Skipping non-text payload"),
                        },
                        None => break SessionEnd::StreamClosed,
                    },
                    _ = shutdown.recv() => break SessionEnd::Shutdown,
                }
            }
        };

        if end == SessionEnd::Shutdown {
            match pubsub.unsubscribe(channel).await {
                Ok(()) => {
                    handler.on_event(InboundEvent::Unsubscribed { channel: channel.to_string() });
                    info!(channel = %channel, "Unsubscribed from control channel");
                }
                Err(e) => warn!(channel = %channel, error = %e, "Failed to unsubscribe cleanly"),
            }
        }

        Ok(end)
    }
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn run(
        &self,
        channel: &str,
        handler: Arc<dyn EventHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            match self.session(channel, &handler, &mut shutdown).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::StreamClosed) => {
                    warn!(channel = %channel, "Subscription connection lost");
                }
                Err(e) => {
                    error!(channel = %channel, error = %e, "Subscription failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.resubscribe_delay) => {
                    info!(channel = %channel, "Resubscribing to control channel");
                }
                _ = shutdown.recv() => {
                    info!(channel = %channel, "Subscriber shutting down");
                    return Ok(());
                }
            }
        }
    }
}

fn to_event(msg: &Msg) -> RedisResult<InboundEvent> {
    let payload: String = msg.get_payload()?;
    let channel = msg.get_channel_name().to_string();

    if msg.from_pattern() {
        let pattern: String = msg.get_pattern()?;
        Ok(InboundEvent::PatternMessage { pattern, channel, payload })
    } else {
        Ok(InboundEvent::Message { channel, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(kind: &str, parts: &[&[u8]]) -> Msg {
        let mut items = vec![::redis::Value::BulkString(kind.as_bytes().to_vec())];
        items.extend(parts.iter().map(|p| ::redis::Value::BulkString(p.to_vec())));
        Msg::from_value(&::redis::Value::Array(items)).unwrap()
    }

    #[test]
    fn test_to_event_channel_message() {
        let msg = message("message", &[b"keywords", br#"{"action":"ADD"}"#]);
        assert_eq!(
            to_event(&msg).unwrap(),
            InboundEvent::Message {
                channel: "keywords".to_string(),
                payload: r#"{"action":"ADD"}"#.to_string(),
            }
        );
    }

    #[test]
    fn test_to_event_pattern_message() {
        let msg = message("pmessage", &[b"keywords_*", b"keywords_1", b"{}"]);
        assert_eq!(
            to_event(&msg).unwrap(),
            InboundEvent::PatternMessage {
                pattern: "keywords_*".to_string(),
                channel: "keywords_1".to_string(),
                payload: "{}".to_string(),
            }
        );
    }

    #[test]
    fn test_to_event_rejects_non_utf8_payload() {
        let msg = message("message", &[b"keywords", &[0xff, 0xfe, b'{']]);
        assert!(to_event(&msg).is_err());
    }

    #[test]
    fn test_redis_url_from_bare_host() {
        assert_eq!(redis_url("localhost"), "redis://localhost:6379");
        assert_eq!(redis_url("10.0.0.5"), "redis://10.0.0.5:6379");
    }

    #[test]
    fn test_redis_url_with_port() {
        assert_eq!(redis_url("cache.internal:6380"), "redis://cache.internal:6380");
        assert_eq!(redis_url("[::1]:6380"), "redis://[::1]:6380");
    }

    #[test]
    fn test_redis_url_ipv6_without_port() {
        assert_eq!(redis_url("::1"), "redis://[::1]:6379");
        assert_eq!(redis_url("[::1]"), "redis://[::1]:6379");
    }

    #[test]
    fn test_redis_url_passthrough() {
        assert_eq!(redis_url("redis://user:pw@host:1234/2"), "redis://user:pw@host:1234/2");
        assert_eq!(redis_url("rediss://secure:6379"), "rediss://secure:6379");
    }

    #[test]
    fn test_pool_rejects_invalid_url() {
        assert!(RedisConnectionPool::new("not a url").is_err());
    }

    #[test]
    fn test_pool_accepts_url_without_connecting() {
        let pool = RedisConnectionPool::new(redis_url("localhost")).unwrap();
        assert_eq!(pool.url(), "redis://localhost:6379");
    }
}
