//! Shared mock transport for relay tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cr_transport::{
    Connection, ConnectionPool, EventHandler, InboundEvent, Subscriber, TransportError,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

/// A publish observed by the mock transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub connection: u32,
    pub channel: String,
    pub payload: String,
}

/// State shared by the mock pool and every connection it hands out
#[derive(Default)]
pub struct MockTransport {
    next_id: AtomicU32,
    published: Mutex<Vec<Published>>,
    dead: Mutex<HashSet<u32>>,
    hanging: Mutex<HashSet<u32>>,
    discarded: Mutex<Vec<u32>>,
    acquire_failures: AtomicU32,
    publish_failures: AtomicU32,
    publish_panics: AtomicU32,
    acquired: AtomicU32,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub fn channels(&self) -> Vec<String> {
        self.published.lock().iter().map(|p| p.channel.clone()).collect()
    }

    /// Make a connection fail its liveness probe and publishes
    pub fn kill(&self, connection: u32) {
        self.dead.lock().insert(connection);
    }

    /// Make a connection's probe hang forever
    pub fn hang(&self, connection: u32) {
        self.hanging.lock().insert(connection);
    }

    pub fn fail_next_acquires(&self, count: u32) {
        self.acquire_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.publish_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` publishes panic instead of returning
    pub fn panic_next_publishes(&self, count: u32) {
        self.publish_panics.store(count, Ordering::SeqCst);
    }

    pub fn discarded(&self) -> Vec<u32> {
        self.discarded.lock().clone()
    }

    pub fn acquired(&self) -> u32 {
        self.acquired.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct MockConnection {
    pub id: u32,
    transport: Arc<MockTransport>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn ping(&mut self) -> cr_transport::Result<()> {
        let hanging = self.transport.hanging.lock().contains(&self.id);
        if hanging {
            std::future::pending::<()>().await;
        }
        let dead = self.transport.dead.lock().contains(&self.id);
        if dead {
            return Err(TransportError::Connection(format!("connection {} is dead", self.id)));
        }
        Ok(())
    }

    async fn publish(&mut self, channel: &str, payload: &str) -> cr_transport::Result<()> {
        if MockTransport::take_failure(&self.transport.publish_panics) {
            panic!("publish to {} blew up", channel);
        }
        let dead = self.transport.dead.lock().contains(&self.id);
        if dead || MockTransport::take_failure(&self.transport.publish_failures) {
            return Err(TransportError::Connection("publish failed".to_string()));
        }

        self.transport.published.lock().push(Published {
            connection: self.id,
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}

pub struct MockPool {
    transport: Arc<MockTransport>,
}

impl MockPool {
    pub fn new(transport: Arc<MockTransport>) -> Arc<Self> {
        Arc::new(Self { transport })
    }
}

#[async_trait]
impl ConnectionPool for MockPool {
    type Connection = MockConnection;

    async fn acquire(&self) -> cr_transport::Result<MockConnection> {
        if MockTransport::take_failure(&self.transport.acquire_failures) {
            return Err(TransportError::Connection("pool exhausted".to_string()));
        }

        self.transport.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id: self.transport.next_id.fetch_add(1, Ordering::SeqCst),
            transport: self.transport.clone(),
        })
    }

    fn discard(&self, conn: MockConnection) {
        self.transport.discarded.lock().push(conn.id);
    }
}

/// Subscriber that exposes the registered handler so tests can inject events
#[derive(Default)]
pub struct MockSubscriber {
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
    subscribed: Notify,
    channels: Mutex<Vec<String>>,
    unsubscribed: Mutex<Vec<String>>,
}

impl MockSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait until `run` has registered its handler
    pub async fn handler(&self) -> Arc<dyn EventHandler> {
        loop {
            let notified = self.subscribed.notified();
            let registered = self.handler.lock().clone();
            if let Some(handler) = registered {
                return handler;
            }
            notified.await;
        }
    }

    /// Deliver a message as the transport would
    pub async fn deliver(&self, channel: &str, payload: &str) {
        self.handler().await.on_event(InboundEvent::Message {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.channels.lock().clone()
    }

    pub fn unsubscribed_channels(&self) -> Vec<String> {
        self.unsubscribed.lock().clone()
    }
}

#[async_trait]
impl Subscriber for MockSubscriber {
    async fn run(
        &self,
        channel: &str,
        handler: Arc<dyn EventHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> cr_transport::Result<()> {
        self.channels.lock().push(channel.to_string());
        handler.on_event(InboundEvent::Subscribed { channel: channel.to_string() });
        *self.handler.lock() = Some(handler.clone());
        self.subscribed.notify_waiters();

        let _ = shutdown.recv().await;

        handler.on_event(InboundEvent::Unsubscribed { channel: channel.to_string() });
        self.unsubscribed.lock().push(channel.to_string());
        // Release the listener so the dispatch queue can close
        *self.handler.lock() = None;
        Ok(())
    }
}

/// Poll `condition` until it holds or `limit` elapses
pub async fn eventually<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
