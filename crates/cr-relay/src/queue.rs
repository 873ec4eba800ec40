//! Dispatch Queue
//!
//! Unbounded FIFO hand-off from the listener (delivery context) to the
//! dispatcher task. Single producer, single consumer.

use tokio::sync::mpsc;

/// Create a connected sender/receiver pair
pub fn dispatch_queue() -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueSender { tx }, QueueReceiver { rx })
}

#[derive(Debug)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<String>,
}

impl QueueSender {
    /// Enqueue a raw payload without blocking.
    ///
    /// Returns `false` if the consumer side has been dropped.
    pub fn push(&self, raw: String) -> bool {
        self.tx.send(raw).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<String>,
}

impl QueueReceiver {
    /// Wait for the next payload. `None` once every sender is gone and the queue is drained.
    pub async fn take(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Stop accepting new payloads; already queued ones can still be taken.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
