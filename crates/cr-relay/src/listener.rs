//! Inbound Listener
//!
//! Handler registered against the control channel. It runs on the transport's
//! delivery path, so it does nothing but enqueue the raw payload.

use cr_transport::{EventHandler, InboundEvent};
use tracing::{debug, trace, warn};

use crate::metrics;
use crate::queue::QueueSender;

pub struct InboundListener {
    control_channel: String,
    queue: QueueSender,
}

impl InboundListener {
    pub fn new(control_channel: impl Into<String>, queue: QueueSender) -> Self {
        Self {
            control_channel: control_channel.into(),
            queue,
        }
    }

    pub fn control_channel(&self) -> &str {
        &self.control_channel
    }
}

impl EventHandler for InboundListener {
    fn on_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::Message { channel, payload } => {
                if channel != self.control_channel {
                    // Only one channel is subscribed; anything else is a transport quirk
                    debug!(channel = %channel, "Message on unexpected channel, enqueuing anyway");
                }
                metrics::record_received();
                if !self.queue.push(payload) {
                    warn!(channel = %channel, "Dispatch queue closed, message not enqueued");
                }
            }
            InboundEvent::PatternMessage { pattern, channel, .. } => {
                trace!(pattern = %pattern, channel = %channel, "Ignoring pattern message");
            }
            InboundEvent::Subscribed { channel } => {
                debug!(channel = %channel, "Subscription acknowledged");
            }
            InboundEvent::Unsubscribed { channel } => {
                debug!(channel = %channel, "Unsubscription acknowledged");
            }
        }
    }
}
