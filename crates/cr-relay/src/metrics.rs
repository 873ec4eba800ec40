//! Metrics for the relay
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! binary installs a recorder.

use metrics::counter;

/// A payload arrived on the control channel
pub fn record_received() {
    counter!("cr_messages_received_total").increment(1);
}

/// A payload was published; `kind` is "unicast" or "broadcast"
pub fn record_published(kind: &'static str) {
    counter!("cr_messages_published_total", "kind" => kind).increment(1);
}

/// A payload was dropped
pub fn record_dropped(reason: &'static str) {
    counter!("cr_messages_dropped_total", "reason" => reason).increment(1);
}

/// The dispatcher replaced its connection
pub fn record_reconnect(success: bool) {
    counter!("cr_reconnects_total", "success" => success.to_string()).increment(1);
}
