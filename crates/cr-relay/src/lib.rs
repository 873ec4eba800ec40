//! ControlRelay
//!
//! Fans control messages out from one pub/sub channel to N worker channels:
//! - InboundListener: enqueues raw payloads from the transport's delivery path
//! - Dispatch queue: unbounded FIFO hand-off to the dispatcher task
//! - Dispatcher: decodes, routes (round-robin or DELETE broadcast), health-checks
//!   the connection and republishes
//! - Relay: wires the above together and owns shutdown

pub mod error;
pub mod queue;
pub mod listener;
pub mod routing;
pub mod dispatcher;
pub mod relay;
pub mod metrics;

pub use error::RelayError;
pub use queue::{dispatch_queue, QueueReceiver, QueueSender};
pub use listener::InboundListener;
pub use routing::{RoundRobin, Router, WorkerTarget};
pub use dispatcher::{
    Dispatcher, DispatcherConfig, DispatcherStats, DispatchOutcome, DropReason, StatsSnapshot,
};
pub use relay::{Relay, RelayConfig, RelayHandle};

pub type Result<T> = std::result::Result<T, RelayError>;
