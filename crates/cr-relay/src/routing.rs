//! Round-robin routing of control messages to worker channels

use std::fmt;
use std::num::NonZeroU32;

use cr_common::Action;

/// Suffix used to address every worker channel at once.
pub const BROADCAST_SUFFIX: &str = "*";

/// Cyclic worker position.
///
/// Starts at 1 and is advanced before use, so the first normal message goes
/// to worker 2 (or worker 1 when there is only one worker).
#[derive(Debug, Clone)]
pub struct RoundRobin {
    position: u32,
    workers: NonZeroU32,
}

impl RoundRobin {
    pub fn new(workers: NonZeroU32) -> Self {
        Self { position: 1, workers }
    }

    /// Advance and return the next worker index, in `1..=workers`.
    pub fn advance(&mut self) -> u32 {
        self.position = (self.position % self.workers.get()) + 1;
        self.position
    }

    pub fn position(&self) -> u32 {
        self.position
    }
}

/// Where a message is published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTarget {
    Worker(u32),
    Broadcast,
}

impl WorkerTarget {
    /// Channel name for this target under `base`
    pub fn channel(&self, base: &str) -> String {
        match self {
            WorkerTarget::Worker(index) => format!("{}_{}", base, index),
            WorkerTarget::Broadcast => format!("{}_{}", base, BROADCAST_SUFFIX),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerTarget::Worker(_) => "unicast",
            WorkerTarget::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for WorkerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerTarget::Worker(index) => write!(f, "worker {}", index),
            WorkerTarget::Broadcast => write!(f, "all workers"),
        }
    }
}

/// Picks a target per action. DELETE never moves the round-robin position.
#[derive(Debug, Clone)]
pub struct Router {
    round_robin: RoundRobin,
}

impl Router {
    pub fn new(workers: NonZeroU32) -> Self {
        Self { round_robin: RoundRobin::new(workers) }
    }

    pub fn route(&mut self, action: Action) -> WorkerTarget {
        match action {
            Action::Delete => WorkerTarget::Broadcast,
            Action::Normal => WorkerTarget::Worker(self.round_robin.advance()),
        }
    }

    pub fn position(&self) -> u32 {
        self.round_robin.position()
    }
}
