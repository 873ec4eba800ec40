use serde::Deserialize;
use thiserror::Error;

pub mod logging;

// ============================================================================
// Control Message Types
// ============================================================================

/// Wire value of the `action` field that triggers a broadcast to every worker.
pub const DELETE_ACTION: &str = "DELETE";

/// Routing discriminator carried by every control message.
///
/// Only `DELETE` has distinguished behaviour; any other value of the
/// `action` field is treated as a normal unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Delete,
    Normal,
}

impl Action {
    fn from_wire(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) if s == DELETE_ACTION => Action::Delete,
            _ => Action::Normal,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Action::Delete)
    }
}

/// Failure to decode a raw control payload
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid control message: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// The subset of the payload the relay cares about.
///
/// `action` is required but may hold any JSON value.
#[derive(Deserialize)]
struct Envelope {
    action: serde_json::Value,
}

/// A decoded control message.
///
/// The raw payload is kept verbatim so it can be forwarded without
/// re-encoding.
#[derive(Debug, Clone)]
pub struct ControlMessage {
    action: Action,
    payload: String,
}

impl ControlMessage {
    /// Decode a raw payload received on the control channel.
    pub fn decode(raw: String) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_str(&raw)?;
        Ok(Self {
            action: Action::from_wire(&envelope.action),
            payload: raw,
        })
    }

    pub fn action(&self) -> Action {
        self.action
    }

    /// The original payload, byte for byte.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn into_payload(self) -> String {
        self.payload
    }
}
