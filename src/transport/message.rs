use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fault code the managed transport raises when a channel is rate limited.
pub const CODE_RATE_LIMIT: u32 = 40142;
/// Fault code for a failed channel operation.
pub const CODE_OPERATION_FAILED: u32 = 40160;

/// Connection lifecycle events emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Suspended,
    Failed { code: u32, message: String },
    /// Connection details changed without a state transition, e.g. after
    /// credential renewal.
    Update,
}

/// A message delivered on a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    /// Event name within the channel; feed payloads arrive as `update`.
    pub name: String,
    pub data: serde_json::Value,
}

impl WireMessage {
    /// Build an `update` message, the event name every data feed publishes
    /// under.
    pub fn update(data: serde_json::Value) -> Self {
        Self {
            name: "update".to_string(),
            data,
        }
    }
}

/// Presence membership change on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Enter,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub action: PresenceAction,
    pub client_id: String,
}

/// Channel-scoped fault raised by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFault {
    pub code: u32,
    pub message: String,
}

/// Recovery class of a channel fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Resubscribe after a backoff delay.
    RateLimited,
    /// Resubscribe immediately.
    OperationFailed,
    /// No automatic recovery; surfaced to the caller.
    Other,
}

impl ChannelFault {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn class(&self) -> FaultClass {
        match self.code {
            CODE_RATE_LIMIT => FaultClass::RateLimited,
            CODE_OPERATION_FAILED => FaultClass::OperationFailed,
            _ => FaultClass::Other,
        }
    }
}

/// Events flowing out of one channel attachment.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(WireMessage),
    Presence(PresenceEvent),
    Fault(ChannelFault),
}

/// Per-channel subscription options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Track presence membership for this channel.
    pub presence: bool,
    /// Replay up to this many historical messages on attach.
    pub rewind: Option<u32>,
}

impl ChannelOptions {
    pub fn with_rewind(count: u32) -> Self {
        Self {
            rewind: Some(count),
            ..Default::default()
        }
    }

    pub fn with_presence() -> Self {
        Self {
            presence: true,
            ..Default::default()
        }
    }
}

/// Identifier of one live channel attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentId(Uuid);

impl AttachmentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttachmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
