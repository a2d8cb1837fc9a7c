//! Pub/sub transport seam.
//!
//! The dashboard talks to a managed realtime service. This module defines
//! the trait boundary the rest of the crate programs against, the wire-level
//! types shared by implementations, and an in-process memory transport used
//! by tests and local development.

mod memory;
mod message;

pub use memory::MemoryTransport;
pub use message::{
    AttachmentId, ChannelEvent, ChannelFault, ChannelOptions, FaultClass, PresenceAction,
    PresenceEvent, TransportEvent, WireMessage, CODE_OPERATION_FAILED, CODE_RATE_LIMIT,
};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::auth::Credential;
use crate::error::Result;

/// A live channel attachment: its identifier plus the stream of events the
/// channel delivers. The receiver ends when the attachment is detached or
/// the connection drops.
#[derive(Debug)]
pub struct Attachment {
    pub id: AttachmentId,
    pub channel: String,
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// The pub/sub transport the subscription layer is built on.
///
/// Implementations hold one connection. All methods are safe to call from
/// multiple tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection with the given credential.
    async fn connect(&self, credential: &Credential) -> Result<()>;

    /// Close the connection. Closing an unconnected transport is a no-op.
    async fn close(&self);

    /// Re-authorize the live connection in place. The connection must not
    /// drop; implementations signal success with a `TransportEvent::Update`.
    async fn renew_auth(&self, credential: &Credential) -> Result<()>;

    /// Subscribe to connection lifecycle events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Attach to a channel, returning its event stream.
    async fn attach(&self, channel: &str, options: &ChannelOptions) -> Result<Attachment>;

    /// Tear down an attachment. Detaching an unknown id is a no-op.
    async fn detach(&self, id: AttachmentId) -> Result<()>;

    /// Snapshot of the members currently present on a channel.
    async fn presence_members(&self, channel: &str) -> Result<Vec<String>>;
}
