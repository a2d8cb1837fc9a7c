//! Connection lifecycle management.
//!
//! Owns the transport handle and its state machine: connect with a bounded
//! retry budget, automatic reconnection on drops, credential fetch/renewal,
//! and an awaitable view of the connection state.

mod backoff;
mod manager;

pub use backoff::Backoff;
pub use manager::ConnectionManager;

/// Lifecycle states of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Suspended,
    /// Retry budget exhausted or the transport failed terminally; cleared
    /// only by an explicit reset.
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}
