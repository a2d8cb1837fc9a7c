//! Credential acquisition and session persistence.
//!
//! The realtime connection authenticates with opaque token material issued by
//! the backend. This module defines the provider seam the connection manager
//! consumes, the REST implementation of it, and the durable session store
//! used to carry a login across restarts.

mod rest;
mod session;

pub use rest::{LoginResponse, RestTokenProvider};
pub use session::{SessionStore, StoredSession, UserProfile};

use async_trait::async_trait;

use crate::error::Result;

/// Identity material for the realtime transport.
///
/// The material itself is opaque to this crate: it is minted by the backend
/// and handed to the transport verbatim. The client identifier travels with
/// it and survives credential renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub material: String,
    pub client_id: String,
}

/// Source of credential material for the realtime connection.
///
/// Invoked on first connect, whenever the transport rejects the current
/// credential, and indirectly on identity upgrade (login) through
/// credential renewal.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch fresh credential material for an anonymous session.
    ///
    /// Fails with an authentication error when the backend is unreachable
    /// or returns a malformed payload; the caller decides whether another
    /// connect attempt is warranted.
    async fn fetch_token(&self) -> Result<Credential>;
}
