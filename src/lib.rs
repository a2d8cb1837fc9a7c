// Shared components
pub mod config;
pub mod error;

// Realtime core
pub mod auth;
pub mod channel;
pub mod connection;
pub mod presence;
pub mod transport;

// Dashboard consumers
pub mod client;
pub mod feed;

// Common entry points
pub use client::{DashboardSession, RealtimeClient};
pub use config::Settings;
pub use error::{RealtimeError, Result};
