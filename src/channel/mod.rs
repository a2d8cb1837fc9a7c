//! Channel subscription bookkeeping.
//!
//! The registry tracks the desired set of channel subscriptions, keeps each
//! one attached across reconnects and channel faults, and guarantees the
//! subscribe/unsubscribe idempotence rules consumers rely on.

mod naming;
mod registry;

pub use naming::{channel_name, telemetry_channel, ChannelKind};
pub use registry::{ChannelNotice, ChannelRegistry, ResubscribeReport};
