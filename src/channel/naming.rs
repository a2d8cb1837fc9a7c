//! Channel naming scheme.
//!
//! Channels are named `type:id`. A small set of types is documented below,
//! but the scheme is open: unrecognized types still produce a valid name,
//! never an error.

/// Documented channel types. Advisory only; `channel_name` accepts any
/// type string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Per-car telemetry streams
    Telemetry,
    /// Track weather conditions
    Weather,
    /// Race control events
    Race,
    /// Strategy updates
    Strategy,
    /// Presence-only channels
    Presence,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Telemetry => "telemetry",
            ChannelKind::Weather => "weather",
            ChannelKind::Race => "race",
            ChannelKind::Strategy => "strategy",
            ChannelKind::Presence => "presence",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compose a channel name from a type and an id.
pub fn channel_name(kind: &str, id: &str) -> String {
    format!("{}:{}", kind, id)
}

/// Telemetry channel carrying one metric for one car:
/// `telemetry:{car_id}:{metric}`.
pub fn telemetry_channel(car_id: &str, metric: &str) -> String {
    channel_name(ChannelKind::Telemetry.as_str(), &format!("{}:{}", car_id, metric))
}
