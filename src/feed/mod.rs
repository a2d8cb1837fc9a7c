//! Typed consumers of the dashboard channels.
//!
//! Wire payloads are decoded and validated at the boundary
//! ([`FeedPayload::decode`]); only typed values enter the buffers. Each
//! consumer owns a fixed-size store (telemetry samples, race events,
//! current weather) and a task draining its channel subscription.

mod events;
mod telemetry;
mod types;
mod weather;

pub use events::RaceEventLog;
pub use telemetry::{TelemetryFeed, TelemetrySample, TelemetrySelection};
pub use types::{
    FeedPayload, Metric, RaceEvent, TelemetryFrame, TrackPoint, WeatherUpdate,
};
pub use weather::{WeatherConditions, WeatherMonitor};
