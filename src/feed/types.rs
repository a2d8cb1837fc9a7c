use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{RealtimeError, Result};
use crate::transport::WireMessage;

/// A point on the track map, in layout coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub x: f64,
    pub y: f64,
}

/// One full telemetry frame as published by a car.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFrame {
    /// Epoch milliseconds
    pub timestamp: i64,
    pub position: TrackPoint,
    /// km/h
    pub speed: f64,
    /// Engine temperature in celsius
    pub temp: f64,
    /// Remaining fuel percentage
    pub fuel: f64,
    pub lap: u32,
    /// Progress around the lap, 0 to 100
    pub track_position: f64,
}

impl TelemetryFrame {
    /// Reject frames that would corrupt the buffer: non-positive
    /// timestamps and non-finite readings.
    pub fn validate(&self) -> Result<()> {
        if self.timestamp <= 0 {
            return Err(RealtimeError::Malformed(format!(
                "telemetry frame has invalid timestamp {}",
                self.timestamp
            )));
        }
        let readings = [
            self.position.x,
            self.position.y,
            self.speed,
            self.temp,
            self.fuel,
            self.track_position,
        ];
        if readings.iter().any(|v| !v.is_finite()) {
            return Err(RealtimeError::Malformed(
                "telemetry frame has a non-finite reading".to_string(),
            ));
        }
        Ok(())
    }

    /// The reading for one metric.
    pub fn metric_value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Speed => self.speed,
            Metric::Temp => self.temp,
            Metric::Fuel => self.fuel,
        }
    }
}

/// Partial weather payload; only the fields present are merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherUpdate {
    pub track_temp: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<String>,
    pub rain_chance: Option<f64>,
    pub track_status: Option<String>,
}

/// A race control event. The type tag drives filtering and emphasis;
/// everything else rides along untyped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceEvent {
    #[serde(rename = "type")]
    pub kind: String,
    /// Epoch milliseconds; zero when the producer omitted it
    #[serde(default)]
    pub timestamp: i64,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// A telemetry metric the dashboard can chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Speed,
    Temp,
    Fuel,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Speed, Metric::Temp, Metric::Fuel];

    /// The wire identifier, also the channel name segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Speed => "speed",
            Metric::Temp => "temp",
            Metric::Fuel => "fuel",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Metric::Speed => "Speed",
            Metric::Temp => "Temp",
            Metric::Fuel => "Fuel",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Metric::Speed => "km/h",
            Metric::Temp => "°C",
            Metric::Fuel => "%",
        }
    }

    /// Expected (min, max) for axis scaling.
    pub fn range(&self) -> (f64, f64) {
        match self {
            Metric::Speed => (0.0, 340.0),
            Metric::Temp => (60.0, 120.0),
            Metric::Fuel => (0.0, 100.0),
        }
    }

    pub fn parse(s: &str) -> Option<Metric> {
        match s {
            "speed" => Some(Metric::Speed),
            "temp" => Some(Metric::Temp),
            "fuel" => Some(Metric::Fuel),
            _ => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated payload, tagged by the kind of channel it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedPayload {
    Telemetry(TelemetryFrame),
    Weather(WeatherUpdate),
    Race(RaceEvent),
}

impl FeedPayload {
    /// Decode a wire message according to the channel it arrived on.
    ///
    /// Returns `Ok(None)` for message names other than `update` and for
    /// channel kinds the feed layer does not consume; malformed payloads
    /// on recognized channels are an error.
    pub fn decode(channel: &str, message: &WireMessage) -> Result<Option<FeedPayload>> {
        if message.name != "update" {
            return Ok(None);
        }

        let payload = if channel.starts_with("telemetry:") {
            let frame: TelemetryFrame = serde_json::from_value(message.data.clone())?;
            frame.validate()?;
            FeedPayload::Telemetry(frame)
        } else if channel.starts_with("weather:") {
            let update: WeatherUpdate = serde_json::from_value(message.data.clone())?;
            FeedPayload::Weather(update)
        } else if channel.starts_with("race:") {
            let event: RaceEvent = serde_json::from_value(message.data.clone())?;
            if event.kind.trim().is_empty() {
                return Err(RealtimeError::Malformed(
                    "race event has an empty type".to_string(),
                ));
            }
            FeedPayload::Race(event)
        } else {
            return Ok(None);
        };

        Ok(Some(payload))
    }
}
