use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use crate::channel::{channel_name, ChannelRegistry};
use crate::error::Result;
use crate::feed::types::{FeedPayload, WeatherUpdate};
use crate::transport::{ChannelOptions, WireMessage};

const CONSUMER_BUFFER: usize = 64;

/// Current track conditions. Starts from session defaults and absorbs
/// partial updates field-wise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherConditions {
    pub track_temp: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub wind_direction: String,
    pub rain_chance: f64,
    pub track_status: String,
}

impl Default for WeatherConditions {
    fn default() -> Self {
        Self {
            track_temp: 45.0,
            humidity: 65.0,
            wind_speed: 12.0,
            wind_direction: "NW".to_string(),
            rain_chance: 0.0,
            track_status: "DRY".to_string(),
        }
    }
}

impl WeatherConditions {
    /// Overwrite only the fields the update carries.
    pub fn merge(&mut self, update: WeatherUpdate) {
        if let Some(track_temp) = update.track_temp {
            self.track_temp = track_temp;
        }
        if let Some(humidity) = update.humidity {
            self.humidity = humidity;
        }
        if let Some(wind_speed) = update.wind_speed {
            self.wind_speed = wind_speed;
        }
        if let Some(wind_direction) = update.wind_direction {
            self.wind_direction = wind_direction;
        }
        if let Some(rain_chance) = update.rain_chance {
            self.rain_chance = rain_chance;
        }
        if let Some(track_status) = update.track_status {
            self.track_status = track_status;
        }
    }
}

/// Follows the track weather channel and keeps one merged
/// current-conditions record.
pub struct WeatherMonitor {
    registry: Arc<ChannelRegistry>,
    conditions: RwLock<WeatherConditions>,
}

impl WeatherMonitor {
    pub fn new(registry: Arc<ChannelRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            conditions: RwLock::new(WeatherConditions::default()),
        })
    }

    pub fn channel() -> String {
        channel_name("weather", "track")
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let channel = Self::channel();
        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        self.spawn_consumer(channel.clone(), rx);
        self.registry
            .subscribe(&channel, tx, ChannelOptions::default())
            .await?;
        tracing::info!(channel = %channel, "Weather monitor started");
        Ok(())
    }

    /// Unsubscribe and fall back to the session defaults.
    pub async fn stop(&self) -> Result<()> {
        self.registry.unsubscribe(&Self::channel()).await?;
        *self.conditions.write().await = WeatherConditions::default();
        Ok(())
    }

    pub async fn conditions(&self) -> WeatherConditions {
        self.conditions.read().await.clone()
    }

    pub async fn apply(&self, update: WeatherUpdate) {
        self.conditions.write().await.merge(update);
    }

    fn spawn_consumer(self: &Arc<Self>, channel: String, mut messages: mpsc::Receiver<WireMessage>) {
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let Some(monitor) = weak.upgrade() else { break };
                match FeedPayload::decode(&channel, &message) {
                    Ok(Some(FeedPayload::Weather(update))) => monitor.apply(update).await,
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(channel = %channel, error = %error, "Dropping bad weather update");
                    }
                }
            }
        });
    }
}
