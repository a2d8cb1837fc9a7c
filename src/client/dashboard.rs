use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::feed::{Metric, RaceEventLog, TelemetryFeed, WeatherMonitor};

use super::RealtimeClient;

/// A car on the grid, as shown in the roster.
#[derive(Debug, Clone, PartialEq)]
pub struct CarInfo {
    pub id: String,
    pub number: String,
    pub driver: String,
    pub team: String,
    pub position: u32,
    /// Seconds behind the leader
    pub gap: f64,
}

/// The dashboard view of one realtime session.
///
/// Owns the standard consumers: a telemetry feed following the selected
/// car, the race event log and the weather monitor. `start` connects and
/// subscribes all three; `stop` is the full teardown.
pub struct DashboardSession {
    client: Arc<RealtimeClient>,
    telemetry: Arc<TelemetryFeed>,
    events: Arc<RaceEventLog>,
    weather: Arc<WeatherMonitor>,
    cars: Vec<CarInfo>,
    selected_car: RwLock<String>,
}

impl DashboardSession {
    pub fn new(client: Arc<RealtimeClient>) -> Arc<Self> {
        Self::with_cars(client, default_grid())
    }

    pub fn with_cars(client: Arc<RealtimeClient>, cars: Vec<CarInfo>) -> Arc<Self> {
        let registry = client.registry();
        let telemetry = TelemetryFeed::new(registry.clone(), &client.settings().telemetry);
        let events = RaceEventLog::new(registry.clone(), &client.settings().events);
        let weather = WeatherMonitor::new(registry);
        let selected = cars
            .first()
            .map(|car| car.id.clone())
            .unwrap_or_else(|| "car1".to_string());

        Arc::new(Self {
            client,
            telemetry,
            events,
            weather,
            cars,
            selected_car: RwLock::new(selected),
        })
    }

    /// Connect and subscribe the dashboard's standard channels: telemetry
    /// for the selected car, race events, and track weather.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.client.connect().await?;

        let car = self.selected_car().await;
        self.telemetry.select(&car, Metric::Speed).await?;
        self.events.start().await?;
        self.weather.start().await?;

        tracing::info!(car = %car, "Dashboard session started");
        Ok(())
    }

    /// Switch the telemetry feed to another car, keeping the metric.
    pub async fn select_car(&self, car_id: &str) -> Result<()> {
        *self.selected_car.write().await = car_id.to_string();

        let metric = self
            .telemetry
            .selection()
            .await
            .map(|s| s.metric)
            .unwrap_or(Metric::Speed);
        self.telemetry.select(car_id, metric).await
    }

    /// Switch the charted metric, keeping the car.
    pub async fn select_metric(&self, metric: Metric) -> Result<()> {
        let car = self.selected_car().await;
        self.telemetry.select(&car, metric).await
    }

    /// Full teardown: feeds stopped, channels detached, connection closed.
    pub async fn stop(&self) -> Result<()> {
        self.telemetry.stop().await?;
        self.events.stop().await?;
        self.weather.stop().await?;
        self.client.disconnect().await;

        tracing::info!("Dashboard session stopped");
        Ok(())
    }

    pub async fn selected_car(&self) -> String {
        self.selected_car.read().await.clone()
    }

    pub fn cars(&self) -> &[CarInfo] {
        &self.cars
    }

    pub fn client(&self) -> &Arc<RealtimeClient> {
        &self.client
    }

    pub fn telemetry(&self) -> &Arc<TelemetryFeed> {
        &self.telemetry
    }

    pub fn race_events(&self) -> &Arc<RaceEventLog> {
        &self.events
    }

    pub fn weather(&self) -> &Arc<WeatherMonitor> {
        &self.weather
    }
}

/// The demo grid the dashboard ships with.
pub fn default_grid() -> Vec<CarInfo> {
    vec![
        CarInfo {
            id: "car1".to_string(),
            number: "44".to_string(),
            driver: "Lewis Hamilton".to_string(),
            team: "Mercedes".to_string(),
            position: 1,
            gap: 0.0,
        },
        CarInfo {
            id: "car2".to_string(),
            number: "33".to_string(),
            driver: "Max Verstappen".to_string(),
            team: "Red Bull".to_string(),
            position: 2,
            gap: 1.2,
        },
        CarInfo {
            id: "car3".to_string(),
            number: "16".to_string(),
            driver: "Charles Leclerc".to_string(),
            team: "Ferrari".to_string(),
            position: 3,
            gap: 2.5,
        },
    ]
}
