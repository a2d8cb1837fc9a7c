use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::channel::{telemetry_channel, ChannelRegistry};
use crate::config::TelemetryConfig;
use crate::error::{RealtimeError, Result};
use crate::feed::types::{FeedPayload, Metric};
use crate::transport::{ChannelOptions, WireMessage};

const CONSUMER_BUFFER: usize = 64;

/// One charted reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// The (car, metric) pair a feed is following.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySelection {
    pub car_id: String,
    pub metric: Metric,
}

impl TelemetrySelection {
    pub fn channel(&self) -> String {
        telemetry_channel(&self.car_id, self.metric.as_str())
    }
}

struct FeedState {
    selection: Option<TelemetrySelection>,
    samples: VecDeque<TelemetrySample>,
}

/// Rolling buffer of readings for one selected (car, metric) pair.
///
/// Attaches with a rewind request so the chart fills with recent history
/// before live frames arrive. Holds at most `buffer_capacity` samples,
/// evicting the oldest.
///
/// # Selection changes
///
/// `select` tears the previous channel down before touching the buffer, so
/// there is never an overlapping delivery window, and clears the samples in
/// the same write that installs the new selection: a snapshot reader can
/// never see old samples labeled under the new (car, metric). Frames still
/// in flight from the previous channel carry a stale epoch and are dropped
/// before buffering.
pub struct TelemetryFeed {
    registry: Arc<ChannelRegistry>,
    capacity: usize,
    rewind: u32,
    state: RwLock<FeedState>,
    /// Serializes selection changes
    swap_gate: Mutex<()>,
    /// Bumped on every selection change; consumers check it before buffering
    epoch: AtomicU64,
}

impl TelemetryFeed {
    pub fn new(registry: Arc<ChannelRegistry>, config: &TelemetryConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            capacity: config.buffer_capacity,
            rewind: config.rewind,
            state: RwLock::new(FeedState {
                selection: None,
                samples: VecDeque::new(),
            }),
            swap_gate: Mutex::new(()),
            epoch: AtomicU64::new(0),
        })
    }

    /// Follow a (car, metric) pair. Re-selecting the current pair is a
    /// no-op; anything else swaps the channel and starts the buffer fresh.
    pub async fn select(self: &Arc<Self>, car_id: &str, metric: Metric) -> Result<()> {
        let _gate = self.swap_gate.lock().await;

        let previous = {
            let state = self.state.read().await;
            if let Some(current) = &state.selection {
                if current.car_id == car_id && current.metric == metric {
                    tracing::debug!(car = %car_id, metric = %metric, "Selection unchanged, no-op");
                    return Ok(());
                }
            }
            state.selection.as_ref().map(|s| s.channel())
        };

        // Old channel goes first so its frames stop before the buffer swaps
        if let Some(channel) = previous {
            self.registry.unsubscribe(&channel).await?;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let selection = TelemetrySelection {
            car_id: car_id.to_string(),
            metric,
        };
        let channel = selection.channel();

        {
            let mut state = self.state.write().await;
            state.samples.clear();
            state.selection = Some(selection);
        }

        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        self.spawn_consumer(channel.clone(), metric, epoch, rx);
        self.registry
            .subscribe(&channel, tx, ChannelOptions::with_rewind(self.rewind))
            .await?;

        tracing::info!(channel = %channel, rewind = self.rewind, "Telemetry selection changed");
        Ok(())
    }

    /// Stop following, drop the buffer.
    pub async fn stop(&self) -> Result<()> {
        let _gate = self.swap_gate.lock().await;

        let previous = {
            let state = self.state.read().await;
            state.selection.as_ref().map(|s| s.channel())
        };
        if let Some(channel) = previous {
            self.registry.unsubscribe(&channel).await?;
        }

        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        state.samples.clear();
        state.selection = None;
        Ok(())
    }

    pub async fn selection(&self) -> Option<TelemetrySelection> {
        self.state.read().await.selection.clone()
    }

    /// Snapshot of the buffer, oldest first.
    pub async fn samples(&self) -> Vec<TelemetrySample> {
        self.state.read().await.samples.iter().copied().collect()
    }

    pub async fn latest(&self) -> Option<TelemetrySample> {
        self.state.read().await.samples.back().copied()
    }

    pub async fn sample_count(&self) -> usize {
        self.state.read().await.samples.len()
    }

    fn spawn_consumer(
        self: &Arc<Self>,
        channel: String,
        metric: Metric,
        epoch: u64,
        mut messages: mpsc::Receiver<WireMessage>,
    ) {
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let Some(feed) = weak.upgrade() else { break };
                if feed.epoch.load(Ordering::SeqCst) != epoch {
                    break;
                }
                if let Err(error) = feed.ingest(&channel, metric, epoch, &message).await {
                    tracing::warn!(channel = %channel, error = %error, "Dropping bad telemetry frame");
                }
            }
        });
    }

    async fn ingest(
        &self,
        channel: &str,
        metric: Metric,
        epoch: u64,
        message: &WireMessage,
    ) -> Result<()> {
        let Some(FeedPayload::Telemetry(frame)) = FeedPayload::decode(channel, message)? else {
            return Ok(());
        };

        let timestamp = DateTime::from_timestamp_millis(frame.timestamp).ok_or_else(|| {
            RealtimeError::Malformed(format!(
                "telemetry timestamp {} out of range",
                frame.timestamp
            ))
        })?;
        let sample = TelemetrySample {
            timestamp,
            value: frame.metric_value(metric),
        };

        let mut state = self.state.write().await;
        // The selection may have moved on while this frame was decoding
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Ok(());
        }
        state.samples.push_back(sample);
        while state.samples.len() > self.capacity {
            state.samples.pop_front();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::presence::PresenceTracker;
    use crate::transport::{MemoryTransport, Transport};
    use serde_json::json;
    use std::time::Duration;

    fn frame(timestamp: i64, speed: f64, fuel: f64) -> WireMessage {
        WireMessage::update(json!({
            "timestamp": timestamp,
            "position": {"x": 520.0, "y": 320.0},
            "speed": speed,
            "temp": 92.0,
            "fuel": fuel,
            "lap": 3,
            "trackPosition": 40.0
        }))
    }

    async fn build_feed() -> (Arc<MemoryTransport>, Arc<TelemetryFeed>) {
        let transport = Arc::new(MemoryTransport::new());
        transport
            .connect(&Credential {
                material: "tok-test".to_string(),
                client_id: "user-abc123".to_string(),
            })
            .await
            .unwrap();
        let registry = ChannelRegistry::new(
            transport.clone(),
            Arc::new(PresenceTracker::new()),
            Duration::from_millis(2000),
        );
        let feed = TelemetryFeed::new(registry, &TelemetryConfig::default());
        (transport, feed)
    }

    #[tokio::test]
    async fn test_buffer_caps_at_capacity_evicting_oldest() {
        let (transport, feed) = build_feed().await;
        feed.select("car1", Metric::Speed).await.unwrap();

        for i in 0..75 {
            transport
                .publish("telemetry:car1:speed", frame(1_000 + i, 200.0 + i as f64, 80.0))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let samples = feed.samples().await;
        assert_eq!(samples.len(), 60);
        // The first 15 frames were evicted
        assert_eq!(samples[0].value, 215.0);
        assert_eq!(feed.latest().await.unwrap().value, 274.0);
    }

    #[tokio::test]
    async fn test_extracts_selected_metric() {
        let (transport, feed) = build_feed().await;
        feed.select("car1", Metric::Fuel).await.unwrap();

        transport
            .publish("telemetry:car1:fuel", frame(1_000, 300.0, 64.5))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(feed.latest().await.unwrap().value, 64.5);
    }

    #[tokio::test]
    async fn test_reselect_same_pair_is_noop() {
        let (transport, feed) = build_feed().await;
        feed.select("car1", Metric::Speed).await.unwrap();
        feed.select("car1", Metric::Speed).await.unwrap();

        assert_eq!(transport.attach_count("telemetry:car1:speed"), 1);
    }

    #[tokio::test]
    async fn test_selection_change_clears_and_swaps_channel() {
        let (transport, feed) = build_feed().await;
        feed.select("car1", Metric::Speed).await.unwrap();
        transport
            .publish("telemetry:car1:speed", frame(1_000, 280.0, 80.0))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(feed.sample_count().await, 1);

        feed.select("car2", Metric::Speed).await.unwrap();

        // Old channel fully released, buffer restarted
        assert_eq!(transport.live_attachments("telemetry:car1:speed"), 0);
        assert_eq!(feed.sample_count().await, 0);
        assert_eq!(feed.selection().await.unwrap().car_id, "car2");

        // Frames published to the old channel no longer land anywhere
        transport
            .publish("telemetry:car1:speed", frame(2_000, 290.0, 79.0))
            .await;
        transport
            .publish("telemetry:car2:speed", frame(2_001, 180.0, 90.0))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let samples = feed.samples().await;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 180.0);
    }

    #[tokio::test]
    async fn test_rewind_fills_buffer_with_history() {
        let (transport, feed) = build_feed().await;

        // History published before anyone subscribes
        for i in 0..30 {
            transport
                .publish("telemetry:car1:speed", frame(1_000 + i, 200.0 + i as f64, 80.0))
                .await;
        }

        feed.select("car1", Metric::Speed).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The rewind window replays the most recent 20
        let samples = feed.samples().await;
        assert_eq!(samples.len(), 20);
        assert_eq!(samples[0].value, 210.0);
        assert_eq!(samples[19].value, 229.0);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped_not_fatal() {
        let (transport, feed) = build_feed().await;
        feed.select("car1", Metric::Speed).await.unwrap();

        transport
            .publish("telemetry:car1:speed", WireMessage::update(json!({"speed": "fast"})))
            .await;
        transport
            .publish("telemetry:car1:speed", frame(1_000, 250.0, 70.0))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let samples = feed.samples().await;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 250.0);
    }

    #[tokio::test]
    async fn test_stop_releases_channel_and_buffer() {
        let (transport, feed) = build_feed().await;
        feed.select("car1", Metric::Speed).await.unwrap();
        feed.stop().await.unwrap();

        assert_eq!(transport.live_attachments("telemetry:car1:speed"), 0);
        assert!(feed.selection().await.is_none());
        assert_eq!(feed.sample_count().await, 0);
    }
}
