use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::channel::{channel_name, ChannelRegistry};
use crate::config::EventLogConfig;
use crate::error::Result;
use crate::feed::types::{FeedPayload, RaceEvent};
use crate::transport::{ChannelOptions, WireMessage};

const CONSUMER_BUFFER: usize = 64;
const FILTER_ALL: &str = "All";

/// Emphasis order when nothing has happened yet.
const DEFAULT_EMPHASIS: [&str; 4] = ["Flag", "Penalty", "Pit", "Incident"];

struct LogState {
    events: VecDeque<RaceEvent>,
    emphasis: Vec<String>,
    filter: String,
}

/// Most-recent-first log of race control events.
///
/// Holds at most `capacity` entries; overflow evicts from the tail. A small
/// ordered list of known type labels is kept for UI emphasis: recording an
/// event whose (case-normalized) type is a known label moves that label to
/// the front. The list never grows, never shrinks, and never affects the
/// log itself.
pub struct RaceEventLog {
    registry: Arc<ChannelRegistry>,
    capacity: usize,
    state: RwLock<LogState>,
}

impl RaceEventLog {
    pub fn new(registry: Arc<ChannelRegistry>, config: &EventLogConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            capacity: config.capacity,
            state: RwLock::new(LogState {
                events: VecDeque::new(),
                emphasis: DEFAULT_EMPHASIS.iter().map(|s| s.to_string()).collect(),
                filter: FILTER_ALL.to_string(),
            }),
        })
    }

    /// The channel this log follows.
    pub fn channel() -> String {
        channel_name("race", "events")
    }

    /// Subscribe to race events and start recording.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let channel = Self::channel();
        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        self.spawn_consumer(channel.clone(), rx);
        self.registry
            .subscribe(&channel, tx, ChannelOptions::default())
            .await?;
        tracing::info!(channel = %channel, "Race event log started");
        Ok(())
    }

    /// Unsubscribe; recorded events stay until `clear`.
    pub async fn stop(&self) -> Result<()> {
        self.registry.unsubscribe(&Self::channel()).await
    }

    /// Prepend an event, evicting from the tail past capacity, and bump
    /// its type label to the front of the emphasis list when it is known.
    pub async fn record(&self, event: RaceEvent) {
        let label = title_case(&event.kind);
        let mut state = self.state.write().await;

        state.events.push_front(event);
        while state.events.len() > self.capacity {
            state.events.pop_back();
        }

        if let Some(index) = state.emphasis.iter().position(|known| *known == label) {
            let label = state.emphasis.remove(index);
            state.emphasis.insert(0, label);
        }
    }

    /// Snapshot of the log, newest first.
    pub async fn events(&self) -> Vec<RaceEvent> {
        self.state.read().await.events.iter().cloned().collect()
    }

    /// Snapshot filtered by the current view filter. `All` passes
    /// everything; a type label matches events of that type.
    pub async fn filtered_events(&self) -> Vec<RaceEvent> {
        let state = self.state.read().await;
        if state.filter == FILTER_ALL {
            return state.events.iter().cloned().collect();
        }
        let wanted = state.filter.to_uppercase();
        state
            .events
            .iter()
            .filter(|event| event.kind == wanted)
            .cloned()
            .collect()
    }

    pub async fn set_filter(&self, filter: impl Into<String>) {
        self.state.write().await.filter = filter.into();
    }

    pub async fn filter(&self) -> String {
        self.state.read().await.filter.clone()
    }

    /// Filter choices in emphasis order, `All` first.
    pub async fn event_types(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut types = Vec::with_capacity(state.emphasis.len() + 1);
        types.push(FILTER_ALL.to_string());
        types.extend(state.emphasis.iter().cloned());
        types
    }

    pub async fn emphasis(&self) -> Vec<String> {
        self.state.read().await.emphasis.clone()
    }

    pub async fn newest(&self) -> Option<RaceEvent> {
        self.state.read().await.events.front().cloned()
    }

    pub async fn event_count(&self) -> usize {
        self.state.read().await.events.len()
    }

    pub async fn clear(&self) {
        self.state.write().await.events.clear();
    }

    fn spawn_consumer(self: &Arc<Self>, channel: String, mut messages: mpsc::Receiver<WireMessage>) {
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let Some(log) = weak.upgrade() else { break };
                match FeedPayload::decode(&channel, &message) {
                    Ok(Some(FeedPayload::Race(event))) => log.record(event).await,
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(channel = %channel, error = %error, "Dropping bad race event");
                    }
                }
            }
        });
    }
}

/// "FLAG" and "flag" both normalize to "Flag".
fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}
