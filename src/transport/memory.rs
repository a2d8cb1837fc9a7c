//! In-process transport implementation.
//!
//! Provides the full `Transport` contract against in-memory state, plus a
//! control surface for simulating the failure modes of a managed service:
//! refused connects, rejected credentials, dropped connections, channel
//! faults and replayable message history. Used by the integration tests and
//! by local development without network access.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::auth::Credential;
use crate::error::{RealtimeError, Result};

use super::message::{
    AttachmentId, ChannelEvent, ChannelFault, ChannelOptions, PresenceAction, PresenceEvent,
    TransportEvent, WireMessage, CODE_OPERATION_FAILED,
};
use super::{Attachment, Transport};

/// Buffered events per attachment before delivery backpressure kicks in.
const CHANNEL_BUFFER: usize = 64;
/// Messages of history retained per channel for rewind replay.
const HISTORY_LIMIT: usize = 100;

struct MemoryAttachment {
    channel: String,
    sender: mpsc::Sender<ChannelEvent>,
}

/// In-memory transport.
///
/// One instance models one connection to the realtime service. Channel
/// state (attachments, history, presence) lives in `DashMap`s; connection
/// state is a flag plus a broadcast of lifecycle events.
pub struct MemoryTransport {
    connected: AtomicBool,
    events_tx: broadcast::Sender<TransportEvent>,
    attachments: DashMap<AttachmentId, MemoryAttachment>,
    history: DashMap<String, VecDeque<WireMessage>>,
    presence: DashMap<String, Vec<String>>,
    credential: RwLock<Option<Credential>>,

    // Induced failures and introspection counters
    fail_connects: AtomicU32,
    reject_auths: AtomicU32,
    fail_attaches: DashMap<String, u32>,
    attach_delay_ms: AtomicU64,
    renew_delay_ms: AtomicU64,
    connect_calls: AtomicU32,
    attach_calls: DashMap<String, u32>,
    renew_calls: AtomicU32,
    renews_in_flight: AtomicU32,
    peak_renews: AtomicU32,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(CHANNEL_BUFFER);
        Self {
            connected: AtomicBool::new(false),
            events_tx,
            attachments: DashMap::new(),
            history: DashMap::new(),
            presence: DashMap::new(),
            credential: RwLock::new(None),
            fail_connects: AtomicU32::new(0),
            reject_auths: AtomicU32::new(0),
            fail_attaches: DashMap::new(),
            attach_delay_ms: AtomicU64::new(0),
            renew_delay_ms: AtomicU64::new(0),
            connect_calls: AtomicU32::new(0),
            attach_calls: DashMap::new(),
            renew_calls: AtomicU32::new(0),
            renews_in_flight: AtomicU32::new(0),
            peak_renews: AtomicU32::new(0),
        }
    }

    fn emit(&self, event: TransportEvent) {
        // No receivers is fine; lifecycle events are best-effort
        let _ = self.events_tx.send(event);
    }

    /// Drop all attachments, ending their event streams.
    fn clear_attachments(&self) {
        self.attachments.clear();
    }

    fn interrupt(&self, event: TransportEvent) {
        self.connected.store(false, Ordering::SeqCst);
        self.clear_attachments();
        self.emit(event);
    }

    /// Publish a message on a channel: recorded in history and fanned out
    /// to every live attachment. Returns the number of attachments reached.
    pub async fn publish(&self, channel: &str, message: WireMessage) -> usize {
        {
            let mut history = self.history.entry(channel.to_string()).or_default();
            if history.len() >= HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(message.clone());
        }

        // Collect senders first to avoid holding the map across sends
        let targets: Vec<(AttachmentId, mpsc::Sender<ChannelEvent>)> = self
            .attachments
            .iter()
            .filter(|entry| entry.channel == channel)
            .map(|entry| (*entry.key(), entry.sender.clone()))
            .collect();

        let mut delivered = 0;
        for (id, sender) in targets {
            if sender.send(ChannelEvent::Message(message.clone())).await.is_ok() {
                delivered += 1;
            } else {
                // Receiver gone; the attachment is dead
                self.attachments.remove(&id);
            }
        }
        delivered
    }

    /// Raise a channel fault on every attachment of a channel.
    pub async fn inject_fault(&self, channel: &str, fault: ChannelFault) -> usize {
        let targets: Vec<mpsc::Sender<ChannelEvent>> = self
            .attachments
            .iter()
            .filter(|entry| entry.channel == channel)
            .map(|entry| entry.sender.clone())
            .collect();

        let mut delivered = 0;
        for sender in targets {
            if sender.send(ChannelEvent::Fault(fault.clone())).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Seed the presence membership reported for a channel.
    pub fn set_presence(&self, channel: &str, members: Vec<String>) {
        self.presence.insert(channel.to_string(), members);
    }

    /// Apply a presence change and fan it out to the channel's attachments.
    pub async fn emit_presence(&self, channel: &str, action: PresenceAction, client_id: &str) {
        {
            let mut members = self.presence.entry(channel.to_string()).or_default();
            match action {
                PresenceAction::Enter => {
                    if !members.iter().any(|m| m == client_id) {
                        members.push(client_id.to_string());
                    }
                }
                PresenceAction::Leave => members.retain(|m| m != client_id),
            }
        }

        let event = ChannelEvent::Presence(PresenceEvent {
            action,
            client_id: client_id.to_string(),
        });

        let targets: Vec<mpsc::Sender<ChannelEvent>> = self
            .attachments
            .iter()
            .filter(|entry| entry.channel == channel)
            .map(|entry| entry.sender.clone())
            .collect();

        for sender in targets {
            let _ = sender.send(event.clone()).await;
        }
    }

    /// Sever the connection as a network drop would.
    pub fn drop_connection(&self) {
        self.interrupt(TransportEvent::Disconnected);
    }

    /// Put the connection into the suspended state.
    pub fn suspend_connection(&self) {
        self.interrupt(TransportEvent::Suspended);
    }

    /// Report a terminal transport failure.
    pub fn fail_connection(&self, code: u32, message: &str) {
        self.interrupt(TransportEvent::Failed {
            code,
            message: message.to_string(),
        });
    }

    /// Refuse the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Reject the credential on the next `count` connect/renew attempts.
    pub fn reject_next_auths(&self, count: u32) {
        self.reject_auths.store(count, Ordering::SeqCst);
    }

    /// Make the next attaches on a channel fail with an operation fault.
    pub fn fail_next_attaches(&self, channel: &str, count: u32) {
        self.fail_attaches.insert(channel.to_string(), count);
    }

    /// Delay every attach by the given duration, simulating an in-flight
    /// operation that resolves later.
    pub fn set_attach_delay(&self, delay: Duration) {
        self.attach_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every credential renewal by the given duration, simulating a
    /// slow auth round trip.
    pub fn set_renew_delay(&self, delay: Duration) {
        self.renew_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn attach_count(&self, channel: &str) -> u32 {
        self.attach_calls.get(channel).map(|c| *c).unwrap_or(0)
    }

    pub fn renew_count(&self) -> u32 {
        self.renew_calls.load(Ordering::SeqCst)
    }

    /// The highest number of renewals that were ever in flight at once.
    pub fn peak_concurrent_renews(&self) -> u32 {
        self.peak_renews.load(Ordering::SeqCst)
    }

    pub fn live_attachments(&self, channel: &str) -> usize {
        self.attachments
            .iter()
            .filter(|entry| entry.channel == channel)
            .count()
    }

    /// The credential the transport last accepted.
    pub async fn current_credential(&self) -> Option<Credential> {
        self.credential.read().await.clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, credential: &Credential) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        if decrement(&self.fail_connects) {
            return Err(RealtimeError::Connection(
                "connect refused by transport".to_string(),
            ));
        }
        if decrement(&self.reject_auths) {
            return Err(RealtimeError::Auth("credential rejected".to_string()));
        }

        *self.credential.write().await = Some(credential.clone());

        if !self.connected.swap(true, Ordering::SeqCst) {
            self.emit(TransportEvent::Connected);
        }
        Ok(())
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.clear_attachments();
            self.emit(TransportEvent::Disconnected);
        }
    }

    async fn renew_auth(&self, credential: &Credential) -> Result<()> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.renews_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_renews.fetch_max(in_flight, Ordering::SeqCst);

        let result = async {
            let delay = self.renew_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            if decrement(&self.reject_auths) {
                return Err(RealtimeError::Auth("credential rejected".to_string()));
            }

            *self.credential.write().await = Some(credential.clone());

            // The connection stays up; observers only see an update
            if self.is_connected() {
                self.emit(TransportEvent::Update);
            }
            Ok(())
        }
        .await;

        self.renews_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    async fn attach(&self, channel: &str, options: &ChannelOptions) -> Result<Attachment> {
        let delay = self.attach_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if !self.is_connected() {
            return Err(RealtimeError::NotConnected);
        }

        if let Some(mut remaining) = self.fail_attaches.get_mut(channel) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RealtimeError::Channel {
                    channel: channel.to_string(),
                    code: CODE_OPERATION_FAILED,
                    message: "induced attach failure".to_string(),
                });
            }
        }

        *self.attach_calls.entry(channel.to_string()).or_insert(0) += 1;

        let (sender, events) = mpsc::channel(CHANNEL_BUFFER);
        let id = AttachmentId::new();

        // Replay requested history before any live message
        if let Some(count) = options.rewind {
            if let Some(history) = self.history.get(channel) {
                let skip = history.len().saturating_sub(count as usize);
                for message in history.iter().skip(skip) {
                    if sender
                        .try_send(ChannelEvent::Message(message.clone()))
                        .is_err()
                    {
                        tracing::debug!(channel = %channel, "Rewind overflow, replay truncated");
                        break;
                    }
                }
            }
        }

        self.attachments.insert(
            id,
            MemoryAttachment {
                channel: channel.to_string(),
                sender,
            },
        );

        Ok(Attachment {
            id,
            channel: channel.to_string(),
            events,
        })
    }

    async fn detach(&self, id: AttachmentId) -> Result<()> {
        self.attachments.remove(&id);
        Ok(())
    }

    async fn presence_members(&self, channel: &str) -> Result<Vec<String>> {
        if !self.is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        Ok(self
            .presence
            .get(channel)
            .map(|m| m.clone())
            .unwrap_or_default())
    }
}

/// Decrement a countdown if it is non-zero, reporting whether it fired.
fn decrement(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
