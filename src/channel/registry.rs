use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::presence::PresenceTracker;
use crate::transport::{
    Attachment, AttachmentId, ChannelEvent, ChannelFault, ChannelOptions, FaultClass, Transport,
    WireMessage,
};

/// An unrecoverable channel fault surfaced to the session.
#[derive(Debug, Clone)]
pub struct ChannelNotice {
    pub channel: String,
    pub fault: ChannelFault,
}

/// Outcome of one resubscription pass.
#[derive(Debug, Clone, Default)]
pub struct ResubscribeReport {
    /// Entries in the snapshot when the pass started
    pub attempted: usize,
    /// Entries attached again with their handler intact
    pub restored: usize,
    /// Entries that disappeared mid-pass (unsubscribed or superseded)
    pub skipped: usize,
    /// Channels whose re-attach failed; the pass continued past them
    pub failed: Vec<String>,
}

struct ChannelEntry {
    options: ChannelOptions,
    /// Shared slot so the handler can be replaced in place without a
    /// re-attach, and survives resubscription untouched
    handler: Arc<RwLock<mpsc::Sender<WireMessage>>>,
    attachment: AttachmentId,
    generation: u64,
    forwarder: JoinHandle<()>,
    active: bool,
}

/// Tracks the desired set of channel subscriptions.
///
/// One entry per channel name. `subscribe` is idempotent: subscribing a name
/// that is already live with the same handler is a no-op, a different
/// handler replaces the old one in place, and only an options change causes
/// a re-attach. `unsubscribe` of an unknown name is a no-op.
///
/// # Stale subscriptions
///
/// Attaching suspends, and an `unsubscribe` may arrive while a `subscribe`
/// for the same name is still in flight. Every claim on a name takes a
/// fresh generation; when the in-flight attach resolves it only commits if
/// its generation is still the desired one, otherwise the attachment is
/// detached and dropped. A removed channel can never be resurrected by a
/// late attach.
pub struct ChannelRegistry {
    transport: Arc<dyn Transport>,
    presence: Arc<PresenceTracker>,
    entries: DashMap<String, ChannelEntry>,
    /// name -> latest claimed generation; absent means not desired
    desired: DashMap<String, u64>,
    generation: AtomicU64,
    /// Delay before resubscribing a rate-limited channel
    retry_delay: Duration,
    notices_tx: broadcast::Sender<ChannelNotice>,
    faults_tx: mpsc::UnboundedSender<(String, ChannelFault)>,
}

impl ChannelRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        presence: Arc<PresenceTracker>,
        retry_delay: Duration,
    ) -> Arc<Self> {
        let (notices_tx, _) = broadcast::channel(32);
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(Self {
            transport,
            presence,
            entries: DashMap::new(),
            desired: DashMap::new(),
            generation: AtomicU64::new(0),
            retry_delay,
            notices_tx,
            faults_tx,
        });

        registry.spawn_recovery(faults_rx);
        registry
    }

    /// Subscribe a handler to a channel.
    ///
    /// The handler is an `mpsc` sender the caller owns the receiving side
    /// of. Subscribing an already-subscribed name with a sender to the same
    /// channel is a no-op; a different sender replaces the handler in place
    /// with no re-attach and no duplicate delivery. Changing options
    /// re-attaches. A failed subscribe leaves the name fully unsubscribed,
    /// even when it was replacing a live entry.
    pub async fn subscribe(
        &self,
        name: &str,
        handler: mpsc::Sender<WireMessage>,
        options: ChannelOptions,
    ) -> Result<()> {
        let existing = self
            .entries
            .get(name)
            .map(|entry| (entry.handler.clone(), entry.options.clone()));

        if let Some((slot, current_options)) = existing {
            if current_options == options && self.desired.contains_key(name) {
                let mut current = slot.write().await;
                if current.same_channel(&handler) {
                    tracing::debug!(channel = %name, "Already subscribed, no-op");
                } else {
                    *current = handler;
                    tracing::debug!(channel = %name, "Handler replaced in place");
                }
                return Ok(());
            }
        }

        let generation = self.claim(name);
        let slot = Arc::new(RwLock::new(handler));
        match self.attach_entry(name, slot, options, generation).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // A failed attach must not leave the name marked desired.
                // Withdraw the claim unless a newer subscribe owns it, and
                // drop the entry a re-attach was replacing; its delivery is
                // already torn down.
                if self.desired.remove_if(name, |_, g| *g == generation).is_some() {
                    self.entries.remove_if(name, |_, entry| entry.generation < generation);
                }
                Err(e)
            }
        }
    }

    /// Remove a subscription and tear down its attachment.
    ///
    /// Unknown names are a no-op. The desire is withdrawn first, so an
    /// in-flight subscribe for the same name resolves without committing.
    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        self.desired.remove(name);

        let Some((_, mut entry)) = self.entries.remove(name) else {
            tracing::debug!(channel = %name, "Unsubscribe for unknown channel, no-op");
            return Ok(());
        };

        entry.active = false;
        entry.forwarder.abort();

        // Best effort: the attachment may already be gone with the connection
        if let Err(e) = self.transport.detach(entry.attachment).await {
            tracing::debug!(channel = %name, error = %e, "Detach failed during unsubscribe");
        }

        if entry.options.presence {
            self.presence.forget(name);
        }

        tracing::info!(channel = %name, "Unsubscribed");
        Ok(())
    }

    /// Re-attach every currently registered channel.
    ///
    /// Runs over a snapshot, so subscriptions added or removed mid-pass are
    /// neither lost nor double-handled. A failure on one channel is recorded
    /// and the pass moves on.
    pub async fn resubscribe_all(&self) -> ResubscribeReport {
        let snapshot: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();

        let mut report = ResubscribeReport {
            attempted: snapshot.len(),
            ..Default::default()
        };

        for name in snapshot {
            match self.resubscribe_channel(&name).await {
                Ok(true) => report.restored += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(channel = %name, error = %e, "Resubscribe failed");
                    report.failed.push(name);
                }
            }
        }

        tracing::info!(
            attempted = report.attempted,
            restored = report.restored,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Resubscription pass completed"
        );

        report
    }

    /// Re-attach one channel, keeping its handler and options.
    ///
    /// Returns `Ok(false)` when the channel is no longer registered or was
    /// superseded while the attach was in flight. A failed re-attach leaves
    /// the subscription registered and desired; the next pass retries it.
    pub async fn resubscribe_channel(&self, name: &str) -> Result<bool> {
        let Some((slot, options)) = self
            .entries
            .get(name)
            .map(|entry| (entry.handler.clone(), entry.options.clone()))
        else {
            return Ok(false);
        };

        if !self.desired.contains_key(name) {
            return Ok(false);
        }

        let generation = self.claim(name);
        self.attach_entry(name, slot, options, generation).await
    }

    /// Detach every channel, fanning the teardown out concurrently.
    /// Returns how many were detached.
    pub async fn detach_all(&self) -> usize {
        let names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();

        let mut pending: FuturesUnordered<_> = names
            .into_iter()
            .map(|name| async move {
                let result = self.unsubscribe(&name).await;
                (name, result)
            })
            .collect();

        let mut detached = 0;
        while let Some((name, result)) = pending.next().await {
            match result {
                Ok(()) => detached += 1,
                Err(e) => tracing::warn!(channel = %name, error = %e, "Detach failed"),
            }
        }

        tracing::info!(detached, "All channels detached");
        detached
    }

    /// Flag every entry as inactive: the connection dropped and delivery is
    /// dead until a resubscription pass restores it.
    pub fn mark_all_inactive(&self) {
        for mut entry in self.entries.iter_mut() {
            entry.active = false;
        }
    }

    pub fn is_subscribed(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Whether the channel currently has a live attachment.
    pub fn is_active(&self, name: &str) -> bool {
        self.entries.get(name).map(|e| e.active).unwrap_or(false)
    }

    pub fn subscription_count(&self) -> usize {
        self.entries.len()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Subscribe to surfaced, unrecoverable channel faults.
    pub fn notices(&self) -> broadcast::Receiver<ChannelNotice> {
        self.notices_tx.subscribe()
    }

    /// Claim a fresh generation for a name, marking it desired.
    fn claim(&self, name: &str) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.desired.insert(name.to_string(), generation);
        generation
    }

    fn still_desired(&self, name: &str, generation: u64) -> bool {
        self.desired
            .get(name)
            .map(|g| *g == generation)
            .unwrap_or(false)
    }

    /// Attach and commit an entry, honoring the generation protocol.
    /// Returns whether the entry was installed.
    async fn attach_entry(
        &self,
        name: &str,
        slot: Arc<RwLock<mpsc::Sender<WireMessage>>>,
        options: ChannelOptions,
        generation: u64,
    ) -> Result<bool> {
        // On a re-attach the old delivery path dies first. Old and new
        // attachments share the handler slot, so leaving the old forwarder
        // running until the commit would deliver anything published in the
        // attach window twice.
        let stale = self.entries.get_mut(name).map(|mut entry| {
            entry.active = false;
            entry.forwarder.abort();
            entry.attachment
        });
        if let Some(attachment) = stale {
            let _ = self.transport.detach(attachment).await;
        }

        let attachment = self.transport.attach(name, &options).await?;
        let attachment_id = attachment.id;

        // The subscription may have been removed or replaced while the
        // attach was in flight; a stale result must not resurrect it
        if !self.still_desired(name, generation) {
            tracing::debug!(channel = %name, "Discarding stale attachment");
            let _ = self.transport.detach(attachment_id).await;
            return Ok(false);
        }

        if options.presence {
            match self.transport.presence_members(name).await {
                Ok(snapshot) => self.presence.seed(name, snapshot),
                Err(e) => {
                    tracing::warn!(channel = %name, error = %e, "Presence snapshot failed");
                }
            }
        }

        let forwarder =
            self.spawn_forwarder(name.to_string(), attachment, slot.clone(), options.presence);

        let entry = ChannelEntry {
            options,
            handler: slot,
            attachment: attachment_id,
            generation,
            forwarder,
            active: true,
        };

        enum Commit {
            Installed(Option<ChannelEntry>),
            Superseded(ChannelEntry),
        }

        let commit = match self.entries.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().generation > generation {
                    // A newer claim committed first
                    Commit::Superseded(entry)
                } else {
                    Commit::Installed(Some(occupied.insert(entry)))
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Commit::Installed(None)
            }
        };

        match commit {
            Commit::Superseded(entry) => {
                entry.forwarder.abort();
                let _ = self.transport.detach(attachment_id).await;
                Ok(false)
            }
            Commit::Installed(old) => {
                if let Some(old) = old {
                    old.forwarder.abort();
                    let _ = self.transport.detach(old.attachment).await;
                }

                // An unsubscribe may have withdrawn the desire between the
                // check above and the commit; take our own entry back out
                if !self.still_desired(name, generation) {
                    if let Some((_, entry)) =
                        self.entries.remove_if(name, |_, e| e.generation == generation)
                    {
                        entry.forwarder.abort();
                        let _ = self.transport.detach(entry.attachment).await;
                    }
                    return Ok(false);
                }

                tracing::info!(channel = %name, "Channel attached");
                Ok(true)
            }
        }
    }

    /// Pump one attachment's events: messages to the handler slot, presence
    /// into the tracker, faults into the recovery loop. Ends when the
    /// attachment or the handler goes away.
    fn spawn_forwarder(
        &self,
        name: String,
        mut attachment: Attachment,
        slot: Arc<RwLock<mpsc::Sender<WireMessage>>>,
        track_presence: bool,
    ) -> JoinHandle<()> {
        let presence = self.presence.clone();
        let faults = self.faults_tx.clone();

        tokio::spawn(async move {
            while let Some(event) = attachment.events.recv().await {
                match event {
                    ChannelEvent::Message(message) => {
                        let handler = slot.read().await.clone();
                        if handler.send(message).await.is_err() {
                            tracing::debug!(channel = %name, "Handler dropped, stopping delivery");
                            break;
                        }
                    }
                    ChannelEvent::Presence(event) if track_presence => {
                        presence.apply(&name, event);
                    }
                    ChannelEvent::Presence(_) => {}
                    ChannelEvent::Fault(fault) => {
                        tracing::warn!(
                            channel = %name,
                            code = fault.code,
                            message = %fault.message,
                            "Channel fault"
                        );
                        let _ = faults.send((name.clone(), fault));
                    }
                }
            }
        })
    }

    /// Consume channel faults and drive recovery per fault class.
    fn spawn_recovery(self: &Arc<Self>, mut faults: mpsc::UnboundedReceiver<(String, ChannelFault)>) {
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some((channel, fault)) = faults.recv().await {
                let Some(registry) = weak.upgrade() else { break };
                registry.recover(channel, fault);
            }
        });
    }

    fn recover(self: Arc<Self>, channel: String, fault: ChannelFault) {
        match fault.class() {
            FaultClass::RateLimited => {
                let delay = self.retry_delay;
                tracing::warn!(
                    channel = %channel,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, delaying resubscribe"
                );
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(error) = self.resubscribe_channel(&channel).await {
                        tracing::error!(channel = %channel, error = %error, "Delayed resubscribe failed");
                    }
                });
            }
            FaultClass::OperationFailed => {
                tracing::warn!(channel = %channel, "Channel operation failed, resubscribing");
                tokio::spawn(async move {
                    if let Err(error) = self.resubscribe_channel(&channel).await {
                        tracing::error!(channel = %channel, error = %error, "Resubscribe failed");
                    }
                });
            }
            FaultClass::Other => {
                tracing::error!(
                    channel = %channel,
                    code = fault.code,
                    message = %fault.message,
                    "Unrecoverable channel fault, surfacing"
                );
                let _ = self.notices_tx.send(ChannelNotice { channel, fault });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::transport::{MemoryTransport, PresenceAction, CODE_OPERATION_FAILED, CODE_RATE_LIMIT};

    fn test_credential() -> Credential {
        Credential {
            material: "tok-test".to_string(),
            client_id: "user-abc123".to_string(),
        }
    }

    async fn build_registry() -> (Arc<MemoryTransport>, Arc<PresenceTracker>, Arc<ChannelRegistry>) {
        let transport = Arc::new(MemoryTransport::new());
        transport.connect(&test_credential()).await.unwrap();
        let presence = Arc::new(PresenceTracker::new());
        let registry = ChannelRegistry::new(
            transport.clone(),
            presence.clone(),
            Duration::from_millis(2000),
        );
        (transport, presence, registry)
    }

    #[tokio::test]
    async fn test_subscribe_same_handler_is_noop() {
        let (transport, _, registry) = build_registry().await;
        let (tx, _rx) = mpsc::channel(8);

        registry
            .subscribe("race:events", tx.clone(), ChannelOptions::default())
            .await
            .unwrap();
        registry
            .subscribe("race:events", tx, ChannelOptions::default())
            .await
            .unwrap();

        assert_eq!(transport.attach_count("race:events"), 1);
        assert_eq!(registry.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_handler_replaced_in_place() {
        let (transport, _, registry) = build_registry().await;
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);

        registry
            .subscribe("race:events", tx1, ChannelOptions::default())
            .await
            .unwrap();
        registry
            .subscribe("race:events", tx2, ChannelOptions::default())
            .await
            .unwrap();

        // No re-attach happened
        assert_eq!(transport.attach_count("race:events"), 1);

        transport
            .publish("race:events", WireMessage::update(serde_json::json!({"n": 1})))
            .await;

        // Only the replacement handler sees the message
        assert!(rx2.recv().await.is_some());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_options_change_reattaches() {
        let (transport, _, registry) = build_registry().await;
        let (tx, _rx) = mpsc::channel(8);

        registry
            .subscribe("race:events", tx.clone(), ChannelOptions::default())
            .await
            .unwrap();
        registry
            .subscribe("race:events", tx, ChannelOptions::with_rewind(20))
            .await
            .unwrap();

        assert_eq!(transport.attach_count("race:events"), 2);
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(transport.live_attachments("race:events"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_does_not_duplicate_delivery() {
        let (transport, _, registry) = build_registry().await;
        let (tx, mut rx) = mpsc::channel(8);

        registry
            .subscribe("strategy:pit", tx.clone(), ChannelOptions::default())
            .await
            .unwrap();

        // Publish mid re-attach: the rewind on the new attachment replays
        // the message, so a still-running old forwarder would double it
        transport.set_attach_delay(Duration::from_millis(50));
        let reattach = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .subscribe("strategy:pit", tx, ChannelOptions::with_rewind(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport
            .publish(
                "strategy:pit",
                WireMessage::update(serde_json::json!({"lap": 30})),
            )
            .await;

        reattach.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.live_attachments("strategy:pit"), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_noop() {
        let (_, _, registry) = build_registry().await;
        registry.unsubscribe("never:seen").await.unwrap();
        assert_eq!(registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_tears_down() {
        let (transport, _, registry) = build_registry().await;
        let (tx, _rx) = mpsc::channel(8);

        registry
            .subscribe("weather:track", tx, ChannelOptions::default())
            .await
            .unwrap();
        registry.unsubscribe("weather:track").await.unwrap();

        assert!(!registry.is_subscribed("weather:track"));
        assert_eq!(transport.live_attachments("weather:track"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_during_inflight_subscribe() {
        let (transport, _, registry) = build_registry().await;
        transport.set_attach_delay(Duration::from_millis(50));

        let (tx, _rx) = mpsc::channel(8);
        let in_flight = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .subscribe("telemetry:car1:speed", tx, ChannelOptions::default())
                    .await
            })
        };

        // Let the attach get in flight, then withdraw the subscription
        tokio::task::yield_now().await;
        registry.unsubscribe("telemetry:car1:speed").await.unwrap();

        in_flight.await.unwrap().unwrap();

        assert!(!registry.is_subscribed("telemetry:car1:speed"));
        assert_eq!(transport.live_attachments("telemetry:car1:speed"), 0);
    }

    #[tokio::test]
    async fn test_failed_subscribe_withdraws_the_claim() {
        let (transport, _, registry) = build_registry().await;
        transport.fail_next_attaches("weather:track", 1);

        let (tx, _rx) = mpsc::channel(8);
        let result = registry
            .subscribe("weather:track", tx, ChannelOptions::default())
            .await;

        assert!(result.is_err());
        assert!(!registry.is_subscribed("weather:track"));
        // Nothing is left behind for a later pass to act on
        assert!(registry.desired.get("weather:track").is_none());

        let report = registry.resubscribe_all().await;
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_subscribe_keeps_newer_claim_intact() {
        let (transport, _, registry) = build_registry().await;
        transport.set_attach_delay(Duration::from_millis(50));
        transport.fail_next_attaches("race:events", 1);

        let (tx1, _rx1) = mpsc::channel(8);
        let first = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .subscribe("race:events", tx1, ChannelOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A second subscribe claims the name while the first is in flight;
        // the first fails and must not clear the newer claim
        let (tx2, mut rx2) = mpsc::channel(8);
        let second = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .subscribe("race:events", tx2, ChannelOptions::default())
                    .await
            })
        };

        assert!(first.await.unwrap().is_err());
        second.await.unwrap().unwrap();

        assert!(registry.is_subscribed("race:events"));
        transport
            .publish("race:events", WireMessage::update(serde_json::json!({"n": 1})))
            .await;
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_fault_delays_resubscribe() {
        let (transport, _, registry) = build_registry().await;
        let (tx, _rx) = mpsc::channel(8);

        registry
            .subscribe("race:events", tx, ChannelOptions::default())
            .await
            .unwrap();

        transport
            .inject_fault("race:events", ChannelFault::new(CODE_RATE_LIMIT, "slow down"))
            .await;

        // Propagate the fault; the resubscribe must still be pending
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.attach_count("race:events"), 1);

        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(transport.attach_count("race:events"), 2);
        assert!(registry.is_subscribed("race:events"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_fault_resubscribes_immediately() {
        let (transport, _, registry) = build_registry().await;
        let (tx, _rx) = mpsc::channel(8);

        registry
            .subscribe("race:events", tx, ChannelOptions::default())
            .await
            .unwrap();

        transport
            .inject_fault(
                "race:events",
                ChannelFault::new(CODE_OPERATION_FAILED, "attach lost"),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.attach_count("race:events"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_fault_is_surfaced_not_recovered() {
        let (transport, _, registry) = build_registry().await;
        let mut notices = registry.notices();
        let (tx, _rx) = mpsc::channel(8);

        registry
            .subscribe("race:events", tx, ChannelOptions::default())
            .await
            .unwrap();

        transport
            .inject_fault("race:events", ChannelFault::new(50000, "internal error"))
            .await;

        tokio::time::sleep(Duration::from_millis(10)).await;

        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.channel, "race:events");
        assert_eq!(notice.fault.code, 50000);
        assert_eq!(transport.attach_count("race:events"), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_all_restores_handlers() {
        let (transport, _, registry) = build_registry().await;
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);

        registry
            .subscribe("telemetry:car1:speed", tx1, ChannelOptions::default())
            .await
            .unwrap();
        registry
            .subscribe("race:events", tx2, ChannelOptions::default())
            .await
            .unwrap();

        // Connection drops and comes back; attachments are gone
        transport.drop_connection();
        assert_eq!(transport.live_attachments("race:events"), 0);
        transport.connect(&test_credential()).await.unwrap();

        let report = registry.resubscribe_all().await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.restored, 2);
        assert!(report.failed.is_empty());

        // Original handlers receive again without caller re-registration
        transport
            .publish(
                "telemetry:car1:speed",
                WireMessage::update(serde_json::json!({"speed": 301.5})),
            )
            .await;
        transport
            .publish("race:events", WireMessage::update(serde_json::json!({"type": "FLAG"})))
            .await;

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_resubscribe_all_records_failures_and_continues() {
        let (transport, _, registry) = build_registry().await;
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);

        registry
            .subscribe("telemetry:car1:speed", tx1, ChannelOptions::default())
            .await
            .unwrap();
        registry
            .subscribe("race:events", tx2, ChannelOptions::default())
            .await
            .unwrap();

        transport.drop_connection();
        transport.connect(&test_credential()).await.unwrap();
        transport.fail_next_attaches("telemetry:car1:speed", 1);

        let report = registry.resubscribe_all().await;
        assert_eq!(report.restored, 1);
        assert_eq!(report.failed, vec!["telemetry:car1:speed".to_string()]);

        // The healthy channel still works
        transport
            .publish("race:events", WireMessage::update(serde_json::json!({"type": "PIT"})))
            .await;
        assert!(rx2.recv().await.is_some());

        // The failed channel stayed registered with its handler; the next
        // pass restores it without any re-registration
        assert!(registry.is_subscribed("telemetry:car1:speed"));
        let report = registry.resubscribe_all().await;
        assert_eq!(report.restored, 2);
        assert!(report.failed.is_empty());

        transport
            .publish(
                "telemetry:car1:speed",
                WireMessage::update(serde_json::json!({"speed": 280.0})),
            )
            .await;
        assert!(rx1.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_presence_seeded_and_routed() {
        let (transport, presence, registry) = build_registry().await;
        transport.set_presence("presence:pit", vec!["engineer-1".to_string()]);

        let (tx, _rx) = mpsc::channel(8);
        registry
            .subscribe("presence:pit", tx, ChannelOptions::with_presence())
            .await
            .unwrap();

        assert_eq!(presence.members("presence:pit"), vec!["engineer-1"]);

        transport
            .emit_presence("presence:pit", PresenceAction::Enter, "engineer-2")
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            presence.members("presence:pit"),
            vec!["engineer-1", "engineer-2"]
        );

        // Unsubscribing drops the membership set
        registry.unsubscribe("presence:pit").await.unwrap();
        assert_eq!(presence.member_count("presence:pit"), 0);
    }

    #[tokio::test]
    async fn test_detach_all() {
        let (transport, _, registry) = build_registry().await;
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);

        registry
            .subscribe("weather:track", tx1, ChannelOptions::default())
            .await
            .unwrap();
        registry
            .subscribe("race:events", tx2, ChannelOptions::default())
            .await
            .unwrap();

        let detached = registry.detach_all().await;

        assert_eq!(detached, 2);
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(transport.live_attachments("weather:track"), 0);
        assert_eq!(transport.live_attachments("race:events"), 0);
    }

    #[tokio::test]
    async fn test_final_state_matches_last_call() {
        let (_, _, registry) = build_registry().await;
        let (tx, _rx) = mpsc::channel(8);

        for _ in 0..3 {
            registry
                .subscribe("race:events", tx.clone(), ChannelOptions::default())
                .await
                .unwrap();
            registry.unsubscribe("race:events").await.unwrap();
        }
        registry
            .subscribe("race:events", tx, ChannelOptions::default())
            .await
            .unwrap();

        assert!(registry.is_subscribed("race:events"));
        assert_eq!(registry.subscriptions(), vec!["race:events".to_string()]);
    }
}
