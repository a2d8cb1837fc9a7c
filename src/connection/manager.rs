use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex, RwLock};

use crate::auth::{Credential, TokenProvider};
use crate::config::ConnectionConfig;
use crate::error::{RealtimeError, Result};
use crate::transport::{Transport, TransportEvent};

use super::{Backoff, ConnectionState};

/// Owns the transport connection and its lifecycle.
///
/// One manager exists per session. State is published through a `watch`
/// channel: `state()` reads the current value, `state_watch()` hands out a
/// receiver that observers can await transitions on. The watch carries
/// levels and coalesces rapid transitions, so entries into `Connected` are
/// additionally counted on `connected_epoch()`; that counter is what drives
/// the registry's resubscription pass and misses no entry, however brief
/// the drop before it was.
///
/// Reconnection runs on a single combined budget: transport refusals and
/// credential rejections both consume attempts, with fresh material fetched
/// before the retry when the credential was at fault. Exhausting the budget
/// parks the manager in `Failed` until `reset()`.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    provider: Arc<dyn TokenProvider>,
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    /// Count of entries into `Connected`; bumps on every entry even when
    /// the state watch coalesces the surrounding transitions away
    connected_epoch: watch::Sender<u64>,
    credential: RwLock<Option<Credential>>,
    /// Single auth operation in flight: token fetch and renewal serialize here
    auth_gate: Mutex<()>,
    /// Serializes whole connect cycles; a second `connect()` waits for the
    /// in-flight outcome instead of racing it
    connect_gate: Mutex<()>,
    closing: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        provider: Arc<dyn TokenProvider>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (connected_epoch, _) = watch::channel(0);

        let manager = Arc::new(Self {
            transport,
            provider,
            config,
            state_tx,
            connected_epoch,
            credential: RwLock::new(None),
            auth_gate: Mutex::new(()),
            connect_gate: Mutex::new(()),
            closing: AtomicBool::new(false),
        });

        manager.spawn_supervisor();
        manager
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Awaitable view of the connection state.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Counter of entries into `Connected`, published through a watch.
    ///
    /// Unlike `state_watch`, a drop that reconnects before the observer
    /// polls cannot disappear: the counter value still moves, so `changed()`
    /// fires for every entry.
    pub fn connected_epoch(&self) -> watch::Receiver<u64> {
        self.connected_epoch.subscribe()
    }

    /// Client identity of the current credential, if any.
    pub async fn client_id(&self) -> Option<String> {
        self.credential
            .read()
            .await
            .as_ref()
            .map(|c| c.client_id.clone())
    }

    /// Connect, resolving once the transport reports `Connected`.
    ///
    /// Idempotent while connecting or connected. Errors with
    /// `RealtimeError::Terminal` when the connection is in terminal
    /// `Failed`; call `reset()` first to try again.
    pub async fn connect(&self) -> Result<()> {
        let _cycle = self.connect_gate.lock().await;

        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Failed => return Err(RealtimeError::Terminal),
            _ => {}
        }

        self.closing.store(false, Ordering::SeqCst);
        self.run_cycle().await
    }

    /// Close the transport. Idempotent; no automatic reconnection follows
    /// an explicit disconnect.
    pub async fn disconnect(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.transport.close().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Re-authorize the live connection with fresh token material.
    ///
    /// The connection is preserved: while `Connected` the state never
    /// leaves `Connected` during a renewal. Concurrent renewals (and any
    /// in-flight token fetch) are serialized; the second waits for the
    /// first. Renewing while not connected just replaces the cached
    /// credential for the next connect.
    pub async fn renew_credential(&self, material: impl Into<String>) -> Result<()> {
        let material = material.into();
        let _auth = self.auth_gate.lock().await;

        let client_id = self
            .credential
            .read()
            .await
            .as_ref()
            .map(|c| c.client_id.clone())
            .unwrap_or_default();

        // Identity travels inside the material; the client id is carried
        // through for observability and presence
        let credential = Credential {
            material,
            client_id,
        };

        if self.state() == ConnectionState::Connected {
            self.transport.renew_auth(&credential).await?;
        }

        *self.credential.write().await = Some(credential);
        tracing::info!("Credential renewed");
        Ok(())
    }

    /// Clear terminal `Failed` so `connect()` may be called again.
    pub fn reset(&self) {
        if self.state() == ConnectionState::Failed {
            self.set_state(ConnectionState::Disconnected);
            tracing::info!("Terminal connection failure cleared");
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let modified = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                tracing::info!(from = %state, to = %next, "Connection state changed");
                *state = next;
                true
            }
        });

        if modified && next == ConnectionState::Connected {
            self.connected_epoch.send_modify(|epoch| *epoch += 1);
        }
    }

    /// One full connect cycle under the combined retry budget.
    async fn run_cycle(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        let mut backoff = Backoff::new(&self.config);

        loop {
            let credential = match self.ensure_credential().await {
                Ok(credential) => credential,
                Err(e) => {
                    // Provider failures surface immediately; the next
                    // connect() call is the retry
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            };

            match self.transport.connect(&credential).await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    return Ok(());
                }
                Err(RealtimeError::Auth(reason)) => {
                    tracing::warn!(
                        reason = %reason,
                        "Credential rejected, fetching fresh material before retry"
                    );
                    self.credential.write().await.take();
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        attempt = backoff.attempt() + 1,
                        "Connect attempt failed"
                    );
                }
            }

            let delay = backoff.next_delay();
            if backoff.is_exhausted() {
                let attempts = backoff.attempt();
                tracing::error!(attempts, "Retry budget exhausted, connection failed");
                self.set_state(ConnectionState::Failed);
                return Err(RealtimeError::RetriesExhausted { attempts });
            }

            tracing::debug!(delay_ms = delay.as_millis() as u64, "Backing off before retry");
            tokio::time::sleep(delay).await;

            if self.closing.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Disconnected);
                return Err(RealtimeError::Connection(
                    "connect aborted by disconnect".to_string(),
                ));
            }
        }
    }

    /// Cached credential, fetching from the provider when absent.
    async fn ensure_credential(&self) -> Result<Credential> {
        if let Some(credential) = self.credential.read().await.clone() {
            return Ok(credential);
        }

        let _auth = self.auth_gate.lock().await;

        // A renewal may have landed while waiting on the gate
        if let Some(credential) = self.credential.read().await.clone() {
            return Ok(credential);
        }

        let credential = self.provider.fetch_token().await?;
        tracing::info!(client_id = %credential.client_id, "Fetched credential material");
        *self.credential.write().await = Some(credential.clone());
        Ok(credential)
    }

    /// React to transport lifecycle events: track state and schedule
    /// reconnection for unexpected drops.
    async fn handle_transport_event(self: Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.set_state(ConnectionState::Connected),
            TransportEvent::Update => {
                tracing::debug!("Connection details updated");
            }
            TransportEvent::Failed { code, message } => {
                tracing::error!(code, message = %message, "Transport reported terminal failure");
                self.set_state(ConnectionState::Failed);
            }
            TransportEvent::Disconnected | TransportEvent::Suspended => {
                if self.closing.load(Ordering::SeqCst) {
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }

                let interim = if event == TransportEvent::Suspended {
                    ConnectionState::Suspended
                } else {
                    ConnectionState::Disconnected
                };
                self.set_state(interim);

                let manager = self.clone();
                tokio::spawn(async move {
                    let _cycle = manager.connect_gate.lock().await;
                    match manager.state() {
                        // A manual connect() won the race, or the drop was
                        // resolved/terminal in the meantime
                        ConnectionState::Connected | ConnectionState::Failed => return,
                        _ if manager.closing.load(Ordering::SeqCst) => return,
                        _ => {}
                    }
                    if let Err(error) = manager.run_cycle().await {
                        tracing::error!(error = %error, "Automatic reconnection failed");
                    }
                });
            }
        }
    }

    fn spawn_supervisor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut events = self.transport.events();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Connection event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let Some(manager) = weak.upgrade() else { break };
                manager.handle_transport_event(event).await;
            }
        });
    }
}
