//! The per-session client handle.
//!
//! One [`RealtimeClient`] is constructed per session and passed to every
//! consumer; there is no process-wide singleton. It owns the connection
//! manager, the channel registry and the presence tracker, plus the wiring
//! task that reacts to connection state: every entry into `Connected` runs
//! a full resubscription pass, every exit marks the subscriptions inactive.
//!
//! [`DashboardSession`] sits on top and owns the dashboard's standard
//! consumers (telemetry feed, race event log, weather monitor).

mod dashboard;

pub use dashboard::{default_grid, CarInfo, DashboardSession};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

use crate::auth::{
    LoginResponse, RestTokenProvider, SessionStore, StoredSession, TokenProvider, UserProfile,
};
use crate::channel::{ChannelNotice, ChannelRegistry, ResubscribeReport};
use crate::config::Settings;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{RealtimeError, Result};
use crate::presence::PresenceTracker;
use crate::transport::{ChannelOptions, Transport, WireMessage};

const EVENT_BUFFER: usize = 64;

/// Session-level happenings published to observers.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    /// A resubscription pass ran after an entry into `Connected`
    Resubscribed(ResubscribeReport),
    /// An unrecoverable channel fault; the channel is no longer delivering
    ChannelFaulted(ChannelNotice),
}

/// The explicit per-session realtime handle.
pub struct RealtimeClient {
    settings: Settings,
    manager: Arc<ConnectionManager>,
    registry: Arc<ChannelRegistry>,
    presence: Arc<PresenceTracker>,
    sessions: SessionStore,
    /// REST backend for login and session restore; absent when the client
    /// was built with a custom credential provider
    backend: Option<Arc<RestTokenProvider>>,
    events_tx: broadcast::Sender<ClientEvent>,
}

impl RealtimeClient {
    /// Build a client for the configured REST backend.
    pub fn new(settings: Settings, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        let backend = Arc::new(RestTokenProvider::new(&settings.backend)?);
        Ok(Self::assemble(
            settings,
            transport,
            backend.clone(),
            Some(backend),
        ))
    }

    /// Build a client with a custom credential provider. `login` and
    /// `restore_session` need the REST backend and are unavailable.
    pub fn with_provider(
        settings: Settings,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn TokenProvider>,
    ) -> Arc<Self> {
        Self::assemble(settings, transport, provider, None)
    }

    fn assemble(
        settings: Settings,
        transport: Arc<dyn Transport>,
        provider: Arc<dyn TokenProvider>,
        backend: Option<Arc<RestTokenProvider>>,
    ) -> Arc<Self> {
        let presence = Arc::new(PresenceTracker::new());
        let retry_delay = Duration::from_millis(settings.connection.base_backoff_ms);
        let registry = ChannelRegistry::new(transport.clone(), presence.clone(), retry_delay);
        let manager = ConnectionManager::new(transport, provider, settings.connection.clone());
        let sessions = SessionStore::new(&settings.session);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);

        let client = Arc::new(Self {
            settings,
            manager,
            registry,
            presence,
            sessions,
            backend,
            events_tx,
        });

        client.spawn_wiring();
        client
    }

    /// Connect, resolving once the connection is up.
    pub async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    /// Detach every channel, then close the connection. Idempotent.
    pub async fn disconnect(&self) {
        let detached = self.registry.detach_all().await;
        tracing::debug!(detached, "Channels detached for disconnect");
        self.manager.disconnect().await;
    }

    /// Clear a terminal `Failed` state so `connect` may be retried.
    pub fn reset(&self) {
        self.manager.reset();
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state_watch()
    }

    /// Identity of the current realtime credential, if any.
    pub async fn client_id(&self) -> Option<String> {
        self.manager.client_id().await
    }

    /// Session-level event stream.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }

    pub async fn subscribe(
        &self,
        name: &str,
        handler: mpsc::Sender<WireMessage>,
        options: ChannelOptions,
    ) -> Result<()> {
        self.registry.subscribe(name, handler, options).await
    }

    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        self.registry.unsubscribe(name).await
    }

    /// Upgrade the live connection's credential in place.
    pub async fn renew_credential(&self, material: impl Into<String>) -> Result<()> {
        self.manager.renew_credential(material).await
    }

    /// Authenticate, persist the session, and upgrade the live connection
    /// to the authenticated identity without reconnecting.
    pub async fn login(&self, username: &str, password: &str) -> Result<UserProfile> {
        let login = self.backend()?.login(username, password).await?;
        self.adopt_session(login).await
    }

    /// Drop the persisted session. The live connection keeps its current
    /// credential until the next renewal or reconnect.
    pub async fn logout(&self) -> Result<()> {
        self.sessions.clear().await?;
        tracing::info!("Logged out, session cleared");
        Ok(())
    }

    /// Load the persisted session, if any, and validate it against the
    /// backend. An invalid or expired session is cleared and reported as
    /// absent, not as an error.
    pub async fn restore_session(&self) -> Result<Option<UserProfile>> {
        let Some(session) = self.sessions.load().await? else {
            return Ok(None);
        };

        match self.backend()?.me(&session.token).await {
            Ok(profile) => {
                tracing::info!(username = %profile.username, "Session restored");
                Ok(Some(profile))
            }
            Err(RealtimeError::Auth(reason)) => {
                tracing::info!(reason = %reason, "Stored session invalid, clearing");
                self.sessions.clear().await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> Arc<ChannelRegistry> {
        self.registry.clone()
    }

    pub fn presence(&self) -> Arc<PresenceTracker> {
        self.presence.clone()
    }

    fn backend(&self) -> Result<&RestTokenProvider> {
        self.backend
            .as_deref()
            .ok_or_else(|| RealtimeError::Auth("REST backend not configured".to_string()))
    }

    async fn adopt_session(&self, login: LoginResponse) -> Result<UserProfile> {
        let session = StoredSession {
            token: login.access_token,
            user: login.user_info.clone(),
        };
        self.sessions.save(&session).await?;
        self.manager.renew_credential(login.token_material).await?;
        Ok(login.user_info)
    }

    /// Forward connection state and surfaced channel faults to the event
    /// stream, and run the resubscription pass on every entry into
    /// `Connected`.
    ///
    /// The pass is driven by the manager's connected-epoch counter, not by
    /// diffing the state watch: a drop that reconnects before this task
    /// polls leaves the state level unchanged, but the counter still moves
    /// and the pass still runs.
    fn spawn_wiring(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut state_rx = self.manager.state_watch();
        let mut connected_rx = self.manager.connected_epoch();

        tokio::spawn(async move {
            let mut last = *state_rx.borrow();
            loop {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *state_rx.borrow_and_update();
                        let Some(client) = weak.upgrade() else { break };

                        let _ = client.events_tx.send(ClientEvent::StateChanged(state));

                        if state != ConnectionState::Connected
                            && last == ConnectionState::Connected
                        {
                            client.registry.mark_all_inactive();
                        }
                        last = state;
                    }
                    changed = connected_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        connected_rx.borrow_and_update();
                        let Some(client) = weak.upgrade() else { break };

                        let report = client.registry.resubscribe_all().await;
                        let _ = client.events_tx.send(ClientEvent::Resubscribed(report));
                    }
                }
            }
        });

        let weak = Arc::downgrade(self);
        let mut notices = self.registry.notices();

        tokio::spawn(async move {
            loop {
                let notice = match notices.recv().await {
                    Ok(notice) => notice,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Channel notice stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(client) = weak.upgrade() else { break };
                let _ = client.events_tx.send(ClientEvent::ChannelFaulted(notice));
            }
        });
    }
}
