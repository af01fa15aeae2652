//! Connection manager: the caller-facing surface.
//!
//! [`ChannelClient`] owns at most one connection and one [`ChannelSession`]
//! at a time and exposes the operations a host application calls. Every
//! operation resolves to a human-readable string; failures are reported as
//! the error's message rather than returned as `Err`.
//!
//! When no channel is joined, values and events go to a local store instead,
//! so `set_value`/`value_of`/`send_event` stay usable offline. The local
//! store survives join/leave cycles and doubles as a cache of values read
//! from the session.
//!
//! # Join
//!
//! ```text
//! join(channel, uri)
//!   ├── same uri already connected ──► "already connected: <uri>"
//!   ├── another join in flight ──────► None (yield, caller retries)
//!   └── leave previous, then race { connect + subscribe, join timeout }
//!         ├── subscribed ──► install session ──► "connected to ..."
//!         └── error / timeout ──► teardown ──► error message
//! ```
//!
//! Publishes are fire-and-forget: `"published ..."` means the frame was
//! queued, not that other members received it.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::constants::NO_CHANNEL_JOINED;
use crate::protocol::ChannelEvent;
use crate::session::{describe_duration, ChannelSession, SessionError};
use crate::transport::Transport;
use crate::ws;

/// Host callback fired once per received event.
pub type EventHook = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// The live connection backing a joined channel.
#[derive(Debug)]
struct Connection {
    uri: String,
    transport: Transport,
}

/// Values and events kept while no channel is joined.
#[derive(Debug, Default)]
struct LocalState {
    values: HashMap<String, String>,
    last_event: Option<ChannelEvent>,
}

#[derive(Debug, Default)]
struct ClientState {
    connection: Option<Connection>,
    session: Option<ChannelSession>,
    local: LocalState,
}

struct ClientInner {
    config: ClientConfig,
    connecting: AtomicBool,
    state: Mutex<ClientState>,
    events: broadcast::Sender<ChannelEvent>,
    event_hook: Option<EventHook>,
}

impl ClientInner {
    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a delivered event and fire the hooks exactly once.
    fn on_event(&self, event: ChannelEvent) {
        log::debug!(
            "[WebChannel] Event received: {} data: {}",
            event.event_type,
            event.data
        );
        self.lock_state().local.last_event = Some(event.clone());
        // No subscribers is fine.
        let _ = self.events.send(event.clone());
        if let Some(hook) = &self.event_hook {
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(&event))).is_err() {
                log::error!("[WebChannel] Event hook panicked on {}", event.event_type);
            }
        }
    }
}

/// Builder for [`ChannelClient`].
pub struct ChannelClientBuilder {
    config: ClientConfig,
    event_hook: Option<EventHook>,
}

impl std::fmt::Debug for ChannelClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClientBuilder")
            .field("config", &self.config)
            .field("event_hook", &self.event_hook.is_some())
            .finish()
    }
}

impl ChannelClientBuilder {
    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Call `hook` for every received event (remote or local).
    pub fn on_event(mut self, hook: impl Fn(&ChannelEvent) + Send + Sync + 'static) -> Self {
        self.event_hook = Some(Arc::new(hook));
        self
    }

    /// Build the client.
    pub fn build(self) -> ChannelClient {
        let (events, _) = broadcast::channel(self.config.event_capacity());
        ChannelClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                connecting: AtomicBool::new(false),
                state: Mutex::new(ClientState::default()),
                events,
                event_hook: self.event_hook,
            }),
        }
    }
}

/// Handle to a web channel connection manager. Cheap to clone; clones share
/// the same connection.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("server_uri", &self.report_server_uri())
            .field("channel", &self.report_channel_name())
            .field("connecting", &self.inner.connecting.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Default for ChannelClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl ChannelClient {
    /// Create a client with `config` and no event hook.
    pub fn new(config: ClientConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Start building a client.
    pub fn builder() -> ChannelClientBuilder {
        ChannelClientBuilder {
            config: ClientConfig::default(),
            event_hook: None,
        }
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Receive every event delivered from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Join `channel` on the bus at `uri`.
    ///
    /// Returns `None` without doing anything when another join is still in
    /// flight; the caller is expected to retry. Otherwise returns a
    /// confirmation or the error message.
    pub async fn join(&self, channel: &str, uri: &str) -> Option<String> {
        let channel = channel.trim();
        let uri = uri.trim();

        {
            let state = self.inner.lock_state();
            if let Some(connection) = &state.connection {
                if connection.uri == uri && connection.transport.is_open() {
                    if let Some(session) = &state.session {
                        if session.channel_name() != channel {
                            log::warn!(
                                "[WebChannel] Already on \"{}\" at {}; not switching to \"{}\"",
                                session.channel_name(),
                                uri,
                                channel
                            );
                        }
                    }
                    return Some(format!("already connected: {uri}"));
                }
            }
        }

        if self
            .inner
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("[WebChannel] Join already in progress, yielding");
            tokio::task::yield_now().await;
            return None;
        }
        let _connecting = scopeguard::guard(Arc::clone(&self.inner), |inner| {
            inner.connecting.store(false, Ordering::SeqCst);
        });

        if self.inner.lock_state().connection.is_some() {
            let left = self.leave();
            log::info!("[WebChannel] Replacing previous connection: {}", left);
        }

        let join_timeout = self.inner.config.join_timeout();
        match tokio::time::timeout(join_timeout, self.establish(channel, uri)).await {
            Ok(Ok((connection, session))) => {
                let endpoint = connection.transport.endpoint().to_string();
                self.install(connection, session);
                log::info!("[WebChannel] WebSocket connected: {}", uri);
                Some(format!("connected to \"{channel}\" on \"{endpoint}\""))
            }
            Ok(Err(e)) => {
                self.leave();
                log::error!("[WebChannel] joinChannel: {}", e);
                Some(e.to_string())
            }
            Err(_) => {
                self.leave();
                let message = format!(
                    "WebSocket connection timeout after {}",
                    describe_duration(join_timeout)
                );
                log::error!("[WebChannel] joinChannel: {}", message);
                Some(message)
            }
        }
    }

    /// Connect, create the session and subscribe. Nothing is installed in
    /// the client state until this succeeds; on any early return the
    /// transport and session are dropped, which closes them.
    async fn establish(
        &self,
        channel: &str,
        uri: &str,
    ) -> Result<(Connection, ChannelSession), SessionError> {
        let endpoint = ws::endpoint_url(uri, &self.inner.config.scheme);
        let mut transport = Transport::connect(&endpoint, &self.inner.config.header_pairs())
            .await
            .map_err(|e| SessionError::TransportFailed(format!("{e:#}")))?;
        let link = transport.attach().ok_or(SessionError::NoTransport)?;

        let mut session = ChannelSession::new(channel, link);
        let inner = Arc::downgrade(&self.inner);
        session.add_broadcast_event_listener(move |event| {
            if let Some(inner) = inner.upgrade() {
                inner.on_event(event.clone());
            }
            Ok(())
        });

        session.open(self.inner.config.handshake_timeout()).await?;

        Ok((
            Connection {
                uri: uri.to_string(),
                transport,
            },
            session,
        ))
    }

    /// Make a freshly opened session current and watch for it closing.
    fn install(&self, connection: Connection, session: ChannelSession) {
        let session_id = session.id();
        let mut closed = session.closed_signal();
        {
            let mut state = self.inner.lock_state();
            state.connection = Some(connection);
            state.session = Some(session);
        }

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if closed.wait_for(|is_closed| *is_closed).await.is_ok() {
                on_transport_closed(&inner, session_id);
            }
        });
    }

    /// Leave the current channel and disconnect.
    pub fn leave(&self) -> String {
        leave_locked(&mut self.inner.lock_state())
    }

    /// Address of the current server, or `""`.
    pub fn report_server_uri(&self) -> String {
        self.inner
            .lock_state()
            .connection
            .as_ref()
            .map(|c| c.uri.clone())
            .unwrap_or_default()
    }

    /// Name of the joined channel, or `""`.
    pub fn report_channel_name(&self) -> String {
        self.inner
            .lock_state()
            .session
            .as_ref()
            .map(|s| s.channel_name().to_string())
            .unwrap_or_default()
    }

    /// Whether a channel is joined.
    pub fn is_joined(&self) -> bool {
        self.inner.lock_state().session.is_some()
    }

    /// Set `key` to `value` on the channel, or locally when not joined.
    pub fn set_value(&self, key: &str, value: &str) -> String {
        let key = key.trim();
        log::debug!("[WebChannel] setValue: {} = {}", key, value);

        let mut guard = self.inner.lock_state();
        let state = &mut *guard;
        match &state.session {
            None => {
                state.local.values.insert(key.to_string(), value.to_string());
                format!("local {key} = {value}")
            }
            Some(session) => match session.set_value(key, value) {
                Ok(()) => format!("published {key} = {value}"),
                Err(e) => {
                    log::warn!("[WebChannel] setValue failed: {}", e);
                    e.to_string()
                }
            },
        }
    }

    /// Current value of `key`, or `""` when unknown.
    pub fn value_of(&self, key: &str) -> String {
        let key = key.trim();

        let mut guard = self.inner.lock_state();
        let state = &mut *guard;
        match &state.session {
            None => state.local.values.get(key).cloned().unwrap_or_default(),
            Some(session) => match session.value(key) {
                Some(value) => {
                    state.local.values.insert(key.to_string(), value.clone());
                    value
                }
                None => String::new(),
            },
        }
    }

    /// Broadcast an event on the channel, or deliver it locally when not
    /// joined.
    pub fn send_event(&self, event_type: &str, data: &str) -> String {
        let event_type = event_type.trim();

        {
            let state = self.inner.lock_state();
            if let Some(session) = &state.session {
                return match session.broadcast_event(event_type, data) {
                    Ok(()) => format!("published event: {event_type} data: {data}"),
                    Err(e) => {
                        log::warn!("[WebChannel] sendEvent failed: {}", e);
                        e.to_string()
                    }
                };
            }
        }

        self.inner.on_event(ChannelEvent::new(event_type, data));
        format!("local event: {event_type} data: {data}")
    }

    /// Type of the last received event, or `""`.
    pub fn last_event_type(&self) -> String {
        self.inner
            .lock_state()
            .local
            .last_event
            .as_ref()
            .map(|e| e.event_type.clone())
            .unwrap_or_default()
    }

    /// Data of the last received event, or `""`.
    pub fn last_event_data(&self) -> String {
        self.inner
            .lock_state()
            .local
            .last_event
            .as_ref()
            .map(|e| e.data.clone())
            .unwrap_or_default()
    }
}

fn leave_locked(state: &mut ClientState) -> String {
    let Some(mut session) = state.session.take() else {
        disconnect_server(state);
        return NO_CHANNEL_JOINED.to_string();
    };
    let channel_name = session.channel_name().to_string();
    session.close();
    disconnect_server(state);
    format!("left from {channel_name}")
}

fn disconnect_server(state: &mut ClientState) {
    if let Some(mut connection) = state.connection.take() {
        connection.transport.disconnect();
        log::info!("[WebChannel] WebSocket disconnected: {}", connection.uri);
    }
}

/// Tear down after the transport went away, unless the session that closed
/// has already been replaced.
fn on_transport_closed(inner: &Weak<ClientInner>, session_id: Uuid) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut state = inner.lock_state();
    if state.session.as_ref().map(ChannelSession::id) != Some(session_id) {
        return;
    }
    let uri = state
        .connection
        .as_ref()
        .map(|c| c.uri.clone())
        .unwrap_or_default();
    leave_locked(&mut state);
    log::info!("[WebChannel] WebSocket closed: {}", uri);
}
