//! Channel session: one subscription to a named topic over a transport.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──open()──► Handshaking ──ack──► Open ──close()/transport lost──► Closed
//!                          │                                                  ▲
//!                          └──── timeout / rejection / transport lost ────────┘
//! ```
//!
//! While handshaking the session only looks for the bus's `subscribed` ack
//! for its own topic. Once open, a decoder task applies every inbound frame:
//! `SET_VALUE` updates the key/value map, `EVENT` records the last event and
//! fans it out to listeners in registration order. Control-plane frames,
//! unknown message types and malformed frames are logged and dropped; none of
//! them close the session.
//!
//! Publishes are fire-and-forget: a successful `set_value` only means the
//! frame was queued for the socket, not that any member received it.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{AppMessage, BusCommand, ChannelEvent, InboundFrame};
use crate::transport::{TransportEvent, TransportLink, TransportSender};

/// Callback notified of every event received on a session.
///
/// Returning an error (or panicking) is logged and does not affect the other
/// listeners.
pub type BroadcastEventListener = Arc<dyn Fn(&ChannelEvent) -> anyhow::Result<()> + Send + Sync>;

/// Identity of a registered listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Constructed, `open` not yet called.
    Created,
    /// Subscribe sent, waiting for the acknowledgment.
    Handshaking,
    /// Subscribed; inbound messages are being decoded.
    Open,
    /// Transport released. Terminal.
    Closed,
}

/// Errors that can occur during session operations.
#[derive(Debug)]
pub enum SessionError {
    /// The session has no transport to talk over.
    NoTransport,
    /// `open` was already called on this session.
    AlreadyOpen,
    /// The session was closed.
    Closed,
    /// The bus did not acknowledge the subscription in time.
    HandshakeTimeout(Duration),
    /// The bus answered the subscription with something other than success.
    SubscriptionRejected(String),
    /// The connection failed or was closed.
    TransportFailed(String),
    /// A frame could not be handed to the transport.
    SendFailed(String),
    /// A message could not be serialized.
    Encode(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTransport => write!(f, "No channel"),
            Self::AlreadyOpen => write!(f, "Session already opened"),
            Self::Closed => write!(f, "Session closed"),
            Self::HandshakeTimeout(after) => {
                write!(f, "Connection timeout after {}", describe_duration(*after))
            }
            Self::SubscriptionRejected(msg) => write!(f, "Subscription rejected: {msg}"),
            Self::TransportFailed(msg) => write!(f, "Transport failed: {msg}"),
            Self::SendFailed(msg) => write!(f, "Send failed: {msg}"),
            Self::Encode(msg) => write!(f, "Encode failed: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Human-readable duration for timeout messages: `3s`, `250ms`.
pub(crate) fn describe_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Mutable session state, shared with the decoder task.
struct SessionState {
    phase: SessionPhase,
    values: HashMap<String, String>,
    last_event: Option<ChannelEvent>,
    listeners: Vec<(ListenerId, BroadcastEventListener)>,
    next_listener_id: u64,
}

struct SessionShared {
    channel_name: String,
    state: Mutex<SessionState>,
    closed_tx: watch::Sender<bool>,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.lock().phase = phase;
    }

    fn mark_closed(&self) {
        let was_open = {
            let mut state = self.lock();
            std::mem::replace(&mut state.phase, SessionPhase::Closed) != SessionPhase::Closed
        };
        if was_open {
            self.closed_tx.send_replace(true);
        }
    }

    /// Decode and apply one steady-state inbound frame.
    fn handle_text(&self, text: &str) {
        match InboundFrame::parse(text) {
            Ok(InboundFrame::Control(control)) => {
                log::info!(
                    "[Session] {}: {}={}",
                    control.topic.as_deref().unwrap_or("-"),
                    control.action,
                    control.message_text()
                );
            }
            Ok(InboundFrame::Application(message)) => self.apply(message),
            Err(e) => {
                log::error!(
                    "[Session] \"{}\": {} in {}",
                    self.channel_name,
                    e,
                    text.chars().take(200).collect::<String>()
                );
            }
        }
    }

    fn apply(&self, message: AppMessage) {
        match message {
            AppMessage::SetValue { key, value } => {
                log::trace!("[Session] \"{}\": {} = {}", self.channel_name, key, value);
                self.lock().values.insert(key, value);
            }
            AppMessage::Event(event) => {
                // Snapshot so listeners can (un)register without affecting this pass.
                let listeners = {
                    let mut state = self.lock();
                    state.last_event = Some(event.clone());
                    state.listeners.clone()
                };
                notify_listeners(&listeners, &event);
            }
            AppMessage::Unknown { kind, .. } => {
                log::error!("[Session] Unknown message type:{}", kind);
            }
        }
    }
}

fn notify_listeners(listeners: &[(ListenerId, BroadcastEventListener)], event: &ChannelEvent) {
    for (id, listener) in listeners {
        match std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("[Session] Listener {:?} failed: {:#}", id, e),
            Err(_) => log::error!("[Session] Listener {:?} panicked", id),
        }
    }
}

/// Client-side subscription to one channel.
pub struct ChannelSession {
    id: Uuid,
    shared: Arc<SessionShared>,
    sender: Option<TransportSender>,
    incoming: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    decoder: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSession")
            .field("id", &self.id)
            .field("channel_name", &self.shared.channel_name)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl ChannelSession {
    /// Create a session for `channel_name` over `link`.
    pub fn new(channel_name: impl Into<String>, link: TransportLink) -> Self {
        let mut session = Self::unbound(channel_name);
        session.sender = Some(link.sender);
        session.incoming = Some(link.incoming);
        session
    }

    /// Create a session with no transport. `open` fails and publishes are
    /// no-ops.
    pub fn unbound(channel_name: impl Into<String>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            shared: Arc::new(SessionShared {
                channel_name: channel_name.into(),
                state: Mutex::new(SessionState {
                    phase: SessionPhase::Created,
                    values: HashMap::new(),
                    last_event: None,
                    listeners: Vec::new(),
                    next_listener_id: 0,
                }),
                closed_tx,
            }),
            sender: None,
            incoming: None,
            decoder: None,
        }
    }

    /// Unique id of this session.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the joined channel.
    pub fn channel_name(&self) -> &str {
        &self.shared.channel_name
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        self.shared.lock().phase
    }

    /// Whether the subscription is acknowledged and the session not closed.
    pub fn is_open(&self) -> bool {
        self.phase() == SessionPhase::Open
    }

    /// Watch that flips to `true` once the session is closed, whether by
    /// [`Self::close`] or by the transport going away.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shared.closed_tx.subscribe()
    }

    /// Subscribe to the channel and start decoding inbound messages.
    ///
    /// The acknowledgment is raced against `handshake_timeout`. On timeout,
    /// rejection or transport failure the session is closed before the error
    /// is returned.
    pub async fn open(&mut self, handshake_timeout: Duration) -> Result<(), SessionError> {
        if self.phase() == SessionPhase::Closed {
            return Err(SessionError::Closed);
        }
        let Some(sender) = self.sender.clone() else {
            return Err(SessionError::NoTransport);
        };
        let Some(mut incoming) = self.incoming.take() else {
            return Err(SessionError::AlreadyOpen);
        };

        self.shared.set_phase(SessionPhase::Handshaking);
        let channel_name = self.shared.channel_name.clone();

        let handshake = async {
            let subscribe = BusCommand::subscribe(&channel_name)
                .encode()
                .map_err(|e| SessionError::Encode(e.to_string()))?;
            sender
                .send_text(subscribe)
                .map_err(|e| SessionError::TransportFailed(format!("{e:#}")))?;
            await_subscription(&channel_name, &mut incoming).await
        };

        let outcome = match tokio::time::timeout(handshake_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::HandshakeTimeout(handshake_timeout)),
        };

        match outcome {
            Ok(()) => {
                log::info!("[Session] Subscribed to \"{}\"", channel_name);
                self.shared.set_phase(SessionPhase::Open);
                self.decoder = Some(tokio::spawn(run_decoder(
                    Arc::clone(&self.shared),
                    incoming,
                )));
                Ok(())
            }
            Err(e) => {
                log::warn!("[Session] Handshake for \"{}\" failed: {}", channel_name, e);
                self.close();
                Err(e)
            }
        }
    }

    /// Release the transport and stop decoding. Idempotent.
    pub fn close(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            decoder.abort();
        }
        self.incoming = None;
        if let Some(sender) = self.sender.take() {
            sender.close();
            log::info!("[Session] Closed \"{}\"", self.shared.channel_name);
        }
        self.shared.mark_closed();
    }

    /// Publish a key/value update to the channel.
    ///
    /// Silently does nothing when the session has no transport.
    pub fn set_value(&self, key: &str, value: &str) -> Result<(), SessionError> {
        self.publish(&AppMessage::SetValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Broadcast an event to every member of the channel, including this one.
    ///
    /// Silently does nothing when the session has no transport.
    pub fn broadcast_event(&self, event_type: &str, data: &str) -> Result<(), SessionError> {
        self.publish(&AppMessage::Event(ChannelEvent::new(event_type, data)))
    }

    fn publish(&self, message: &AppMessage) -> Result<(), SessionError> {
        let Some(sender) = &self.sender else {
            return Ok(());
        };
        let payload = BusCommand::publish(&self.shared.channel_name, message)
            .and_then(|cmd| cmd.encode())
            .map_err(|e| SessionError::Encode(e.to_string()))?;
        sender
            .send_text(payload)
            .map_err(|e| SessionError::SendFailed(format!("{e:#}")))
    }

    /// Last value received for `key`, or `None` if none has arrived yet.
    pub fn value(&self, key: &str) -> Option<String> {
        self.shared.lock().values.get(key).cloned()
    }

    /// Most recently received event.
    pub fn last_event(&self) -> Option<ChannelEvent> {
        self.shared.lock().last_event.clone()
    }

    /// Register a listener for received events. Listeners are notified in
    /// registration order.
    pub fn add_broadcast_event_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChannelEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut state = self.shared.lock();
        let id = ListenerId(state.next_listener_id);
        state.next_listener_id += 1;
        state.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_broadcast_event_listener(&self, id: ListenerId) -> bool {
        let mut state = self.shared.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(registered, _)| *registered != id);
        state.listeners.len() != before
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wait for the bus to acknowledge the subscription to `channel_name`.
async fn await_subscription(
    channel_name: &str,
    incoming: &mut mpsc::UnboundedReceiver<TransportEvent>,
) -> Result<(), SessionError> {
    while let Some(event) = incoming.recv().await {
        match event {
            TransportEvent::Text(text) => match InboundFrame::parse(&text) {
                Ok(InboundFrame::Control(control)) => {
                    match control.subscription_result(channel_name) {
                        Some(true) => return Ok(()),
                        Some(false) => {
                            return Err(SessionError::SubscriptionRejected(control.message_text()))
                        }
                        None => log::info!(
                            "[Session] {}: {}={}",
                            control.topic.as_deref().unwrap_or("-"),
                            control.action,
                            control.message_text()
                        ),
                    }
                }
                Ok(InboundFrame::Application(_)) => {
                    log::debug!(
                        "[Session] Ignoring message before subscription to \"{}\"",
                        channel_name
                    );
                }
                Err(e) => log::warn!("[Session] {} while subscribing", e),
            },
            TransportEvent::Closed { code, reason } => {
                return Err(SessionError::TransportFailed(format!(
                    "connection closed ({code}) {reason}"
                )));
            }
            TransportEvent::Error(e) => return Err(SessionError::TransportFailed(e)),
        }
    }
    Err(SessionError::TransportFailed("connection closed".to_string()))
}

/// Steady-state decoder: apply frames until the transport goes away.
async fn run_decoder(
    shared: Arc<SessionShared>,
    mut incoming: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = incoming.recv().await {
        match event {
            TransportEvent::Text(text) => shared.handle_text(&text),
            TransportEvent::Closed { code, reason } => {
                log::info!(
                    "[Session] Transport for \"{}\" closed ({}) {}",
                    shared.channel_name,
                    code,
                    reason
                );
                break;
            }
            TransportEvent::Error(e) => {
                log::error!("[Session] Transport for \"{}\" failed: {}", shared.channel_name, e);
                break;
            }
        }
    }
    shared.mark_closed();
}
