//! webchannel - join pub/sub web channels over WebSocket.
//!
//! A channel is a named topic on a pub/sub bus. Members of a channel share a
//! key/value map and broadcast events to each other.
//!
//! # Architecture
//!
//! - [`ChannelClient`] - connection manager and caller-facing surface; every
//!   operation resolves to a display string
//! - [`ChannelSession`] - one subscription: handshake, decode, listeners
//! - [`transport`] - WebSocket connection pumped into in-process queues
//! - [`protocol`] - envelope and application message formats
//!
//! # Example
//!
//! ```ignore
//! let client = webchannel::ChannelClient::default();
//! let mut events = client.subscribe_events();
//!
//! if let Some(result) = client.join("room1", "s1.yengawa.com/wc").await {
//!     println!("{result}");
//! }
//! client.set_value("score", "10");
//! client.send_event("ping", "hello");
//! let event = events.recv().await?;
//! ```

// Rust guideline compliant 2026-02

pub mod client;
pub mod commands;
pub mod config;
pub mod constants;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use client::{ChannelClient, ChannelClientBuilder, EventHook};
pub use config::ClientConfig;
pub use protocol::{AppMessage, BusCommand, ChannelEvent, InboundFrame};
pub use session::{
    BroadcastEventListener, ChannelSession, ListenerId, SessionError, SessionPhase,
};
pub use transport::{Transport, TransportEvent, TransportLink};
