//! Application-wide constants for webchannel.
//!
//! Defaults for [`ClientConfig`](crate::ClientConfig) and the fixed strings
//! of the caller-facing surface live here so they can be found in one place.

// Rust guideline compliant 2026-02

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Upper bound on a whole join attempt (connect + subscribe handshake).
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 10_000;

/// How long a session waits for the bus to acknowledge its subscription.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 3_000;

/// Grace period for a dropped transport's pump to send its close frame
/// before the task is aborted.
pub const PUMP_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// Connection
// ============================================================================

/// Scheme prepended to server addresses given without one.
pub const DEFAULT_SCHEME: &str = "wss";

/// Capacity of the event-received broadcast queue. Slow subscribers that
/// fall further behind than this see `Lagged`.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Largest event queue capacity accepted from configuration.
pub const MAX_EVENT_BUFFER: usize = 65_536;

// ============================================================================
// Configuration files
// ============================================================================

/// Directory name under the platform config dir.
pub const CONFIG_DIR_NAME: &str = "webchannel";

/// Configuration file name inside [`CONFIG_DIR_NAME`].
pub const CONFIG_FILE_NAME: &str = "config.json";

// ============================================================================
// Caller-facing results
// ============================================================================

/// Result of `leave()` when no channel is joined.
pub const NO_CHANNEL_JOINED: &str = "no channel joined";
