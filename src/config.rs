//! Configuration loading.
//!
//! Settings come from `config.json` in the platform config directory (or an
//! explicit path), then `WEBCHANNEL_*` environment variables override
//! individual fields. A missing file means defaults.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    CONFIG_DIR_NAME, CONFIG_FILE_NAME, DEFAULT_EVENT_BUFFER, DEFAULT_HANDSHAKE_TIMEOUT_MS,
    DEFAULT_JOIN_TIMEOUT_MS, DEFAULT_SCHEME, MAX_EVENT_BUFFER,
};

/// Configuration for a [`ChannelClient`](crate::ChannelClient).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Overall bound on a join attempt, in milliseconds.
    pub join_timeout_ms: u64,
    /// Bound on the subscribe handshake, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Scheme used for server addresses given without one (`ws` or `wss`).
    pub scheme: String,
    /// Capacity of the event-received broadcast queue.
    pub event_buffer: usize,
    /// Extra headers sent with the WebSocket upgrade request.
    pub headers: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            scheme: DEFAULT_SCHEME.to_string(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            headers: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    /// Returns the configuration directory path.
    ///
    /// `WEBCHANNEL_CONFIG_DIR` overrides the platform default
    /// (macOS: ~/Library/Application Support/webchannel).
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("WEBCHANNEL_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join(CONFIG_DIR_NAME))
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Reads `path` when given, otherwise `config.json` in
    /// [`Self::config_dir`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_dir()?.join(CONFIG_FILE_NAME),
        };
        let mut config = Self::load_from_file(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads a config file; a missing file yields defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("[Config] No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Applies `WEBCHANNEL_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from `lookup`, ignoring unparseable values.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ms) = lookup("WEBCHANNEL_JOIN_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.join_timeout_ms = ms;
        }

        if let Some(ms) = lookup("WEBCHANNEL_HANDSHAKE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.handshake_timeout_ms = ms;
        }

        if let Some(scheme) = lookup("WEBCHANNEL_SCHEME") {
            match scheme.as_str() {
                "ws" | "wss" => self.scheme = scheme,
                other => log::warn!("[Config] Ignoring WEBCHANNEL_SCHEME={}: expected ws or wss", other),
            }
        }

        if let Some(size) = lookup("WEBCHANNEL_EVENT_BUFFER").and_then(|v| v.parse().ok()) {
            self.event_buffer = size;
        }
    }

    /// Join timeout as a [`Duration`].
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Upgrade request headers as borrowed pairs.
    pub fn header_pairs(&self) -> Vec<(&str, &str)> {
        self.headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect()
    }

    /// Event queue capacity, kept within `1..=MAX_EVENT_BUFFER`.
    pub fn event_capacity(&self) -> usize {
        if !(1..=MAX_EVENT_BUFFER).contains(&self.event_buffer) {
            log::warn!(
                "[Config] event_buffer {} out of range, clamping to 1..={}",
                self.event_buffer,
                MAX_EVENT_BUFFER
            );
        }
        self.event_buffer.clamp(1, MAX_EVENT_BUFFER)
    }
}
