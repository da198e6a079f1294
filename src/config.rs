//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Session hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Observer WebSocket server bind address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Directory holding the protocol session's credential material
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,

    /// WebSocket URL of the protocol sidecar
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,

    /// Maximum number of history entries kept in memory
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Fixed delay before a reconnect attempt, in seconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Timeout for a single request to the protocol session, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Per-observer outbound queue length
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,

    /// Largest accepted media upload after decoding
    #[serde(default = "default_max_media_bytes")]
    pub max_media_bytes: usize,

    /// Start a session at boot when credentials are already present
    #[serde(default)]
    pub auto_start: bool,

    /// Enable debug mode (log raw frames)
    #[serde(default)]
    pub debug_mode: bool,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_session_dir() -> PathBuf {
    PathBuf::from("./session")
}

fn default_bridge_url() -> String {
    "ws://127.0.0.1:8765".to_string()
}

fn default_history_capacity() -> usize {
    2000
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_observer_buffer() -> usize {
    64
}

fn default_max_media_bytes() -> usize {
    20 * 1024 * 1024
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            session_dir: default_session_dir(),
            bridge_url: default_bridge_url(),
            history_capacity: default_history_capacity(),
            reconnect_delay_secs: default_reconnect_delay(),
            request_timeout_secs: default_request_timeout(),
            observer_buffer: default_observer_buffer(),
            max_media_bytes: default_max_media_bytes(),
            auto_start: false,
            debug_mode: false,
        }
    }
}

impl HubConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        // A bare PORT binds all interfaces
        let listen_addr = match (std::env::var("LISTEN_ADDR"), std::env::var("PORT")) {
            (Ok(addr), _) => addr,
            (Err(_), Ok(port)) => {
                let port: u16 = port.parse().context("PORT must be a valid port number")?;
                format!("0.0.0.0:{}", port)
            }
            _ => default_listen_addr(),
        };

        let history_capacity = parse_var("HISTORY_CAPACITY", default_history_capacity());
        if history_capacity == 0 {
            anyhow::bail!("HISTORY_CAPACITY must be at least 1");
        }

        Ok(Self {
            listen_addr,
            session_dir: std::env::var("SESSION_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_session_dir()),
            bridge_url: std::env::var("BRIDGE_URL").unwrap_or_else(|_| default_bridge_url()),
            history_capacity,
            reconnect_delay_secs: parse_var("RECONNECT_DELAY_SECS", default_reconnect_delay()),
            request_timeout_secs: parse_var("REQUEST_TIMEOUT_SECS", default_request_timeout()),
            observer_buffer: parse_var("OBSERVER_BUFFER", default_observer_buffer()).max(1),
            max_media_bytes: parse_var("MAX_MEDIA_BYTES", default_max_media_bytes()),
            auto_start: std::env::var("AUTO_START").is_ok(),
            debug_mode: std::env::var("DEBUG_MODE").is_ok(),
        })
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
