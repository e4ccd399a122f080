//! Relay Configuration
//!
//! Configuration loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Directory name used under the platform data directory.
#[cfg(any(target_os = "windows", target_os = "macos"))]
const APP_DIR_NAME: &str = "DeckRelay";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const APP_DIR_NAME: &str = "deck-relay";

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Plaintext WebSocket listener.
    pub plain_addr: SocketAddr,
    /// TLS WebSocket listener.
    pub secure_addr: SocketAddr,
    /// Status/metrics HTTP endpoint. `None` disables it.
    pub status_addr: Option<SocketAddr>,
    /// Directory holding the certificate pair and the settings file.
    pub data_dir: PathBuf,
    /// Shared secret required to claim the primary role. `None` accepts any claim.
    pub shared_secret: Option<String>,
    /// Retries of a broadcast issued while no primary connection exists.
    pub broadcast_max_attempts: u32,
    /// Delay between broadcast retries, in milliseconds.
    pub broadcast_retry_ms: u64,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// WebSocket/TLS handshake timeout in seconds.
    pub handshake_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            plain_addr: SocketAddr::from(([127, 0, 0, 1], 30385)),
            secure_addr: SocketAddr::from(([127, 0, 0, 1], 30386)),
            status_addr: Some(SocketAddr::from(([127, 0, 0, 1], 30387))),
            data_dir: default_data_dir(),
            shared_secret: None,
            broadcast_max_attempts: 10,
            broadcast_retry_ms: 500,
            max_message_size: 4 * 1_048_576, // 4 MB, trigger lists can be large
            handshake_timeout_secs: 10,
        }
    }
}

/// Per-OS application data directory:
/// - Windows: `%LOCALAPPDATA%\DeckRelay`
/// - macOS: `~/Library/Application Support/DeckRelay`
/// - others: `~/.config/deck-relay`
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    let base = dirs::data_local_dir();
    #[cfg(target_os = "macos")]
    let base = dirs::data_dir();
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    let base = dirs::config_dir();

    base.unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("RELAY_PLAIN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.plain_addr = parsed;
            }
        }

        if let Ok(addr) = std::env::var("RELAY_SECURE_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.secure_addr = parsed;
            }
        }

        if let Ok(addr) = std::env::var("RELAY_STATUS_ADDR") {
            if addr.eq_ignore_ascii_case("off") {
                config.status_addr = None;
            } else if let Ok(parsed) = addr.parse() {
                config.status_addr = Some(parsed);
            }
        }

        if let Ok(val) = std::env::var("RELAY_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("RELAY_SHARED_SECRET") {
            if !val.is_empty() {
                config.shared_secret = Some(val);
            }
        }

        if let Ok(val) = std::env::var("RELAY_BROADCAST_MAX_ATTEMPTS") {
            if let Ok(parsed) = val.parse() {
                config.broadcast_max_attempts = parsed;
            }
        }

        if let Ok(val) = std::env::var("RELAY_BROADCAST_RETRY_MS") {
            if let Ok(parsed) = val.parse() {
                config.broadcast_retry_ms = parsed;
            }
        }

        if let Ok(val) = std::env::var("RELAY_MAX_MESSAGE_SIZE") {
            if let Ok(parsed) = val.parse() {
                config.max_message_size = parsed;
            }
        }

        if let Ok(val) = std::env::var("RELAY_HANDSHAKE_TIMEOUT") {
            if let Ok(parsed) = val.parse() {
                config.handshake_timeout_secs = parsed;
            }
        }

        config
    }

    /// Returns the broadcast retry interval as a Duration.
    pub fn broadcast_retry_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_retry_ms)
    }

    /// Returns the handshake timeout as a Duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Path of the host settings file the connection counts are written to.
    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("global_settings.json")
    }
}
