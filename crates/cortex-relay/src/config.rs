//! # Configuration
//!
//! [`RelayConfig`] holds everything needed to acquire and relay samples.
//!
//! ## Loading Priority
//!
//! Configuration is loaded from the first source that provides a value:
//!
//! 1. Explicit struct fields (programmatic construction)
//! 2. Environment variables (`EMOTIV_CLIENT_ID`, `EMOTIV_CLIENT_SECRET`, ...)
//! 3. TOML config file at an explicit path
//! 4. `./relay.toml` in the current directory
//! 5. `~/.config/cortex-relay/relay.toml`
//!
//! Credential fields can always be overridden by environment variables,
//! even when loading from a file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RelayError, RelayResult};
use crate::protocol::frames::ChannelSelection;
use crate::signal::FilterSpec;

/// Default Cortex WebSocket URL (localhost, self-signed TLS).
pub const DEFAULT_CORTEX_URL: &str = "wss://localhost:6868";

/// Default consumer-facing broadcast bind address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8765";

/// Default delay between control reconnect attempts, in milliseconds.
const DEFAULT_RETRY_INTERVAL_MS: u64 = 3000;

/// Default post-subscribe grace period before re-subscribing, in milliseconds.
const DEFAULT_SUBSCRIBE_GRACE_MS: u64 = 5000;

/// Default stream watchdog tick, in milliseconds.
const DEFAULT_WATCHDOG_TICK_MS: u64 = 1000;

/// Default silence threshold before the headset is presumed gone, in milliseconds.
const DEFAULT_SILENCE_TIMEOUT_MS: u64 = 5000;

/// Default resubscribe attempt budget before a hard reset.
const DEFAULT_MAX_RESUBSCRIBE_ATTEMPTS: u32 = 3;

/// Default EPOC X sampling rate in Hz.
const DEFAULT_SAMPLING_RATE_HZ: f64 = 256.0;

/// Configuration for the session manager and broadcast relay.
///
/// # Examples
///
/// ## From environment variables
///
/// ```no_run
/// use cortex_relay::config::RelayConfig;
///
/// // Set EMOTIV_CLIENT_ID and EMOTIV_CLIENT_SECRET env vars, then:
/// let config = RelayConfig::from_env().expect("missing env vars");
/// ```
///
/// ## Programmatic
///
/// ```
/// use cortex_relay::config::RelayConfig;
///
/// let config = RelayConfig::new("my-client-id", "my-client-secret");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Cortex API client ID from the Emotiv developer portal.
    pub client_id: String,

    /// Cortex API client secret.
    pub client_secret: String,

    /// WebSocket URL for the Cortex control service.
    #[serde(default = "default_cortex_url")]
    pub cortex_url: String,

    /// Allow insecure TLS connections to non-localhost hosts.
    /// Only enable this for development/testing.
    #[serde(default)]
    pub allow_insecure_tls: bool,

    /// Print each lifecycle event as a JSON record on stdout.
    #[serde(default = "default_true")]
    pub emit_event_lines: bool,

    /// Consumer-facing broadcast server configuration.
    #[serde(default)]
    pub broadcast: BroadcastConfig,

    /// Control reconnect configuration.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Liveness watchdog configuration.
    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Sample conditioning and channel selection.
    #[serde(default)]
    pub signal: SignalConfig,
}

/// Consumer-facing broadcast server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Address the broadcast WebSocket server listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

/// Control connection rebuild behavior.
///
/// The driver uses a fixed inter-attempt delay; recovery pacing inside a
/// live connection (headset re-query, authorize retry) uses the same
/// interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay between reconnect/retry attempts, in milliseconds.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
}

/// Liveness monitoring: the post-subscribe guard and the stream watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Grace period after a subscribe ack before checking that data
    /// actually flows, in milliseconds.
    #[serde(default = "default_subscribe_grace")]
    pub subscribe_grace_ms: u64,

    /// Stream watchdog check interval, in milliseconds.
    #[serde(default = "default_watchdog_tick")]
    pub watchdog_tick_ms: u64,

    /// Silence duration after which the headset is presumed disconnected,
    /// in milliseconds.
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout_ms: u64,

    /// Resubscribe attempts before giving up and performing a hard reset.
    #[serde(default = "default_max_resubscribe_attempts")]
    pub max_resubscribe_attempts: u32,
}

/// Sample conditioning and channel selection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Headset sampling rate in Hz.
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate_hz: f64,

    /// Run samples through the configured conditioner before relaying.
    #[serde(default)]
    pub apply_filtering: bool,

    /// Which EEG channels to relay.
    #[serde(default)]
    pub channel_selection: ChannelSelection,

    /// Filter design parameters handed to the conditioner.
    #[serde(default)]
    pub filter: FilterSpec,
}

// ─── Defaults ───────────────────────────────────────────────────────────

fn default_cortex_url() -> String {
    DEFAULT_CORTEX_URL.to_string()
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}

fn default_true() -> bool {
    true
}

fn default_retry_interval() -> u64 {
    DEFAULT_RETRY_INTERVAL_MS
}

fn default_subscribe_grace() -> u64 {
    DEFAULT_SUBSCRIBE_GRACE_MS
}

fn default_watchdog_tick() -> u64 {
    DEFAULT_WATCHDOG_TICK_MS
}

fn default_silence_timeout() -> u64 {
    DEFAULT_SILENCE_TIMEOUT_MS
}

fn default_max_resubscribe_attempts() -> u32 {
    DEFAULT_MAX_RESUBSCRIBE_ATTEMPTS
}

fn default_sampling_rate() -> f64 {
    DEFAULT_SAMPLING_RATE_HZ
}

// ─── Default impls ──────────────────────────────────────────────────────

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            subscribe_grace_ms: DEFAULT_SUBSCRIBE_GRACE_MS,
            watchdog_tick_ms: DEFAULT_WATCHDOG_TICK_MS,
            silence_timeout_ms: DEFAULT_SILENCE_TIMEOUT_MS,
            max_resubscribe_attempts: DEFAULT_MAX_RESUBSCRIBE_ATTEMPTS,
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            sampling_rate_hz: DEFAULT_SAMPLING_RATE_HZ,
            apply_filtering: false,
            channel_selection: ChannelSelection::default(),
            filter: FilterSpec::default(),
        }
    }
}

// ─── RelayConfig impl ───────────────────────────────────────────────────

impl RelayConfig {
    /// Create a config with just client credentials (all other fields use
    /// defaults).
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            cortex_url: default_cortex_url(),
            allow_insecure_tls: false,
            emit_event_lines: true,
            broadcast: BroadcastConfig::default(),
            reconnect: ReconnectConfig::default(),
            liveness: LivenessConfig::default(),
            signal: SignalConfig::default(),
        }
    }

    /// Load config from environment variables.
    ///
    /// Required: `EMOTIV_CLIENT_ID`, `EMOTIV_CLIENT_SECRET`
    ///
    /// Optional: `EMOTIV_CORTEX_URL`, `RELAY_BIND_ADDR`
    pub fn from_env() -> RelayResult<Self> {
        let client_id = std::env::var("EMOTIV_CLIENT_ID").map_err(|_| RelayError::Config {
            reason: "EMOTIV_CLIENT_ID environment variable not set".into(),
        })?;
        let client_secret =
            std::env::var("EMOTIV_CLIENT_SECRET").map_err(|_| RelayError::Config {
                reason: "EMOTIV_CLIENT_SECRET environment variable not set".into(),
            })?;

        let mut config = Self::new(client_id, client_secret);

        if let Ok(url) = std::env::var("EMOTIV_CORTEX_URL") {
            config.cortex_url = url;
        }
        if let Ok(addr) = std::env::var("RELAY_BIND_ADDR") {
            config.broadcast.bind_addr = addr;
        }

        Ok(config)
    }

    /// Load config from a TOML file, with environment variable overrides
    /// for `client_id`, `client_secret`, and `cortex_url`.
    #[cfg(feature = "config-toml")]
    pub fn from_file(path: impl AsRef<Path>) -> RelayResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| RelayError::Config {
            reason: format!("failed to read config file '{}': {}", path.display(), e),
        })?;
        let mut config: Self = toml::from_str(&contents)?;

        if let Ok(id) = std::env::var("EMOTIV_CLIENT_ID") {
            config.client_id = id;
        }
        if let Ok(secret) = std::env::var("EMOTIV_CLIENT_SECRET") {
            config.client_secret = secret;
        }
        if let Ok(url) = std::env::var("EMOTIV_CORTEX_URL") {
            config.cortex_url = url;
        }

        Ok(config)
    }

    /// Discover and load config from the standard search path:
    ///
    /// 1. Explicit path (if `Some`)
    /// 2. `RELAY_CONFIG` environment variable
    /// 3. `./relay.toml`
    /// 4. `~/.config/cortex-relay/relay.toml`
    ///
    /// Falls back to environment-variable-only config if no file is found.
    #[cfg(feature = "config-toml")]
    pub fn discover(explicit_path: Option<&Path>) -> RelayResult<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var("RELAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        let local_path = PathBuf::from("relay.toml");
        if local_path.exists() {
            return Self::from_file(&local_path);
        }

        if let Some(config_path) = dirs_config_path() {
            if config_path.exists() {
                return Self::from_file(&config_path);
            }
        }

        Self::from_env()
    }

    /// Returns `true` if invalid TLS certificates should be accepted for
    /// the configured control URL.
    ///
    /// Always allowed for `localhost` and `127.0.0.1` (the Cortex service
    /// uses a self-signed cert). For other hosts, `allow_insecure_tls`
    /// must be explicitly set.
    pub fn should_accept_invalid_certs(&self) -> bool {
        if is_localhost(&self.cortex_url) {
            return true;
        }
        self.allow_insecure_tls
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

/// Check if a WebSocket URL points to localhost.
fn is_localhost(url: &str) -> bool {
    let authority = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .unwrap_or(url);

    // Handle IPv6 bracket notation: [::1]:6868
    if let Some(rest) = authority.strip_prefix('[') {
        let host = rest.split(']').next().unwrap_or("");
        return host == "::1";
    }

    let host = if let Some(idx) = authority.rfind(':') {
        &authority[..idx]
    } else {
        authority
    };
    matches!(host, "localhost" | "127.0.0.1")
}

/// Platform-appropriate config file path.
#[cfg(feature = "config-toml")]
fn dirs_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .ok()
            .map(|dir| PathBuf::from(dir).join("cortex-relay").join("relay.toml"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(|dir| {
            PathBuf::from(dir)
                .join(".config")
                .join("cortex-relay")
                .join("relay.toml")
        })
    }
}
