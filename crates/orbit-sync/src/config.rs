//! # Sync Configuration
//!
//! Endpoint and tuning configuration for the data layer.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     ORBIT_API_BASE_URL=https://admin.example.com/api/                  │
//! │     ORBIT_WS_ENDPOINT=realtime                                         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/orbit-admin/sync.toml (Linux)                            │
//! │     ~/Library/Application Support/com.orbit.admin/sync.toml (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     Tuning only. Endpoints have NO default.                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [store]
//! api_base_url = "https://admin.example.com/api/"
//! ws_endpoint = "realtime"
//! ws_token_endpoint = "auth/ws-token"
//!
//! [cache]
//! gc_time_secs = 300
//!
//! [channel]
//! initial_backoff_ms = 1000
//! max_backoff_secs = 30
//! jitter = 0.2
//!
//! [http]
//! request_timeout_secs = 15
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Store Configuration
// =============================================================================

/// Endpoints of the remote admin API and its push channel.
///
/// Built explicitly and handed to every component. There is no global
/// default: a component constructed without one fails with
/// [`SyncError::ConfigurationMissing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    api_base_url: Url,
    ws_endpoint: String,
    ws_token_endpoint: String,
}

impl StoreConfig {
    /// Creates a store config from a base URL and two endpoint paths.
    ///
    /// Paths are relative to `api_base_url`; a trailing `/` is added to the
    /// base so `join` keeps its last segment.
    pub fn new(
        api_base_url: &str,
        ws_endpoint: impl Into<String>,
        ws_token_endpoint: impl Into<String>,
    ) -> SyncResult<Self> {
        let mut base = Url::parse(api_base_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "API base URL must start with http:// or https://, got: {}",
                api_base_url
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let ws_endpoint = ws_endpoint.into();
        let ws_token_endpoint = ws_token_endpoint.into();
        if ws_endpoint.trim().is_empty() {
            return Err(SyncError::ConfigurationMissing("store.ws_endpoint".into()));
        }
        if ws_token_endpoint.trim().is_empty() {
            return Err(SyncError::ConfigurationMissing(
                "store.ws_token_endpoint".into(),
            ));
        }

        Ok(StoreConfig {
            api_base_url: base,
            ws_endpoint,
            ws_token_endpoint,
        })
    }

    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    pub fn api_base_url(&self) -> &Url {
        &self.api_base_url
    }

    /// Resolves an API path (with optional query string) against the base URL.
    pub fn api_url(&self, path: &str) -> SyncResult<Url> {
        Ok(self.api_base_url.join(path.trim_start_matches('/'))?)
    }

    /// URL of the short-lived push token endpoint.
    pub fn ws_token_url(&self) -> SyncResult<Url> {
        self.api_url(&self.ws_token_endpoint)
    }

    /// Push channel URL: `ws_endpoint` against the base, with `http`→`ws`
    /// and `https`→`wss`.
    ///
    /// An absolute `ws://`/`wss://` endpoint is used as-is.
    pub fn ws_url(&self) -> SyncResult<Url> {
        if self.ws_endpoint.starts_with("ws://") || self.ws_endpoint.starts_with("wss://") {
            return Ok(Url::parse(&self.ws_endpoint)?);
        }
        let mut url = self.api_url(&self.ws_endpoint)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::InvalidUrl(format!("cannot use {} scheme", scheme)))?;
        Ok(url)
    }
}

/// Builder for [`StoreConfig`]; `build` reports the first missing field.
#[derive(Debug, Clone, Default)]
pub struct StoreConfigBuilder {
    api_base_url: Option<String>,
    ws_endpoint: Option<String>,
    ws_token_endpoint: Option<String>,
}

impl StoreConfigBuilder {
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    pub fn ws_endpoint(mut self, path: impl Into<String>) -> Self {
        self.ws_endpoint = Some(path.into());
        self
    }

    pub fn ws_token_endpoint(mut self, path: impl Into<String>) -> Self {
        self.ws_token_endpoint = Some(path.into());
        self
    }

    pub fn build(self) -> SyncResult<StoreConfig> {
        let base = self
            .api_base_url
            .ok_or_else(|| SyncError::ConfigurationMissing("store.api_base_url".into()))?;
        let ws = self
            .ws_endpoint
            .ok_or_else(|| SyncError::ConfigurationMissing("store.ws_endpoint".into()))?;
        let token = self
            .ws_token_endpoint
            .ok_or_else(|| SyncError::ConfigurationMissing("store.ws_token_endpoint".into()))?;
        StoreConfig::new(&base, ws, token)
    }
}

/// `[store]` section as written in TOML. Every field is optional on disk so
/// a missing one is reported by name instead of as a parse error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub ws_endpoint: Option<String>,
    #[serde(default)]
    pub ws_token_endpoint: Option<String>,
}

impl StoreSection {
    fn is_empty(&self) -> bool {
        self.api_base_url.is_none() && self.ws_endpoint.is_none() && self.ws_token_endpoint.is_none()
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

/// Query cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// How long an entry without subscribers is kept before eviction.
    /// 0 evicts as soon as the entry is idle.
    #[serde(default = "default_gc_time")]
    pub gc_time_secs: u64,
}

fn default_gc_time() -> u64 {
    300
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            gc_time_secs: default_gc_time(),
        }
    }
}

impl CacheSettings {
    pub fn gc_time(&self) -> Duration {
        Duration::from_secs(self.gc_time_secs)
    }
}

// =============================================================================
// Channel Settings
// =============================================================================

/// Push channel tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Handshake timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// First reconnect delay (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Reconnect delay cap (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Extra random delay as a fraction of the base delay (0.0 - 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Keepalive ping interval (seconds).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Capacity of the push event broadcast queue.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Push tokens are refreshed this long before they expire (seconds).
    #[serde(default = "default_token_refresh_margin")]
    pub token_refresh_margin_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    30
}
fn default_jitter() -> f64 {
    0.2
}
fn default_ping_interval() -> u64 {
    30
}
fn default_event_buffer() -> usize {
    256
}
fn default_token_refresh_margin() -> u64 {
    30
}

impl Default for ChannelSettings {
    fn default() -> Self {
        ChannelSettings {
            connect_timeout_secs: default_connect_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            jitter: default_jitter(),
            ping_interval_secs: default_ping_interval(),
            event_buffer: default_event_buffer(),
            token_refresh_margin_secs: default_token_refresh_margin(),
        }
    }
}

// =============================================================================
// HTTP Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_request_timeout() -> u64 {
    15
}

fn default_user_agent() -> String {
    format!("orbit-sync/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            request_timeout_secs: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete data layer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Remote endpoints (required).
    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub channel: ChannelSettings,

    #[serde(default)]
    pub http: HttpSettings,
}

impl SyncConfig {
    /// Creates a config around an already built [`StoreConfig`].
    pub fn with_store(store: &StoreConfig) -> Self {
        SyncConfig {
            store: StoreSection {
                api_base_url: Some(store.api_base_url.to_string()),
                ws_endpoint: Some(store.ws_endpoint.clone()),
                ws_token_endpoint: Some(store.ws_token_endpoint.clone()),
            },
            ..Default::default()
        }
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Builds the [`StoreConfig`] or names the first missing field.
    pub fn store_config(&self) -> SyncResult<StoreConfig> {
        if self.store.is_empty() {
            return Err(SyncError::ConfigurationMissing("store".into()));
        }
        let mut builder = StoreConfig::builder();
        if let Some(url) = &self.store.api_base_url {
            builder = builder.api_base_url(url.clone());
        }
        if let Some(ws) = &self.store.ws_endpoint {
            builder = builder.ws_endpoint(ws.clone());
        }
        if let Some(token) = &self.store.ws_token_endpoint {
            builder = builder.ws_token_endpoint(token.clone());
        }
        builder.build()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        self.store_config()?;

        let ch = &self.channel;
        if !(0.0..=1.0).contains(&ch.jitter) {
            return Err(SyncError::InvalidConfig(format!(
                "channel.jitter must be between 0.0 and 1.0, got {}",
                ch.jitter
            )));
        }
        if ch.initial_backoff_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "channel.initial_backoff_ms must be greater than 0".into(),
            ));
        }
        if Duration::from_millis(ch.initial_backoff_ms) > Duration::from_secs(ch.max_backoff_secs) {
            return Err(SyncError::InvalidConfig(
                "channel.max_backoff_secs must not be below initial_backoff_ms".into(),
            ));
        }
        if ch.event_buffer == 0 {
            return Err(SyncError::InvalidConfig(
                "channel.event_buffer must be greater than 0".into(),
            ));
        }
        if ch.ping_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "channel.ping_interval_secs must be greater than 0".into(),
            ));
        }
        if self.http.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "http.request_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("ORBIT_API_BASE_URL") {
            debug!(url = %url, "Overriding API base URL from environment");
            self.store.api_base_url = Some(url);
        }

        if let Ok(path) = std::env::var("ORBIT_WS_ENDPOINT") {
            self.store.ws_endpoint = Some(path);
        }

        if let Ok(path) = std::env::var("ORBIT_WS_TOKEN_ENDPOINT") {
            self.store.ws_token_endpoint = Some(path);
        }

        if let Ok(secs) = std::env::var("ORBIT_GC_TIME_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.cache.gc_time_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid ORBIT_GC_TIME_SECS"),
            }
        }

        if let Ok(secs) = std::env::var("ORBIT_HTTP_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.http.request_timeout_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid ORBIT_HTTP_TIMEOUT_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "orbit", "admin")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }
}
