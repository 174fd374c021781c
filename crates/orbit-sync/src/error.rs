//! # Sync Error Types
//!
//! Error types for cache, channel and API operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  ConfigMissing  │  │  Http           │  │  InvalidMessage         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  SerializationFailed    │ │
//! │  │  InvalidUrl     │  │  Disconnected   │  │  DeserializationFailed  │ │
//! │  │  ConfigLoad     │  │  Timeout        │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │      Auth       │  │     Domain      │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  AuthRequired   │  │  NotFound       │  │  ChannelError           │ │
//! │  │  TokenRejected  │  │  Validation     │  │  ShuttingDown           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cache entries never hold a `SyncError` directly; [`SyncError::info`]
//! turns one into the cloneable [`ErrorInfo`] record.

use orbit_core::{CoreError, ErrorInfo, ErrorKind, ValidationError};
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering every failure of the data layer.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// A required configuration value was not supplied.
    ///
    /// There is no implicit default endpoint; constructing a component
    /// without one fails here.
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Invalid configuration value.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Auth Errors
    // =========================================================================
    /// No session token is available.
    #[error("Authentication required")]
    AuthRequired,

    /// The server refused the session or push token.
    #[error("Token rejected: {0}")]
    TokenRejected(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// HTTP request completed with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Failed to reach the server.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Push channel closed unexpectedly.
    #[error("Disconnected from push channel")]
    Disconnected,

    /// Operation timed out.
    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid frame received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize a request or frame.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Response or cached value did not match the expected type.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Domain Errors
    // =========================================================================
    /// Entity does not exist on the server.
    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: String },

    /// Input rejected before sending.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Failure recorded on a cache entry, surfaced to a foreground caller.
    #[error("{0}")]
    Query(ErrorInfo),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Runtime is shutting down.
    #[error("Sync runtime is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            SyncError::DeserializationFailed(err.to_string())
        } else {
            SyncError::SerializationFailed(err.to_string())
        }
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return SyncError::Timeout(0);
        }
        if err.is_decode() {
            return SyncError::DeserializationFailed(err.to_string());
        }
        match err.status() {
            Some(status) => SyncError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => SyncError::ConnectionFailed(err.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Http(response) if response.status().as_u16() == 401 => {
                SyncError::TokenRejected("push channel handshake returned 401".into())
            }
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried.
    ///
    /// ## Retryable Errors
    /// - Connection failures and timeouts
    /// - 5xx and 429 responses
    /// - Push channel disconnects
    /// - Missing session (the user may log in later)
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::ConnectionFailed(_)
            | SyncError::Disconnected
            | SyncError::Timeout(_)
            | SyncError::WebSocketError(_)
            | SyncError::AuthRequired => true,
            SyncError::Http { status, .. } => *status >= 500 || *status == 429,
            SyncError::Query(info) => info.retryable,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::ConfigurationMissing(_)
                | SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
        )
    }

    /// Maps this error onto the category recorded on cache entries.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::ConfigurationMissing(_)
            | SyncError::InvalidConfig(_)
            | SyncError::InvalidUrl(_)
            | SyncError::ConfigLoadFailed(_) => ErrorKind::ConfigurationMissing,
            SyncError::AuthRequired | SyncError::TokenRejected(_) => ErrorKind::AuthRequired,
            SyncError::Http { status: 401, .. } => ErrorKind::AuthRequired,
            SyncError::Http { .. }
            | SyncError::ConnectionFailed(_)
            | SyncError::Disconnected
            | SyncError::Timeout(_)
            | SyncError::NotFound { .. }
            | SyncError::ChannelError(_)
            | SyncError::ShuttingDown => ErrorKind::Transport,
            SyncError::WebSocketError(_) | SyncError::InvalidMessage(_) => ErrorKind::Protocol,
            SyncError::SerializationFailed(_) | SyncError::DeserializationFailed(_) => {
                ErrorKind::Decode
            }
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Query(info) => info.kind,
        }
    }

    /// Cloneable snapshot for a cache entry.
    pub fn info(&self) -> ErrorInfo {
        match self {
            SyncError::Query(info) => info.clone(),
            other => ErrorInfo::new(other.kind(), other.to_string(), other.is_retryable()),
        }
    }
}
