//! # Error Types
//!
//! Domain-specific error types for orbit-core, plus the cloneable error
//! record the query cache keeps on an entry.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  orbit-core errors (this file)                                         │
//! │  ├── CoreError        - Domain errors (bad period, bad key)            │
//! │  ├── ValidationError  - Input validation failures                      │
//! │  └── ErrorInfo        - Cloneable snapshot stored on cache entries     │
//! │                                                                         │
//! │  orbit-sync errors (separate crate)                                    │
//! │  └── SyncError        - Transport, auth, config, protocol failures     │
//! │                                                                         │
//! │  Flow: SyncError ──kind()──► ErrorKind ──► ErrorInfo on CacheEntry     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Period string is not one of `7d`, `30d`, `90d`, `12m`.
    ///
    /// ## When This Occurs
    /// - A KPI/analytics hook is mounted with a free-form period
    /// - A config file or CLI flag carries a typo such as `31d`
    #[error("Unknown period '{0}', expected one of 7d, 30d, 90d, 12m")]
    UnknownPeriod(String),

    /// IP rule kind is not `allow` or `deny`.
    #[error("Unknown IP rule kind '{0}'")]
    UnknownRuleKind(String),

    /// Push event could not be interpreted.
    #[error("Malformed push event: {0}")]
    MalformedEvent(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised before a request leaves the client so the remote API never sees
/// obviously bad input.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Invalid format (e.g., invalid IP address, invalid CIDR).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Cache Error Record
// =============================================================================

/// Category of a failure recorded on a cache entry.
///
/// The first five kinds are the ones the dashboard shows to operators; the
/// rest are finer splits of `Transport` for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network failure or non-success HTTP status.
    Transport,
    /// No session token to open the push channel or call the API.
    AuthRequired,
    /// A caller joined an in-flight fetch. Informational.
    ConcurrentFetchCollapsed,
    /// A background refresh failed and the previous value is still served.
    StaleDataServed,
    /// Required configuration was not supplied.
    ConfigurationMissing,
    /// Response body did not match the expected shape.
    Decode,
    /// Push channel protocol violation.
    Protocol,
    /// Client-side input validation failed.
    Validation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::AuthRequired => "auth_required",
            ErrorKind::ConcurrentFetchCollapsed => "concurrent_fetch_collapsed",
            ErrorKind::StaleDataServed => "stale_data_served",
            ErrorKind::ConfigurationMissing => "configuration_missing",
            ErrorKind::Decode => "decode",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Validation => "validation",
        };
        write!(f, "{}", name)
    }
}

/// Cloneable error snapshot kept on a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        ErrorInfo {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Re-labels a background failure that left the previous value in place.
    pub fn stale(mut self) -> Self {
        self.kind = ErrorKind::StaleDataServed;
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::UnknownPeriod("31d".to_string());
        assert_eq!(
            err.to_string(),
            "Unknown period '31d', expected one of 7d, 30d, 90d, 12m"
        );

        let err = ValidationError::OutOfRange {
            field: "limit".to_string(),
            min: 1,
            max: 100,
        };
        assert_eq!(err.to_string(), "limit must be between 1 and 100");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let err: CoreError = ValidationError::Required {
            field: "id".to_string(),
        }
        .into();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_stale_relabels_kind() {
        let info = ErrorInfo::new(ErrorKind::Transport, "connection reset", true).stale();
        assert_eq!(info.kind, ErrorKind::StaleDataServed);
        assert_eq!(info.message, "connection reset");
        assert_eq!(info.to_string(), "stale_data_served: connection reset");
    }
}
