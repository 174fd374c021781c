//! # Validation Module
//!
//! Input checks applied before a request leaves the client.
//!
//! ```rust
//! use orbit_core::validation::{validate_limit, validate_cidr};
//!
//! assert!(validate_limit(10).is_ok());
//! assert!(validate_cidr("10.0.0.0/8").is_ok());
//! ```

use std::net::IpAddr;

use crate::error::ValidationError;
use crate::{MAX_LIST_LIMIT, MAX_PAGE_SIZE};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a `limit` query parameter (recent orders, activity, events).
pub fn validate_limit(limit: u32) -> ValidationResult<()> {
    if limit == 0 || limit > MAX_LIST_LIMIT {
        return Err(ValidationError::OutOfRange {
            field: "limit".to_string(),
            min: 1,
            max: i64::from(MAX_LIST_LIMIT),
        });
    }
    Ok(())
}

/// Validates page number (1-based) and page size.
pub fn validate_pagination(page: u32, page_size: u32) -> ValidationResult<()> {
    if page == 0 {
        return Err(ValidationError::OutOfRange {
            field: "page".to_string(),
            min: 1,
            max: i64::from(u32::MAX),
        });
    }
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(ValidationError::OutOfRange {
            field: "pageSize".to_string(),
            min: 1,
            max: i64::from(MAX_PAGE_SIZE),
        });
    }
    Ok(())
}

// =============================================================================
// String Validators
// =============================================================================

/// Validates an entity id used in a URL path segment.
///
/// ## Rules
/// - Must not be empty
/// - At most 128 characters
/// - Letters, digits, `-` and `_` only (no path traversal)
pub fn validate_entity_id(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "id".to_string(),
        });
    }
    if id.len() > 128 {
        return Err(ValidationError::TooLong {
            field: "id".to_string(),
            max: 128,
        });
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ValidationError::InvalidFormat {
            field: "id".to_string(),
            reason: "must contain only letters, numbers, hyphens, and underscores".to_string(),
        });
    }
    Ok(())
}

/// Validates an IP address or CIDR block for an allow/deny rule.
pub fn validate_cidr(value: &str) -> ValidationResult<()> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: "cidr".to_string(),
        });
    }

    let (addr, prefix) = match value.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (value, None),
    };

    let ip: IpAddr = addr.parse().map_err(|_| ValidationError::InvalidFormat {
        field: "cidr".to_string(),
        reason: format!("'{}' is not an IP address", addr),
    })?;

    if let Some(prefix) = prefix {
        let max = if ip.is_ipv4() { 32 } else { 128 };
        let bits: u8 = prefix.parse().map_err(|_| ValidationError::InvalidFormat {
            field: "cidr".to_string(),
            reason: format!("'{}' is not a prefix length", prefix),
        })?;
        if bits > max {
            return Err(ValidationError::OutOfRange {
                field: "cidr".to_string(),
                min: 0,
                max: i64::from(max),
            });
        }
    }

    Ok(())
}
