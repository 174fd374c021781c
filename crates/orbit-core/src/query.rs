//! # Query Vocabulary
//!
//! Cache keys, polling policies and entry status shared by the query cache
//! and the hooks that declare queries.
//!
//! ## Key Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CacheKey Layout                                │
//! │                                                                         │
//! │   [ domain , entity , param , param ... ]                              │
//! │                                                                         │
//! │   ["dashboard", "kpis", "30d"]        KPI card for the 30 day period   │
//! │   ["dashboard", "kpis", "7d"]         a DIFFERENT entry                │
//! │   ["orders", "list", 1, 25]           first page of orders             │
//! │   ["orders", "detail", "ord-42"]      a single order                   │
//! │                                                                         │
//! │   Prefix ["dashboard"] matches every dashboard entry on invalidate.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// =============================================================================
// Key Parts
// =============================================================================

/// One primitive element of a [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(untagged)]
pub enum KeyPart {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Str(s) => write!(f, "{}", s),
            KeyPart::Int(i) => write!(f, "{}", i),
            KeyPart::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Str(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Str(value)
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        KeyPart::Str(value.clone())
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        KeyPart::Int(value)
    }
}

impl From<u32> for KeyPart {
    fn from(value: u32) -> Self {
        KeyPart::Int(i64::from(value))
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        KeyPart::Bool(value)
    }
}

// =============================================================================
// Cache Key
// =============================================================================

/// Ordered identifier for one cached result.
///
/// Two keys are equal iff their parts are element-wise equal, so
/// `["dashboard","kpis","30d"]` and `["dashboard","kpis","7d"]` never share
/// an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(transparent)]
pub struct CacheKey(Vec<KeyPart>);

impl CacheKey {
    /// Builds a key from any sequence of parts.
    pub fn new<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<KeyPart>,
    {
        CacheKey(parts.into_iter().map(Into::into).collect())
    }

    /// Returns a new key with one more part appended.
    pub fn with(&self, part: impl Into<KeyPart>) -> Self {
        let mut parts = self.0.clone();
        parts.push(part.into());
        CacheKey(parts)
    }

    /// Returns true if `prefix` is an element-wise prefix of this key.
    ///
    /// Every key starts with itself and with the empty key.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Returns the key parts.
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// Returns the number of parts.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for the empty key (matches everything as a prefix).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, "]")
    }
}

/// Builds a [`CacheKey`] from heterogeneous parts.
///
/// ```rust
/// use orbit_core::cache_key;
///
/// let key = cache_key!["orders", "list", 1u32, 25u32];
/// assert_eq!(key.len(), 4);
/// ```
#[macro_export]
macro_rules! cache_key {
    ($($part:expr),* $(,)?) => {
        $crate::query::CacheKey::from_parts(vec![$($crate::query::KeyPart::from($part)),*])
    };
}

impl CacheKey {
    /// Builds a key from already converted parts (used by [`cache_key!`]).
    pub fn from_parts(parts: Vec<KeyPart>) -> Self {
        CacheKey(parts)
    }
}

// =============================================================================
// Polling Policy
// =============================================================================

/// Staleness and polling declaration attached to a hook.
///
/// Several hooks can share one entry; the strictest enabled policy wins
/// (see [`PollingPolicy::strictest`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingPolicy {
    /// How long a value is served without revalidation.
    pub stale_time: Duration,

    /// Background refetch cadence while the entry has subscribers.
    pub refetch_interval: Option<Duration>,

    /// Disabled policies never trigger fetches.
    pub enabled: bool,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        PollingPolicy {
            stale_time: Duration::ZERO,
            refetch_interval: None,
            enabled: true,
        }
    }
}

impl PollingPolicy {
    /// A policy that considers data fresh for `stale_time`.
    pub fn stale_for(stale_time: Duration) -> Self {
        PollingPolicy {
            stale_time,
            ..Default::default()
        }
    }

    /// Adds a background refetch interval.
    pub fn polling(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    /// Returns a disabled copy of this policy.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Combines the policies of every active subscriber of one entry.
    ///
    /// Minimum stale time and minimum interval among enabled policies.
    /// Returns `None` when no policy is enabled.
    pub fn strictest<'a, I>(policies: I) -> Option<PollingPolicy>
    where
        I: IntoIterator<Item = &'a PollingPolicy>,
    {
        policies
            .into_iter()
            .filter(|p| p.enabled)
            .fold(None, |acc: Option<PollingPolicy>, p| {
                Some(match acc {
                    None => *p,
                    Some(a) => PollingPolicy {
                        stale_time: a.stale_time.min(p.stale_time),
                        refetch_interval: match (a.refetch_interval, p.refetch_interval) {
                            (Some(x), Some(y)) => Some(x.min(y)),
                            (x, y) => x.or(y),
                        },
                        enabled: true,
                    },
                })
            })
    }
}

// =============================================================================
// Query Status
// =============================================================================

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Never fetched, or the value was removed.
    #[default]
    Idle,
    /// First fetch in flight, no value yet.
    Loading,
    /// A value is present.
    Success,
    /// The last fetch failed and there is no value to fall back on.
    Error,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Idle => write!(f, "idle"),
            QueryStatus::Loading => write!(f, "loading"),
            QueryStatus::Success => write!(f, "success"),
            QueryStatus::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_equality_is_ordered() {
        let a = cache_key!["dashboard", "kpis", "30d"];
        let b = cache_key!["dashboard", "kpis", "7d"];
        let c = CacheKey::new(["dashboard", "kpis", "30d"]);
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_ne!(cache_key!["a", "b"], cache_key!["b", "a"]);
    }

    #[test]
    fn test_prefix_matching() {
        let key = cache_key!["orders", "list", 1u32, 25u32];
        assert!(key.starts_with(&cache_key!["orders"]));
        assert!(key.starts_with(&cache_key!["orders", "list"]));
        assert!(key.starts_with(&CacheKey::from_parts(Vec::new())));
        assert!(!key.starts_with(&cache_key!["orders", "detail"]));
        assert!(!cache_key!["orders"].starts_with(&key));
    }

    #[test]
    fn test_int_and_string_parts_differ() {
        assert_ne!(cache_key!["page", 1i64], cache_key!["page", "1"]);
    }

    #[test]
    fn test_key_display_and_json() {
        let key = cache_key!["orders", "detail", "ord-1"].with(true);
        assert_eq!(key.to_string(), "[orders,detail,ord-1,true]");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"["orders","detail","ord-1",true]"#);
        let parsed: CacheKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_strictest_policy() {
        let a = PollingPolicy::stale_for(Duration::from_secs(30)).polling(Duration::from_secs(120));
        let b = PollingPolicy::stale_for(Duration::from_secs(10));
        let c = PollingPolicy::stale_for(Duration::from_secs(1))
            .polling(Duration::from_secs(5))
            .disabled();

        let merged = PollingPolicy::strictest([&a, &b, &c]).unwrap();
        assert_eq!(merged.stale_time, Duration::from_secs(10));
        assert_eq!(merged.refetch_interval, Some(Duration::from_secs(120)));

        assert!(PollingPolicy::strictest([&c]).is_none());
    }
}
