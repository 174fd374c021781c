//! # Cache Key Shapes
//!
//! Every key the hooks and stores read, in one place, so the reconciler
//! and the invalidation calls agree on them.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  ["dashboard", "stats"]                                              │
//! │  ["dashboard", "recent-orders", <limit>]                             │
//! │  ["dashboard", "activity", <limit>]                                  │
//! │  ["dashboard", "kpis", <period>]                                     │
//! │  ["dashboard", "analytics", <period>]                                │
//! │  ["sales-channels", "list"]                                          │
//! │  ["security", "sessions" | "ip-rules" | "events" | "config", ...]    │
//! │  [<resource>, "list", <page>, <size>, <search>, <status>, <sort>]    │
//! │  [<resource>, "detail", <id>]                                        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use orbit_core::{cache_key, CacheKey, IpRuleKind, Period, Topic, DEFAULT_PAGE_SIZE};

use crate::error::SyncResult;

// =============================================================================
// Resources
// =============================================================================

/// The CRUD resources managed by [`ResourceStore`](crate::stores::ResourceStore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Orders,
    Products,
    Inventory,
    Customers,
    Returns,
    Workflows,
    SalesChannels,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Orders,
        ResourceKind::Products,
        ResourceKind::Inventory,
        ResourceKind::Customers,
        ResourceKind::Returns,
        ResourceKind::Workflows,
        ResourceKind::SalesChannels,
    ];

    /// API path segment, also the first cache key part.
    pub fn path(&self) -> &'static str {
        match self {
            ResourceKind::Orders => "orders",
            ResourceKind::Products => "products",
            ResourceKind::Inventory => "inventory",
            ResourceKind::Customers => "customers",
            ResourceKind::Returns => "returns",
            ResourceKind::Workflows => "workflows",
            ResourceKind::SalesChannels => "sales-channels",
        }
    }

    /// Push topic carrying changes to this resource.
    pub fn topic(&self) -> Topic {
        Topic::new(self.path())
    }

    /// Client-side list order used when a pushed item is inserted.
    pub fn sort_order(&self) -> SortOrder {
        match self {
            ResourceKind::Orders | ResourceKind::Customers | ResourceKind::Returns => {
                SortOrder::desc("createdAt")
            }
            ResourceKind::Inventory => SortOrder::desc("updatedAt"),
            ResourceKind::Products | ResourceKind::Workflows | ResourceKind::SalesChannels => {
                SortOrder::asc("name")
            }
        }
    }

    /// Prefix of every list entry of this resource.
    pub fn list_prefix(&self) -> CacheKey {
        cache_key![self.path(), "list"]
    }

    /// Prefix of every entity entry of this resource.
    pub fn detail_prefix(&self) -> CacheKey {
        cache_key![self.path(), "detail"]
    }

    pub fn list_key(&self, query: &ListQuery) -> CacheKey {
        self.list_prefix()
            .with(query.page)
            .with(query.page_size)
            .with(query.search.clone().unwrap_or_default())
            .with(query.status.clone().unwrap_or_default())
            .with(query.sort.clone().unwrap_or_default())
    }

    pub fn detail_key(&self, id: &str) -> CacheKey {
        self.detail_prefix().with(id)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Ordering of a cached list by one JSON field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOrder {
    pub field: String,
    pub descending: bool,
}

impl SortOrder {
    pub fn asc(field: &str) -> Self {
        SortOrder {
            field: field.to_string(),
            descending: false,
        }
    }

    pub fn desc(field: &str) -> Self {
        SortOrder {
            field: field.to_string(),
            descending: true,
        }
    }
}

// =============================================================================
// List Query
// =============================================================================

/// Server-side list parameters. Part of the list cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub page: u32,
    pub page_size: u32,
    pub search: Option<String>,
    pub status: Option<String>,
    pub sort: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        ListQuery {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            search: None,
            status: None,
            sort: None,
        }
    }
}

impl ListQuery {
    pub fn validate(&self) -> SyncResult<()> {
        orbit_core::validation::validate_pagination(self.page, self.page_size)?;
        Ok(())
    }

    /// Query string pairs in a stable order.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("page", self.page.to_string()),
            ("pageSize", self.page_size.to_string()),
        ];
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            pairs.push(("search", search.to_string()));
        }
        if let Some(status) = &self.status {
            pairs.push(("status", status.clone()));
        }
        if let Some(sort) = &self.sort {
            pairs.push(("sort", sort.clone()));
        }
        pairs
    }
}

// =============================================================================
// Dashboard Keys
// =============================================================================

pub fn dashboard() -> CacheKey {
    cache_key!["dashboard"]
}

pub fn dashboard_stats() -> CacheKey {
    cache_key!["dashboard", "stats"]
}

pub fn recent_orders_prefix() -> CacheKey {
    cache_key!["dashboard", "recent-orders"]
}

pub fn recent_orders(limit: u32) -> CacheKey {
    recent_orders_prefix().with(limit)
}

pub fn activity_prefix() -> CacheKey {
    cache_key!["dashboard", "activity"]
}

pub fn activity(limit: u32) -> CacheKey {
    activity_prefix().with(limit)
}

pub fn kpis_prefix() -> CacheKey {
    cache_key!["dashboard", "kpis"]
}

pub fn kpis(period: Period) -> CacheKey {
    kpis_prefix().with(period)
}

pub fn analytics(period: Period) -> CacheKey {
    cache_key!["dashboard", "analytics", period]
}

// =============================================================================
// Sales Channel Keys
// =============================================================================

/// The unpaginated channel list read by the sales-channel hooks.
pub fn sales_channels() -> CacheKey {
    ResourceKind::SalesChannels.list_prefix()
}

pub fn sales_channel(id: &str) -> CacheKey {
    ResourceKind::SalesChannels.detail_key(id)
}

// =============================================================================
// Security Keys
// =============================================================================

pub fn security() -> CacheKey {
    cache_key!["security"]
}

pub fn security_sessions() -> CacheKey {
    cache_key!["security", "sessions"]
}

pub fn ip_rules(kind: Option<IpRuleKind>) -> CacheKey {
    cache_key!["security", "ip-rules", kind.map(|k| k.as_str()).unwrap_or("all")]
}

pub fn ip_rules_prefix() -> CacheKey {
    cache_key!["security", "ip-rules"]
}

pub fn security_events(limit: u32) -> CacheKey {
    cache_key!["security", "events", limit]
}

pub fn security_config() -> CacheKey {
    cache_key!["security", "config"]
}
