//! # Domain Types
//!
//! Response shapes of the remote admin API that the dashboard hooks read.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  Dashboard                 Sales Channels        Security               │
//! │  ─────────────────         ───────────────       ─────────────────      │
//! │  DashboardStats            SalesChannel          SecuritySession        │
//! │  RecentOrder               ChannelStatus         IpRule / IpRuleKind    │
//! │  ActivityItem                                    SecurityEvent          │
//! │  DashboardKpis                                   SecurityConfig         │
//! │  DashboardAnalytics                                                     │
//! │                                                                         │
//! │  Page<T>: generic paginated envelope for store list endpoints          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All money is integer minor units (cents). Wire field names are camelCase.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::CoreError;
use crate::period::Period;

// =============================================================================
// Dashboard
// =============================================================================

/// Headline counters on the dashboard landing page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_orders: i64,
    pub pending_orders: i64,
    pub total_customers: i64,
    pub total_products: i64,
    pub low_stock_products: i64,
    /// Revenue in cents for the current day.
    pub revenue_today_cents: i64,
}

/// One row of the "recent orders" widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct RecentOrder {
    pub id: String,
    pub order_number: String,
    pub customer_name: Option<String>,
    pub status: String,
    pub total_cents: i64,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

/// One entry of the activity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct ActivityItem {
    pub id: String,
    /// e.g. `order.created`, `product.updated`.
    pub action: String,
    pub actor: Option<String>,
    pub description: String,
    #[ts(as = "String")]
    pub occurred_at: DateTime<Utc>,
}

/// KPI card values for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct DashboardKpis {
    pub period: Period,
    pub revenue: i64,
    pub orders: i64,
    pub average_order_value: i64,
    pub new_customers: i64,
    /// Percent change against the previous period, in basis points.
    pub revenue_change_bps: i64,
}

/// One point of an analytics series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPoint {
    pub label: String,
    pub value: i64,
}

/// Chart data for the analytics page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct DashboardAnalytics {
    pub period: Period,
    pub revenue_series: Vec<SeriesPoint>,
    pub orders_series: Vec<SeriesPoint>,
    #[serde(default)]
    pub top_products: Vec<SeriesPoint>,
}

// =============================================================================
// Sales Channels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Active,
    Paused,
    Error,
}

/// An external storefront or marketplace the catalog is published to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SalesChannel {
    pub id: String,
    pub name: String,
    /// e.g. `shopify`, `amazon`, `pos`.
    pub channel_type: String,
    pub status: ChannelStatus,
    #[ts(as = "Option<String>")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Security
// =============================================================================

/// An authenticated admin session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySession {
    pub id: String,
    pub user_id: String,
    pub ip_address: String,
    pub user_agent: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub current: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum IpRuleKind {
    Allow,
    Deny,
}

impl IpRuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpRuleKind::Allow => "allow",
            IpRuleKind::Deny => "deny",
        }
    }
}

impl fmt::Display for IpRuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpRuleKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(IpRuleKind::Allow),
            "deny" => Ok(IpRuleKind::Deny),
            other => Err(CoreError::UnknownRuleKind(other.to_string())),
        }
    }
}

/// An IP allow/deny list entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct IpRule {
    pub id: String,
    pub kind: IpRuleKind,
    /// Single address or CIDR block.
    pub cidr: String,
    pub note: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

/// Input for creating an IP rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct NewIpRule {
    pub kind: IpRuleKind,
    pub cidr: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Audit log entry from the security dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub id: String,
    /// e.g. `login.failed`, `ip.blocked`.
    pub event_type: String,
    pub severity: Severity,
    pub ip_address: Option<String>,
    pub user_id: Option<String>,
    pub message: String,
    #[ts(as = "String")]
    pub occurred_at: DateTime<Utc>,
}

/// Tenant-wide security settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    pub require_two_factor: bool,
    pub session_timeout_minutes: u32,
    pub max_failed_logins: u32,
    pub ip_allowlist_enabled: bool,
}

// =============================================================================
// Pagination
// =============================================================================

/// Paginated list envelope returned by store list endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    /// Number of pages at the current page size.
    pub fn page_count(&self) -> u32 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.page_size)) as u32
    }

    pub fn has_next(&self) -> bool {
        self.page < self.page_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kpis_from_wire() {
        let raw = r#"{"period":"30d","revenue":123456,"orders":42,"averageOrderValue":2939,"newCustomers":7,"revenueChangeBps":-150}"#;
        let kpis: DashboardKpis = serde_json::from_str(raw).unwrap();
        assert_eq!(kpis.period, Period::Days30);
        assert_eq!(kpis.revenue, 123456);
        assert_eq!(kpis.revenue_change_bps, -150);
    }

    #[test]
    fn test_ip_rule_kind_parse() {
        assert_eq!("deny".parse::<IpRuleKind>().unwrap(), IpRuleKind::Deny);
        assert!("block".parse::<IpRuleKind>().is_err());
        assert_eq!(serde_json::to_string(&IpRuleKind::Allow).unwrap(), "\"allow\"");
    }

    #[test]
    fn test_page_count() {
        let page: Page<u8> = Page {
            data: vec![],
            total: 51,
            page: 2,
            page_size: 25,
        };
        assert_eq!(page.page_count(), 3);
        assert!(page.has_next());

        let empty: Page<u8> = Page {
            data: vec![],
            total: 0,
            page: 1,
            page_size: 0,
        };
        assert_eq!(empty.page_count(), 0);
        assert!(!empty.has_next());
    }
}
