//! # Query Definitions
//!
//! One [`QueryDef`] per remote read: the cache key, the fetcher, the
//! staleness/polling policy and the push topics that keep it current.
//! Hooks mount these; stores resolve them directly.
//!
//! ```text
//! ┌──────────────────────────┬─────────┬───────────┬───────────────────────┐
//! │ query                    │ stale   │ poll      │ topics                │
//! ├──────────────────────────┼─────────┼───────────┼───────────────────────┤
//! │ dashboard stats          │ 30s     │ 60s       │ dashboard, orders     │
//! │ recent orders (limit)    │ 30s     │ 60s       │ orders                │
//! │ activity feed (limit)    │ 60s     │ 2min      │ activity              │
//! │ kpis (period)            │ 60s     │ 5min      │ dashboard             │
//! │ analytics (period)       │ 5min    │ -         │ dashboard             │
//! │ sales channels           │ 60s     │ -         │ sales-channels        │
//! │ sales channel (id)       │ 60s     │ -         │ sales-channels        │
//! │ security sessions        │ 30s     │ 60s       │ security              │
//! │ ip rules (kind)          │ 60s     │ -         │ security              │
//! │ security events (limit)  │ 30s     │ 60s       │ security              │
//! │ security config          │ 5min    │ -         │ security              │
//! └──────────────────────────┴─────────┴───────────┴───────────────────────┘
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use orbit_core::validation::validate_limit;
use orbit_core::{
    ActivityItem, CacheKey, DashboardAnalytics, DashboardKpis, DashboardStats, IpRule, IpRuleKind,
    Period, PollingPolicy, RecentOrder, SalesChannel, SecurityConfig, SecurityEvent,
    SecuritySession, Topic,
};
use serde::Serialize;

use crate::cache::{fetcher, Fetcher};
use crate::client::AdminApi;
use crate::error::SyncResult;
use crate::keys;

const SECS_30: Duration = Duration::from_secs(30);
const SECS_60: Duration = Duration::from_secs(60);
const MINS_2: Duration = Duration::from_secs(120);
const MINS_5: Duration = Duration::from_secs(300);

/// A typed remote read bound to its cache key.
pub struct QueryDef<T> {
    pub key: CacheKey,
    pub fetcher: Fetcher,
    pub policy: PollingPolicy,
    pub topics: Vec<Topic>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> QueryDef<T> {
    pub fn new(key: CacheKey, fetcher: Fetcher, policy: PollingPolicy) -> Self {
        QueryDef {
            key,
            fetcher,
            policy,
            topics: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn topics(mut self, topics: &[&str]) -> Self {
        self.topics = topics.iter().map(|t| Topic::new(*t)).collect();
        self
    }
}

impl<T> Clone for QueryDef<T> {
    fn clone(&self) -> Self {
        QueryDef {
            key: self.key.clone(),
            fetcher: self.fetcher.clone(),
            policy: self.policy,
            topics: self.topics.clone(),
            _marker: PhantomData,
        }
    }
}

/// Wraps a typed API call as a cache fetcher.
fn typed<T, F, Fut>(api: &Arc<dyn AdminApi>, call: F) -> Fetcher
where
    T: Serialize,
    F: Fn(Arc<dyn AdminApi>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<T>> + Send + 'static,
{
    let api = api.clone();
    fetcher(move || {
        let fut = call(api.clone());
        async move { Ok(serde_json::to_value(fut.await?)?) }
    })
}

// =============================================================================
// Dashboard
// =============================================================================

pub fn dashboard_stats(api: &Arc<dyn AdminApi>) -> QueryDef<DashboardStats> {
    QueryDef::new(
        keys::dashboard_stats(),
        typed(api, |api| async move { api.dashboard_stats().await }),
        PollingPolicy::stale_for(SECS_30).polling(SECS_60),
    )
    .topics(&[Topic::DASHBOARD, Topic::ORDERS])
}

pub fn recent_orders(api: &Arc<dyn AdminApi>, limit: u32) -> SyncResult<QueryDef<Vec<RecentOrder>>> {
    validate_limit(limit)?;
    Ok(QueryDef::new(
        keys::recent_orders(limit),
        typed(api, move |api| async move { api.dashboard_recent_orders(limit).await }),
        PollingPolicy::stale_for(SECS_30).polling(SECS_60),
    )
    .topics(&[Topic::ORDERS]))
}

pub fn activity_feed(api: &Arc<dyn AdminApi>, limit: u32) -> SyncResult<QueryDef<Vec<ActivityItem>>> {
    validate_limit(limit)?;
    Ok(QueryDef::new(
        keys::activity(limit),
        typed(api, move |api| async move { api.dashboard_activity(limit).await }),
        PollingPolicy::stale_for(SECS_60).polling(MINS_2),
    )
    .topics(&[Topic::ACTIVITY]))
}

pub fn dashboard_kpis(api: &Arc<dyn AdminApi>, period: Period) -> QueryDef<DashboardKpis> {
    QueryDef::new(
        keys::kpis(period),
        typed(api, move |api| async move { api.dashboard_kpis(period).await }),
        PollingPolicy::stale_for(SECS_60).polling(MINS_5),
    )
    .topics(&[Topic::DASHBOARD])
}

pub fn analytics(api: &Arc<dyn AdminApi>, period: Period) -> QueryDef<DashboardAnalytics> {
    QueryDef::new(
        keys::analytics(period),
        typed(api, move |api| async move { api.dashboard_analytics(period).await }),
        PollingPolicy::stale_for(MINS_5),
    )
    .topics(&[Topic::DASHBOARD])
}

// =============================================================================
// Sales Channels
// =============================================================================

pub fn sales_channels(api: &Arc<dyn AdminApi>) -> QueryDef<Vec<SalesChannel>> {
    QueryDef::new(
        keys::sales_channels(),
        typed(api, |api| async move { api.sales_channels().await }),
        PollingPolicy::stale_for(SECS_60),
    )
    .topics(&[Topic::SALES_CHANNELS])
}

pub fn sales_channel(api: &Arc<dyn AdminApi>, id: &str) -> QueryDef<SalesChannel> {
    let owned = id.to_string();
    QueryDef::new(
        keys::sales_channel(id),
        typed(api, move |api| {
            let id = owned.clone();
            async move { api.sales_channel(&id).await }
        }),
        PollingPolicy::stale_for(SECS_60),
    )
    .topics(&[Topic::SALES_CHANNELS])
}

// =============================================================================
// Security
// =============================================================================

pub fn security_sessions(api: &Arc<dyn AdminApi>) -> QueryDef<Vec<SecuritySession>> {
    QueryDef::new(
        keys::security_sessions(),
        typed(api, |api| async move { api.security_sessions().await }),
        PollingPolicy::stale_for(SECS_30).polling(SECS_60),
    )
    .topics(&[Topic::SECURITY])
}

pub fn ip_rules(api: &Arc<dyn AdminApi>, kind: Option<IpRuleKind>) -> QueryDef<Vec<IpRule>> {
    QueryDef::new(
        keys::ip_rules(kind),
        typed(api, move |api| async move { api.ip_rules(kind).await }),
        PollingPolicy::stale_for(SECS_60),
    )
    .topics(&[Topic::SECURITY])
}

pub fn security_events(api: &Arc<dyn AdminApi>, limit: u32) -> SyncResult<QueryDef<Vec<SecurityEvent>>> {
    validate_limit(limit)?;
    Ok(QueryDef::new(
        keys::security_events(limit),
        typed(api, move |api| async move { api.security_events(limit).await }),
        PollingPolicy::stale_for(SECS_30).polling(SECS_60),
    )
    .topics(&[Topic::SECURITY]))
}

pub fn security_config(api: &Arc<dyn AdminApi>) -> QueryDef<SecurityConfig> {
    QueryDef::new(
        keys::security_config(),
        typed(api, |api| async move { api.security_config().await }),
        PollingPolicy::stale_for(MINS_5),
    )
    .topics(&[Topic::SECURITY])
}
