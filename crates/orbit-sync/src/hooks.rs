//! # Hooks
//!
//! A hook mounts one [`QueryDef`] for as long as its handle lives: it
//! subscribes the cache entry (starting fallback polling) and holds the push
//! topics that keep the entry current. Dropping the handle is unmounting.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  hooks.use_dashboard_kpis(period)                                       │
//! │        │                                                                │
//! │        ├──► cache.subscribe(["dashboard","kpis",period], fetch, policy) │
//! │        │        └── fallback poll every 5 min, also while connected     │
//! │        └──► channel.subscribe("dashboard")   (refcounted)               │
//! │                                                                         │
//! │  drop(handle) ──► both released; entry kept for gc_time                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Hooks hold no caching logic of their own.

use std::marker::PhantomData;
use std::sync::Arc;

use orbit_core::{
    ActivityItem, CacheKey, DashboardAnalytics, DashboardKpis, DashboardStats, ErrorInfo, IpRule,
    IpRuleKind, Period, QueryStatus, RecentOrder, SalesChannel, SecurityConfig, SecurityEvent,
    SecuritySession, Topic,
};
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::cache::{CacheEntry, QueryCache, QuerySubscription};
use crate::channel::{PushChannel, TopicSubscription};
use crate::client::AdminApi;
use crate::error::{SyncError, SyncResult};
use crate::queries::{self, QueryDef};

/// Factory for mounted queries.
#[derive(Clone)]
pub struct Hooks {
    cache: QueryCache,
    api: Arc<dyn AdminApi>,
    channel: Option<PushChannel>,
}

impl Hooks {
    /// Without a channel, hooks rely on fallback polling alone.
    pub fn new(cache: QueryCache, api: Arc<dyn AdminApi>, channel: Option<PushChannel>) -> Self {
        Hooks {
            cache,
            api,
            channel,
        }
    }

    pub fn use_query<T: DeserializeOwned>(&self, def: QueryDef<T>) -> UseQuery<T> {
        let topics = match &self.channel {
            Some(channel) => def.topics.iter().map(|t| channel.subscribe(t.clone())).collect(),
            None => Vec::new(),
        };
        let subscription = self.cache.subscribe(&def.key, def.fetcher, def.policy);
        UseQuery {
            subscription,
            topics,
            _marker: PhantomData,
        }
    }

    pub fn use_dashboard_stats(&self) -> UseQuery<DashboardStats> {
        self.use_query(queries::dashboard_stats(&self.api))
    }

    pub fn use_recent_orders(&self, limit: u32) -> SyncResult<UseQuery<Vec<RecentOrder>>> {
        Ok(self.use_query(queries::recent_orders(&self.api, limit)?))
    }

    pub fn use_activity_feed(&self, limit: u32) -> SyncResult<UseQuery<Vec<ActivityItem>>> {
        Ok(self.use_query(queries::activity_feed(&self.api, limit)?))
    }

    pub fn use_dashboard_kpis(&self, period: Period) -> UseQuery<DashboardKpis> {
        self.use_query(queries::dashboard_kpis(&self.api, period))
    }

    pub fn use_analytics(&self, period: Period) -> UseQuery<DashboardAnalytics> {
        self.use_query(queries::analytics(&self.api, period))
    }

    pub fn use_sales_channels(&self) -> UseQuery<Vec<SalesChannel>> {
        self.use_query(queries::sales_channels(&self.api))
    }

    pub fn use_sales_channel(&self, id: &str) -> SyncResult<UseQuery<SalesChannel>> {
        orbit_core::validation::validate_entity_id(id)?;
        Ok(self.use_query(queries::sales_channel(&self.api, id)))
    }

    pub fn use_security_sessions(&self) -> UseQuery<Vec<SecuritySession>> {
        self.use_query(queries::security_sessions(&self.api))
    }

    pub fn use_ip_rules(&self, kind: Option<IpRuleKind>) -> UseQuery<Vec<IpRule>> {
        self.use_query(queries::ip_rules(&self.api, kind))
    }

    pub fn use_security_events(&self, limit: u32) -> SyncResult<UseQuery<Vec<SecurityEvent>>> {
        Ok(self.use_query(queries::security_events(&self.api, limit)?))
    }

    pub fn use_security_config(&self) -> UseQuery<SecurityConfig> {
        self.use_query(queries::security_config(&self.api))
    }
}

/// What a mounted query currently shows.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub status: QueryStatus,
    pub error: Option<ErrorInfo>,
    pub is_fetching: bool,
    pub is_stale: bool,
    pub fetched_at: Option<Instant>,
}

impl<T: DeserializeOwned> QueryState<T> {
    fn from_entry(entry: Option<CacheEntry>) -> Self {
        let Some(entry) = entry else {
            return QueryState {
                data: None,
                status: QueryStatus::Idle,
                error: None,
                is_fetching: false,
                is_stale: true,
                fetched_at: None,
            };
        };

        let is_stale = entry.is_stale();
        let (data, status, error) = match entry.data::<T>() {
            Ok(data) => (data, entry.status, entry.error),
            Err(e) => (None, QueryStatus::Error, Some(e.info())),
        };
        QueryState {
            data,
            status,
            error,
            is_fetching: entry.is_fetching,
            is_stale,
            fetched_at: entry.fetched_at,
        }
    }
}

/// A mounted query. Dropping it unmounts.
pub struct UseQuery<T> {
    subscription: QuerySubscription,
    topics: Vec<TopicSubscription>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> UseQuery<T> {
    pub fn key(&self) -> &CacheKey {
        self.subscription.key()
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.topics.iter().map(|t| t.topic().clone()).collect()
    }

    pub fn state(&self) -> QueryState<T> {
        QueryState::from_entry(self.subscription.entry())
    }

    pub fn data(&self) -> Option<T> {
        self.state().data
    }

    /// Waits for the next change and returns the new state.
    pub async fn changed(&mut self) -> SyncResult<QueryState<T>> {
        self.subscription.changed().await?;
        Ok(self.state())
    }

    /// Waits for the entry to settle and returns its data.
    pub async fn resolve(&mut self) -> SyncResult<T> {
        let entry = self.subscription.settled().await?;
        entry.data::<T>()?.ok_or_else(|| SyncError::NotFound {
            resource: "cache entry".into(),
            id: self.key().to_string(),
        })
    }

    pub fn refetch(&self) -> bool {
        self.subscription.refetch()
    }
}
