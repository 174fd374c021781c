//! Dashboard store: the selected reporting period plus the dashboard reads.

use std::sync::Arc;

use orbit_core::{
    ActivityItem, DashboardAnalytics, DashboardKpis, DashboardStats, Period, RecentOrder,
};
use tokio::sync::watch;
use tracing::info;

use crate::cache::QueryCache;
use crate::client::AdminApi;
use crate::error::SyncResult;
use crate::keys;
use crate::queries;
use crate::stores::resolve_def;

#[derive(Clone)]
pub struct DashboardStore {
    cache: QueryCache,
    api: Arc<dyn AdminApi>,
    period: Arc<watch::Sender<Period>>,
}

impl DashboardStore {
    pub fn new(cache: QueryCache, api: Arc<dyn AdminApi>) -> Self {
        let (period, _) = watch::channel(Period::default());
        DashboardStore {
            cache,
            api,
            period: Arc::new(period),
        }
    }

    pub fn period(&self) -> Period {
        *self.period.borrow()
    }

    pub fn set_period(&self, period: Period) {
        self.period.send_if_modified(|current| {
            let changed = *current != period;
            *current = period;
            changed
        });
    }

    /// Parses and selects a period. Unknown strings are rejected and the
    /// current selection is kept.
    pub fn set_period_str(&self, period: &str) -> SyncResult<()> {
        let period: Period = period.parse()?;
        self.set_period(period);
        Ok(())
    }

    pub fn watch_period(&self) -> watch::Receiver<Period> {
        self.period.subscribe()
    }

    pub async fn stats(&self) -> SyncResult<DashboardStats> {
        resolve_def(&self.cache, queries::dashboard_stats(&self.api)).await
    }

    pub async fn recent_orders(&self, limit: u32) -> SyncResult<Vec<RecentOrder>> {
        resolve_def(&self.cache, queries::recent_orders(&self.api, limit)?).await
    }

    pub async fn activity(&self, limit: u32) -> SyncResult<Vec<ActivityItem>> {
        resolve_def(&self.cache, queries::activity_feed(&self.api, limit)?).await
    }

    /// KPIs for the selected period.
    pub async fn kpis(&self) -> SyncResult<DashboardKpis> {
        resolve_def(&self.cache, queries::dashboard_kpis(&self.api, self.period())).await
    }

    /// Analytics for the selected period.
    pub async fn analytics(&self) -> SyncResult<DashboardAnalytics> {
        resolve_def(&self.cache, queries::analytics(&self.api, self.period())).await
    }

    /// Marks every dashboard entry stale. Returns the number of entries hit.
    pub fn refresh(&self) -> usize {
        let hit = self.cache.invalidate(&keys::dashboard());
        info!(entries = hit, "Dashboard refreshed");
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;
    use std::time::Duration;

    fn setup() -> (Arc<FakeApi>, DashboardStore) {
        let api = Arc::new(FakeApi::new());
        let store = DashboardStore::new(QueryCache::new(Duration::from_secs(600)), api.clone());
        (api, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_kpis_follow_selected_period() {
        let (api, store) = setup();
        assert_eq!(store.kpis().await.unwrap().period, Period::Days30);

        store.set_period_str("90d").unwrap();
        assert_eq!(store.kpis().await.unwrap().period, Period::Days90);
        assert_eq!(api.calls("dashboard_kpis"), 2);

        assert!(store.set_period_str("31d").is_err());
        assert_eq!(store.period(), Period::Days90);
    }

    #[tokio::test(start_paused = true)]
    async fn test_period_changes_are_watchable() {
        let (_api, store) = setup();
        let mut rx = store.watch_period();
        store.set_period(Period::Days30);
        assert!(!rx.has_changed().unwrap());
        store.set_period(Period::Months12);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Period::Months12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_marks_dashboard_stale() {
        let (api, store) = setup();
        assert_eq!(store.stats().await.unwrap().total_orders, 101);
        store.stats().await.unwrap();
        assert_eq!(api.calls("dashboard_stats"), 1);

        store.recent_orders(5).await.unwrap();
        assert_eq!(store.refresh(), 2);
        assert_eq!(store.stats().await.unwrap().total_orders, 102);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_is_validated_before_fetching() {
        let (api, store) = setup();
        assert!(store.activity(0).await.is_err());
        assert_eq!(api.calls("dashboard_activity"), 0);
        assert_eq!(store.activity(10).await.unwrap().len(), 2);
    }
}
