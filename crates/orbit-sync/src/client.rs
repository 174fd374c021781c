//! # Remote Access Client
//!
//! Typed access to the remote admin API. Every request is relative to the
//! configured `api_base_url` and carries the session bearer when one is set.
//!
//! ## Endpoints
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  GET    dashboard/stats                                                 │
//! │  GET    dashboard/recent-orders?limit=N                                 │
//! │  GET    dashboard/activity?limit=N                                      │
//! │  GET    dashboard/kpis?period=7d|30d|90d|12m                            │
//! │  GET    dashboard/analytics?period=...                                  │
//! │  GET    sales-channels              GET sales-channels/{id}             │
//! │  GET    security/sessions           DELETE security/sessions/{id}       │
//! │  GET    security/ip-rules?kind=     POST / DELETE security/ip-rules     │
//! │  GET    security/events?limit=N                                         │
//! │  GET    security/config             PUT security/config                 │
//! │  GET    {resource}?page=&pageSize=  POST {resource}                     │
//! │  GET    {resource}/{id}             PUT / DELETE {resource}/{id}        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use orbit_core::validation::{validate_cidr, validate_entity_id, validate_limit};
use orbit_core::{
    ActivityItem, DashboardAnalytics, DashboardKpis, DashboardStats, IpRule, IpRuleKind, NewIpRule,
    Period, RecentOrder, SalesChannel, SecurityConfig, SecurityEvent, SecuritySession,
};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::auth::SessionStore;
use crate::config::{HttpSettings, StoreConfig};
use crate::error::{SyncError, SyncResult};
use crate::keys::{ListQuery, ResourceKind};

// =============================================================================
// API Trait
// =============================================================================

/// Operations of the remote admin API used by hooks and stores.
#[async_trait]
pub trait AdminApi: Send + Sync + 'static {
    async fn dashboard_stats(&self) -> SyncResult<DashboardStats>;
    async fn dashboard_recent_orders(&self, limit: u32) -> SyncResult<Vec<RecentOrder>>;
    async fn dashboard_activity(&self, limit: u32) -> SyncResult<Vec<ActivityItem>>;
    async fn dashboard_kpis(&self, period: Period) -> SyncResult<DashboardKpis>;
    async fn dashboard_analytics(&self, period: Period) -> SyncResult<DashboardAnalytics>;

    async fn sales_channels(&self) -> SyncResult<Vec<SalesChannel>>;
    async fn sales_channel(&self, id: &str) -> SyncResult<SalesChannel>;

    async fn security_sessions(&self) -> SyncResult<Vec<SecuritySession>>;
    async fn revoke_session(&self, id: &str) -> SyncResult<()>;
    async fn ip_rules(&self, kind: Option<IpRuleKind>) -> SyncResult<Vec<IpRule>>;
    async fn create_ip_rule(&self, rule: &NewIpRule) -> SyncResult<IpRule>;
    async fn delete_ip_rule(&self, id: &str) -> SyncResult<()>;
    async fn security_events(&self, limit: u32) -> SyncResult<Vec<SecurityEvent>>;
    async fn security_config(&self) -> SyncResult<SecurityConfig>;
    async fn update_security_config(&self, config: &SecurityConfig) -> SyncResult<SecurityConfig>;

    async fn list_resources(&self, kind: ResourceKind, query: &ListQuery) -> SyncResult<Value>;
    async fn get_resource(&self, kind: ResourceKind, id: &str) -> SyncResult<Value>;
    async fn create_resource(&self, kind: ResourceKind, body: &Value) -> SyncResult<Value>;
    async fn update_resource(&self, kind: ResourceKind, id: &str, body: &Value)
        -> SyncResult<Value>;
    async fn delete_resource(&self, kind: ResourceKind, id: &str) -> SyncResult<()>;
}

// =============================================================================
// HTTP Client
// =============================================================================

/// [`AdminApi`] over reqwest.
pub struct ApiClient {
    http: Client,
    store: RwLock<StoreConfig>,
    session: SessionStore,
}

impl ApiClient {
    pub fn new(store: StoreConfig, session: SessionStore, settings: &HttpSettings) -> SyncResult<Self> {
        let http = Self::build_http(settings)?;
        Ok(ApiClient {
            http,
            store: RwLock::new(store),
            session,
        })
    }

    /// Shared reqwest client builder (also used for the push token client).
    pub fn build_http(settings: &HttpSettings) -> SyncResult<Client> {
        Ok(Client::builder()
            .user_agent(settings.user_agent.clone())
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?)
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Points subsequent requests at a new store.
    pub fn set_store(&self, store: StoreConfig) {
        let mut guard = self.store.write().unwrap_or_else(|e| e.into_inner());
        *guard = store;
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> SyncResult<Url> {
        let mut url = self
            .store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .api_url(path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> SyncResult<Response> {
        let url = self.url(path, query)?;
        debug!(%method, %url, "API request");

        let mut req = self.http.request(method, url);
        if let Some(token) = self.session.token().await {
            req = req.bearer_auth(token);
        }
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), path, "API request failed");
            return Err(SyncError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(resp)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> SyncResult<T> {
        let resp = self.send(method, path, query, body).await?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn request_unit(&self, method: Method, path: &str) -> SyncResult<()> {
        self.send(method, path, &[], None).await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> SyncResult<T> {
        self.request(Method::GET, path, query, None).await
    }
}

/// Maps a 404 on an entity path to [`SyncError::NotFound`].
fn not_found(kind: &str, id: &str) -> impl FnOnce(SyncError) -> SyncError {
    let kind = kind.to_string();
    let id = id.to_string();
    move |err| match err {
        SyncError::Http { status: 404, .. } => SyncError::NotFound { resource: kind, id },
        other => other,
    }
}

#[async_trait]
impl AdminApi for ApiClient {
    async fn dashboard_stats(&self) -> SyncResult<DashboardStats> {
        self.get("dashboard/stats", &[]).await
    }

    async fn dashboard_recent_orders(&self, limit: u32) -> SyncResult<Vec<RecentOrder>> {
        validate_limit(limit)?;
        self.get("dashboard/recent-orders", &[("limit", limit.to_string())])
            .await
    }

    async fn dashboard_activity(&self, limit: u32) -> SyncResult<Vec<ActivityItem>> {
        validate_limit(limit)?;
        self.get("dashboard/activity", &[("limit", limit.to_string())])
            .await
    }

    async fn dashboard_kpis(&self, period: Period) -> SyncResult<DashboardKpis> {
        self.get("dashboard/kpis", &[("period", period.to_string())])
            .await
    }

    async fn dashboard_analytics(&self, period: Period) -> SyncResult<DashboardAnalytics> {
        self.get("dashboard/analytics", &[("period", period.to_string())])
            .await
    }

    async fn sales_channels(&self) -> SyncResult<Vec<SalesChannel>> {
        self.get("sales-channels", &[]).await
    }

    async fn sales_channel(&self, id: &str) -> SyncResult<SalesChannel> {
        validate_entity_id(id)?;
        self.get(&format!("sales-channels/{}", id), &[])
            .await
            .map_err(not_found("sales-channel", id))
    }

    async fn security_sessions(&self) -> SyncResult<Vec<SecuritySession>> {
        self.get("security/sessions", &[]).await
    }

    async fn revoke_session(&self, id: &str) -> SyncResult<()> {
        validate_entity_id(id)?;
        self.request_unit(Method::DELETE, &format!("security/sessions/{}", id))
            .await
            .map_err(not_found("session", id))
    }

    async fn ip_rules(&self, kind: Option<IpRuleKind>) -> SyncResult<Vec<IpRule>> {
        let query: Vec<(&str, String)> = kind
            .map(|k| vec![("kind", k.to_string())])
            .unwrap_or_default();
        self.get("security/ip-rules", &query).await
    }

    async fn create_ip_rule(&self, rule: &NewIpRule) -> SyncResult<IpRule> {
        validate_cidr(&rule.cidr)?;
        let body = serde_json::to_value(rule)?;
        self.request(Method::POST, "security/ip-rules", &[], Some(&body))
            .await
    }

    async fn delete_ip_rule(&self, id: &str) -> SyncResult<()> {
        validate_entity_id(id)?;
        self.request_unit(Method::DELETE, &format!("security/ip-rules/{}", id))
            .await
            .map_err(not_found("ip-rule", id))
    }

    async fn security_events(&self, limit: u32) -> SyncResult<Vec<SecurityEvent>> {
        validate_limit(limit)?;
        self.get("security/events", &[("limit", limit.to_string())])
            .await
    }

    async fn security_config(&self) -> SyncResult<SecurityConfig> {
        self.get("security/config", &[]).await
    }

    async fn update_security_config(&self, config: &SecurityConfig) -> SyncResult<SecurityConfig> {
        let body = serde_json::to_value(config)?;
        self.request(Method::PUT, "security/config", &[], Some(&body))
            .await
    }

    async fn list_resources(&self, kind: ResourceKind, query: &ListQuery) -> SyncResult<Value> {
        query.validate()?;
        self.get(kind.path(), &query.pairs()).await
    }

    async fn get_resource(&self, kind: ResourceKind, id: &str) -> SyncResult<Value> {
        validate_entity_id(id)?;
        self.get(&format!("{}/{}", kind.path(), id), &[])
            .await
            .map_err(not_found(kind.path(), id))
    }

    async fn create_resource(&self, kind: ResourceKind, body: &Value) -> SyncResult<Value> {
        self.request(Method::POST, kind.path(), &[], Some(body))
            .await
    }

    async fn update_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        body: &Value,
    ) -> SyncResult<Value> {
        validate_entity_id(id)?;
        self.request(Method::PUT, &format!("{}/{}", kind.path(), id), &[], Some(body))
            .await
            .map_err(not_found(kind.path(), id))
    }

    async fn delete_resource(&self, kind: ResourceKind, id: &str) -> SyncResult<()> {
        validate_entity_id(id)?;
        self.request_unit(Method::DELETE, &format!("{}/{}", kind.path(), id))
            .await
            .map_err(not_found(kind.path(), id))
    }
}
