//! In-memory stand-ins for the remote API, the socket and the token
//! endpoint, shared by the unit tests of this crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use orbit_core::{
    ActivityItem, DashboardAnalytics, DashboardKpis, DashboardStats, IpRule,
    IpRuleKind, NewIpRule, Period, RecentOrder, SalesChannel, SecurityConfig, SecurityEvent,
    SecuritySession, SeriesPoint, Severity,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use crate::auth::TokenProvider;
use crate::client::AdminApi;
use crate::error::{SyncError, SyncResult};
use crate::keys::{ListQuery, ResourceKind};
use crate::protocol::{ClientMessage, ServerFrame};
use crate::transport::{Connection, Connector};

// =============================================================================
// Fake Admin API
// =============================================================================

/// An admin backend held in memory.
pub struct FakeApi {
    calls: Mutex<HashMap<&'static str, usize>>,
    latency: Mutex<Duration>,
    fail_reads: AtomicBool,
    fail_mutations: AtomicBool,
    resources: Mutex<HashMap<ResourceKind, Vec<Value>>>,
    sessions: Mutex<Vec<SecuritySession>>,
    ip_rules: Mutex<Vec<IpRule>>,
    config: Mutex<SecurityConfig>,
    next_id: AtomicUsize,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeApi {
    pub fn new() -> Self {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let mut resources = HashMap::new();
        resources.insert(
            ResourceKind::SalesChannels,
            vec![
                json!({"id": "ch-1", "name": "Amazon", "channelType": "marketplace", "status": "active"}),
                json!({"id": "ch-2", "name": "Shopify", "channelType": "storefront", "status": "paused"}),
            ],
        );
        resources.insert(
            ResourceKind::Orders,
            vec![
                json!({"id": "o-2", "createdAt": "2024-03-02T00:00:00Z", "status": "pending"}),
                json!({"id": "o-1", "createdAt": "2024-03-01T00:00:00Z", "status": "paid"}),
            ],
        );

        FakeApi {
            calls: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            fail_reads: AtomicBool::new(false),
            fail_mutations: AtomicBool::new(false),
            resources: Mutex::new(resources),
            sessions: Mutex::new(vec![
                SecuritySession {
                    id: "s-1".into(),
                    user_id: "u-1".into(),
                    ip_address: "10.0.0.1".into(),
                    user_agent: None,
                    created_at: at,
                    last_seen_at: at,
                    current: true,
                },
                SecuritySession {
                    id: "s-2".into(),
                    user_id: "u-2".into(),
                    ip_address: "10.0.0.2".into(),
                    user_agent: Some("curl".into()),
                    created_at: at,
                    last_seen_at: at,
                    current: false,
                },
            ]),
            ip_rules: Mutex::new(Vec::new()),
            config: Mutex::new(SecurityConfig {
                require_two_factor: false,
                session_timeout_minutes: 60,
                max_failed_logins: 5,
                ip_allowlist_enabled: false,
            }),
            next_id: AtomicUsize::new(100),
        }
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_mutations(&self, fail: bool) {
        self.fail_mutations.store(fail, Ordering::SeqCst);
    }

    pub fn resource(&self, kind: ResourceKind, id: &str) -> Option<Value> {
        self.resources
            .lock()
            .unwrap()
            .get(&kind)
            .and_then(|items| items.iter().find(|i| i["id"] == id).cloned())
    }

    async fn hit(&self, name: &'static str) -> usize {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(name).or_insert(0);
            *n += 1;
            *n
        };
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        n
    }

    async fn read(&self, name: &'static str) -> SyncResult<usize> {
        let n = self.hit(name).await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::Http {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(n)
    }

    async fn write(&self, name: &'static str) -> SyncResult<()> {
        self.hit(name).await;
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(SyncError::Http {
                status: 500,
                body: "mutation failed".into(),
            });
        }
        Ok(())
    }

    fn not_found(kind: &str, id: &str) -> SyncError {
        SyncError::NotFound {
            resource: kind.to_string(),
            id: id.to_string(),
        }
    }
}

#[async_trait]
impl AdminApi for FakeApi {
    async fn dashboard_stats(&self) -> SyncResult<DashboardStats> {
        let n = self.read("dashboard_stats").await?;
        Ok(DashboardStats {
            total_orders: 100 + n as i64,
            pending_orders: 4,
            total_customers: 40,
            total_products: 12,
            low_stock_products: 1,
            revenue_today_cents: 12_345,
        })
    }

    async fn dashboard_recent_orders(&self, limit: u32) -> SyncResult<Vec<RecentOrder>> {
        self.read("dashboard_recent_orders").await?;
        Ok((0..limit.min(3))
            .map(|i| RecentOrder {
                id: format!("o-{}", i),
                order_number: format!("#{}", 1000 + i),
                customer_name: None,
                status: "paid".into(),
                total_cents: 1_000,
                created_at: Utc::now(),
            })
            .collect())
    }

    async fn dashboard_activity(&self, limit: u32) -> SyncResult<Vec<ActivityItem>> {
        self.read("dashboard_activity").await?;
        Ok((0..limit.min(2))
            .map(|i| ActivityItem {
                id: format!("a-{}", i),
                action: "order.created".into(),
                actor: None,
                description: "Order created".into(),
                occurred_at: Utc::now(),
            })
            .collect())
    }

    async fn dashboard_kpis(&self, period: Period) -> SyncResult<DashboardKpis> {
        let n = self.read("dashboard_kpis").await?;
        Ok(DashboardKpis {
            period,
            revenue: 1_000 * n as i64,
            orders: 10,
            average_order_value: 100,
            new_customers: 2,
            revenue_change_bps: 150,
        })
    }

    async fn dashboard_analytics(&self, period: Period) -> SyncResult<DashboardAnalytics> {
        self.read("dashboard_analytics").await?;
        Ok(DashboardAnalytics {
            period,
            revenue_series: vec![SeriesPoint {
                label: "Mon".into(),
                value: 10,
            }],
            orders_series: Vec::new(),
            top_products: Vec::new(),
        })
    }

    async fn sales_channels(&self) -> SyncResult<Vec<SalesChannel>> {
        self.read("sales_channels").await?;
        let items = self.resources.lock().unwrap()[&ResourceKind::SalesChannels].clone();
        Ok(serde_json::from_value(Value::Array(items))?)
    }

    async fn sales_channel(&self, id: &str) -> SyncResult<SalesChannel> {
        self.read("sales_channel").await?;
        let item = self
            .resource(ResourceKind::SalesChannels, id)
            .ok_or_else(|| Self::not_found("sales-channels", id))?;
        Ok(serde_json::from_value(item)?)
    }

    async fn security_sessions(&self) -> SyncResult<Vec<SecuritySession>> {
        self.read("security_sessions").await?;
        Ok(self.sessions.lock().unwrap().clone())
    }

    async fn revoke_session(&self, id: &str) -> SyncResult<()> {
        self.write("revoke_session").await?;
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|s| s.id != id);
        if sessions.len() == before {
            return Err(Self::not_found("session", id));
        }
        Ok(())
    }

    async fn ip_rules(&self, kind: Option<IpRuleKind>) -> SyncResult<Vec<IpRule>> {
        self.read("ip_rules").await?;
        Ok(self
            .ip_rules
            .lock()
            .unwrap()
            .iter()
            .filter(|r| kind.map(|k| r.kind == k).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn create_ip_rule(&self, rule: &NewIpRule) -> SyncResult<IpRule> {
        self.write("create_ip_rule").await?;
        let created = IpRule {
            id: format!("r-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            kind: rule.kind,
            cidr: rule.cidr.clone(),
            note: rule.note.clone(),
            created_at: Utc::now(),
        };
        self.ip_rules.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn delete_ip_rule(&self, id: &str) -> SyncResult<()> {
        self.write("delete_ip_rule").await?;
        self.ip_rules.lock().unwrap().retain(|r| r.id != id);
        Ok(())
    }

    async fn security_events(&self, limit: u32) -> SyncResult<Vec<SecurityEvent>> {
        self.read("security_events").await?;
        Ok((0..limit.min(1))
            .map(|i| SecurityEvent {
                id: format!("e-{}", i),
                event_type: "login.failed".into(),
                severity: Severity::Warning,
                ip_address: Some("10.0.0.9".into()),
                user_id: None,
                message: "Failed login".into(),
                occurred_at: Utc::now(),
            })
            .collect())
    }

    async fn security_config(&self) -> SyncResult<SecurityConfig> {
        self.read("security_config").await?;
        Ok(self.config.lock().unwrap().clone())
    }

    async fn update_security_config(&self, config: &SecurityConfig) -> SyncResult<SecurityConfig> {
        self.write("update_security_config").await?;
        *self.config.lock().unwrap() = config.clone();
        Ok(config.clone())
    }

    async fn list_resources(&self, kind: ResourceKind, query: &ListQuery) -> SyncResult<Value> {
        self.read("list_resources").await?;
        let items = self
            .resources
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        let start = ((query.page.max(1) - 1) * query.page_size) as usize;
        let page: Vec<Value> = items
            .iter()
            .skip(start)
            .take(query.page_size as usize)
            .cloned()
            .collect();
        Ok(json!({
            "data": page,
            "total": items.len(),
            "page": query.page,
            "pageSize": query.page_size,
        }))
    }

    async fn get_resource(&self, kind: ResourceKind, id: &str) -> SyncResult<Value> {
        self.read("get_resource").await?;
        self.resource(kind, id)
            .ok_or_else(|| Self::not_found(kind.path(), id))
    }

    async fn create_resource(&self, kind: ResourceKind, body: &Value) -> SyncResult<Value> {
        self.write("create_resource").await?;
        let mut created = body.clone();
        if created.get("id").is_none() {
            created["id"] = json!(format!("{}-{}", kind.path(), self.next_id.fetch_add(1, Ordering::SeqCst)));
        }
        self.resources
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .insert(0, created.clone());
        Ok(created)
    }

    async fn update_resource(&self, kind: ResourceKind, id: &str, body: &Value) -> SyncResult<Value> {
        self.write("update_resource").await?;
        let mut resources = self.resources.lock().unwrap();
        let item = resources
            .get_mut(&kind)
            .and_then(|items| items.iter_mut().find(|i| i["id"] == id))
            .ok_or_else(|| Self::not_found(kind.path(), id))?;
        if let (Some(target), Some(patch)) = (item.as_object_mut(), body.as_object()) {
            for (k, v) in patch {
                target.insert(k.clone(), v.clone());
            }
        }
        Ok(item.clone())
    }

    async fn delete_resource(&self, kind: ResourceKind, id: &str) -> SyncResult<()> {
        self.write("delete_resource").await?;
        let mut resources = self.resources.lock().unwrap();
        let items = resources.entry(kind).or_default();
        let before = items.len();
        items.retain(|i| i["id"] != id);
        if items.len() == before {
            return Err(Self::not_found(kind.path(), id));
        }
        Ok(())
    }
}

// =============================================================================
// Fake Socket
// =============================================================================

/// Server side of one fake connection. Drop it to close the connection.
pub struct FakeServer {
    pub received: mpsc::Receiver<ClientMessage>,
    pub push: mpsc::Sender<ServerFrame>,
}

#[derive(Default)]
pub struct FakeConnector {
    attempts: Mutex<Vec<(Instant, Url, String)>>,
    fail_all: AtomicBool,
    reject_tokens: AtomicBool,
    server: Mutex<Option<FakeServer>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn reject_tokens(&self, reject: bool) {
        self.reject_tokens.store(reject, Ordering::SeqCst);
    }

    pub fn take_server(&self) -> Option<FakeServer> {
        self.server.lock().unwrap().take()
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(at, _, _)| *at).collect()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn last_token(&self) -> Option<String> {
        self.attempts.lock().unwrap().last().map(|(_, _, t)| t.clone())
    }

    pub fn last_url(&self) -> Option<Url> {
        self.attempts.lock().unwrap().last().map(|(_, u, _)| u.clone())
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &Url, token: &str) -> SyncResult<Connection> {
        self.attempts
            .lock()
            .unwrap()
            .push((Instant::now(), url.clone(), token.to_string()));

        if self.reject_tokens.load(Ordering::SeqCst) {
            return Err(SyncError::TokenRejected("HTTP 401".into()));
        }
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(SyncError::ConnectionFailed("connection refused".into()));
        }

        let (outgoing, received) = mpsc::channel(64);
        let (push, incoming) = mpsc::channel(64);
        *self.server.lock().unwrap() = Some(FakeServer { received, push });
        Ok(Connection { outgoing, incoming })
    }
}

// =============================================================================
// Fake Token Endpoint
// =============================================================================

#[derive(Default)]
pub struct FakeTokenProvider {
    token: Mutex<Option<String>>,
    calls: AtomicUsize,
    invalidations: AtomicUsize,
}

impl FakeTokenProvider {
    /// No session: every request fails with `AuthRequired`.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: &str) -> Self {
        let provider = Self::default();
        provider.set_token(Some(token));
        provider
    }

    pub fn set_token(&self, token: Option<&str>) {
        *self.token.lock().unwrap() = token.map(str::to_string);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for FakeTokenProvider {
    async fn push_token(&self) -> SyncResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.token.lock().unwrap().clone().ok_or(SyncError::AuthRequired)
    }

    async fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}
