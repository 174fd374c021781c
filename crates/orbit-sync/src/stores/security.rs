//! Security store: sessions, IP rules, security events and config.

use std::sync::{Arc, Mutex};

use orbit_core::validation::{validate_cidr, validate_entity_id};
use orbit_core::{IpRule, IpRuleKind, NewIpRule, SecurityConfig, SecurityEvent, SecuritySession};
use tracing::{info, warn};

use crate::cache::QueryCache;
use crate::client::AdminApi;
use crate::error::SyncResult;
use crate::keys;
use crate::queries;
use crate::stores::resolve_def;

#[derive(Clone)]
pub struct SecurityStore {
    cache: QueryCache,
    api: Arc<dyn AdminApi>,
    rule_filter: Arc<Mutex<Option<IpRuleKind>>>,
}

impl SecurityStore {
    pub fn new(cache: QueryCache, api: Arc<dyn AdminApi>) -> Self {
        SecurityStore {
            cache,
            api,
            rule_filter: Arc::new(Mutex::new(None)),
        }
    }

    pub fn rule_filter(&self) -> Option<IpRuleKind> {
        *self.rule_filter.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_rule_filter(&self, kind: Option<IpRuleKind>) {
        *self.rule_filter.lock().unwrap_or_else(|e| e.into_inner()) = kind;
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    pub async fn sessions(&self) -> SyncResult<Vec<SecuritySession>> {
        resolve_def(&self.cache, queries::security_sessions(&self.api)).await
    }

    pub async fn revoke_session(&self, id: &str) -> SyncResult<()> {
        validate_entity_id(id)?;
        self.api.revoke_session(id).await.inspect_err(|e| {
            warn!(session = id, error = %e, "Session revoke failed");
        })?;
        self.cache.invalidate(&keys::security_sessions());
        info!(session = id, "Session revoked");
        Ok(())
    }

    // =========================================================================
    // IP Rules
    // =========================================================================

    /// IP rules under the current filter.
    pub async fn ip_rules(&self) -> SyncResult<Vec<IpRule>> {
        resolve_def(&self.cache, queries::ip_rules(&self.api, self.rule_filter())).await
    }

    pub async fn create_ip_rule(&self, rule: &NewIpRule) -> SyncResult<IpRule> {
        validate_cidr(&rule.cidr)?;
        let created = self.api.create_ip_rule(rule).await?;
        self.cache.invalidate(&keys::ip_rules_prefix());
        info!(rule = %created.id, cidr = %created.cidr, "IP rule created");
        Ok(created)
    }

    pub async fn delete_ip_rule(&self, id: &str) -> SyncResult<()> {
        validate_entity_id(id)?;
        self.api.delete_ip_rule(id).await?;
        self.cache.invalidate(&keys::ip_rules_prefix());
        info!(rule = id, "IP rule deleted");
        Ok(())
    }

    // =========================================================================
    // Events & Config
    // =========================================================================

    pub async fn events(&self, limit: u32) -> SyncResult<Vec<SecurityEvent>> {
        resolve_def(&self.cache, queries::security_events(&self.api, limit)?).await
    }

    pub async fn config(&self) -> SyncResult<SecurityConfig> {
        resolve_def(&self.cache, queries::security_config(&self.api)).await
    }

    /// Saves the config and writes the server's answer into the cache.
    pub async fn update_config(&self, config: &SecurityConfig) -> SyncResult<SecurityConfig> {
        let saved = self.api.update_security_config(config).await?;
        let value = serde_json::to_value(&saved)?;
        let key = keys::security_config();
        if !self.cache.set_data(&key, move |_| Some(value)) {
            self.cache.invalidate(&key);
        }
        info!("Security config updated");
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;
    use std::time::Duration;

    fn setup() -> (Arc<FakeApi>, QueryCache, SecurityStore) {
        let api = Arc::new(FakeApi::new());
        let cache = QueryCache::new(Duration::from_secs(600));
        let store = SecurityStore::new(cache.clone(), api.clone());
        (api, cache, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoke_invalidates_sessions_only() {
        let (api, cache, store) = setup();
        assert_eq!(store.sessions().await.unwrap().len(), 2);
        store.config().await.unwrap();

        store.revoke_session("s-2").await.unwrap();
        assert!(cache.snapshot(&keys::security_sessions()).unwrap().invalidated);
        assert!(!cache.snapshot(&keys::security_config()).unwrap().invalidated);

        assert_eq!(store.sessions().await.unwrap().len(), 1);
        assert_eq!(api.calls("security_sessions"), 2);
        assert!(store.revoke_session("s-2").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_rule_lifecycle() {
        let (api, _cache, store) = setup();
        let bad = NewIpRule {
            kind: IpRuleKind::Deny,
            cidr: "10.0.0.0/33".into(),
            note: None,
        };
        assert!(store.create_ip_rule(&bad).await.is_err());
        assert_eq!(api.calls("create_ip_rule"), 0);

        assert!(store.ip_rules().await.unwrap().is_empty());
        store.set_rule_filter(Some(IpRuleKind::Deny));
        assert!(store.ip_rules().await.unwrap().is_empty());

        let created = store
            .create_ip_rule(&NewIpRule {
                cidr: "10.0.0.0/8".into(),
                ..bad
            })
            .await
            .unwrap();
        assert_eq!(store.ip_rules().await.unwrap().len(), 1);

        store.set_rule_filter(Some(IpRuleKind::Allow));
        assert!(store.ip_rules().await.unwrap().is_empty());

        store.delete_ip_rule(&created.id).await.unwrap();
        store.set_rule_filter(None);
        assert!(store.ip_rules().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_writes_through() {
        let (api, cache, store) = setup();
        let mut config = store.config().await.unwrap();
        config.require_two_factor = true;

        store.update_config(&config).await.unwrap();
        let cached = cache.snapshot(&keys::security_config()).unwrap();
        assert_eq!(cached.value.unwrap()["requireTwoFactor"], true);
        assert!(store.config().await.unwrap().require_two_factor);
        assert_eq!(api.calls("security_config"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_leaves_cache_alone() {
        let (api, cache, store) = setup();
        let mut config = store.config().await.unwrap();
        api.fail_mutations(true);
        config.max_failed_logins = 1;

        assert!(store.update_config(&config).await.is_err());
        let cached = cache.snapshot(&keys::security_config()).unwrap();
        assert_eq!(cached.value.unwrap()["maxFailedLogins"], 5);
    }
}
