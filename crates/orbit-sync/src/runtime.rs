//! # Sync Runtime
//!
//! Owns and wires every long-lived part of the data layer.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncRuntime                                      │
//! │                                                                         │
//! │  SyncConfig ──► StoreConfig ──┬──► ApiClient (AdminApi) ◄── stores      │
//! │                               │                         ◄── hooks       │
//! │                               └──► PushChannel (WsConnector +           │
//! │                                     WsTokenClient)                      │
//! │                                         │ broadcast<PushEvent>          │
//! │                                         ▼                               │
//! │  QueryCache ◄──── patch / invalidate ─ Reconciler task                  │
//! │                                                                         │
//! │  reconfigure(store): same store is a no-op; otherwise the API client    │
//! │  and channel are repointed and every cached entry is marked stale.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use orbit_core::cache_key;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::auth::{SessionStore, TokenProvider, WsTokenClient};
use crate::cache::QueryCache;
use crate::channel::{ChannelState, PushChannel};
use crate::client::{AdminApi, ApiClient};
use crate::config::{StoreConfig, SyncConfig};
use crate::error::SyncResult;
use crate::hooks::Hooks;
use crate::keys::ResourceKind;
use crate::reconcile::Reconciler;
use crate::stores::{DashboardStore, ResourceStore, SecurityStore};
use crate::transport::{Connector, WsConnector};

// =============================================================================
// Runtime Status
// =============================================================================

/// Point-in-time view of the runtime for status displays.
#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub channel_state: ChannelState,
    pub is_connected: bool,
    pub api_base_url: String,
    /// Registered push topics with their subscriber counts.
    pub topics: Vec<(String, usize)>,
    pub cache_entries: usize,
}

// =============================================================================
// Backend
// =============================================================================

/// Remote collaborators of the runtime.
///
/// [`SyncRuntime::new`] builds the HTTP and WebSocket ones; tests hand in
/// in-memory stand-ins through [`SyncRuntime::with_backend`].
pub struct Backend {
    pub api: Arc<dyn AdminApi>,
    pub connector: Arc<dyn Connector>,
    pub tokens: Arc<dyn TokenProvider>,
}

// =============================================================================
// Sync Runtime
// =============================================================================

pub struct SyncRuntime {
    config: SyncConfig,
    store: StoreConfig,
    session: SessionStore,
    cache: QueryCache,
    api: Arc<dyn AdminApi>,
    /// Set when the runtime talks HTTP itself; repointed on reconfigure.
    client: Option<Arc<ApiClient>>,
    tokens: Arc<dyn TokenProvider>,
    channel: PushChannel,
    reconciler: Reconciler,
    dashboard: DashboardStore,
    security: SecurityStore,
    reconcile_task: Option<JoinHandle<()>>,
}

impl SyncRuntime {
    /// Builds the runtime against the remote admin API.
    pub fn new(config: SyncConfig, session: SessionStore) -> SyncResult<Self> {
        config.validate()?;
        let store = config.store_config()?;

        let client = Arc::new(ApiClient::new(store.clone(), session.clone(), &config.http)?);
        let tokens = Self::token_client(&config, &store, &client, &session)?;
        let backend = Backend {
            api: client.clone(),
            connector: Arc::new(WsConnector::new(&config.channel)),
            tokens,
        };

        let mut runtime = Self::assemble(config, store, session, backend)?;
        runtime.client = Some(client);
        Ok(runtime)
    }

    /// Builds the runtime around caller-supplied collaborators.
    pub fn with_backend(
        config: SyncConfig,
        session: SessionStore,
        backend: Backend,
    ) -> SyncResult<Self> {
        config.validate()?;
        let store = config.store_config()?;
        Self::assemble(config, store, session, backend)
    }

    fn assemble(
        config: SyncConfig,
        store: StoreConfig,
        session: SessionStore,
        backend: Backend,
    ) -> SyncResult<Self> {
        let cache = QueryCache::new(config.cache.gc_time());
        let channel = PushChannel::new(
            config.channel.clone(),
            backend.connector,
            store.ws_url()?,
            backend.tokens.clone(),
        );
        let reconciler = Reconciler::new(cache.clone());

        info!(
            api = %store.api_base_url(),
            gc_secs = config.cache.gc_time().as_secs(),
            "Sync runtime created"
        );

        Ok(SyncRuntime {
            dashboard: DashboardStore::new(cache.clone(), backend.api.clone()),
            security: SecurityStore::new(cache.clone(), backend.api.clone()),
            config,
            store,
            session,
            cache,
            api: backend.api,
            client: None,
            tokens: backend.tokens,
            channel,
            reconciler,
            reconcile_task: None,
        })
    }

    fn token_client(
        config: &SyncConfig,
        store: &StoreConfig,
        client: &ApiClient,
        session: &SessionStore,
    ) -> SyncResult<Arc<dyn TokenProvider>> {
        Ok(Arc::new(WsTokenClient::new(
            client.http().clone(),
            store.ws_token_url()?,
            session.clone(),
            Duration::from_secs(config.channel.token_refresh_margin_secs),
        )))
    }

    /// Starts applying push events to the cache. Must run inside a tokio
    /// runtime. Calling it again is a no-op.
    pub fn start(&mut self) {
        if self.reconcile_task.is_some() {
            return;
        }
        let task = self.reconciler.clone().spawn(self.channel.events());
        self.reconcile_task = Some(task);
        info!("Sync runtime started");
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store_config(&self) -> &StoreConfig {
        &self.store
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn channel(&self) -> &PushChannel {
        &self.channel
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn hooks(&self) -> Hooks {
        Hooks::new(self.cache.clone(), self.api.clone(), Some(self.channel.clone()))
    }

    pub fn dashboard(&self) -> &DashboardStore {
        &self.dashboard
    }

    pub fn security(&self) -> &SecurityStore {
        &self.security
    }

    /// A fresh store for one resource. Keep it for as long as its filters
    /// and selection should live.
    pub fn resource<T>(&self, kind: ResourceKind) -> ResourceStore<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        ResourceStore::new(kind, self.cache.clone(), self.api.clone(), self.reconciler.clone())
    }

    pub fn watch_channel(&self) -> watch::Receiver<ChannelState> {
        self.channel.watch_state()
    }

    pub fn status(&self) -> RuntimeStatus {
        let channel_state = self.channel.state();
        RuntimeStatus {
            channel_state,
            is_connected: channel_state == ChannelState::Connected,
            api_base_url: self.store.api_base_url().to_string(),
            topics: self
                .channel
                .topics()
                .into_iter()
                .map(|(topic, n)| (topic.to_string(), n))
                .collect(),
            cache_entries: self.cache.len(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Points the runtime at another store.
    ///
    /// Returns false if `store` equals the current one. Otherwise the API
    /// client and push channel are repointed and every cached entry is
    /// marked stale.
    pub fn reconfigure(&mut self, store: StoreConfig) -> SyncResult<bool> {
        if store == self.store {
            debug!("Store config unchanged");
            return Ok(false);
        }

        let ws_url = store.ws_url()?;
        let tokens = match &self.client {
            Some(client) => {
                let tokens = Self::token_client(&self.config, &store, client, &self.session)?;
                client.set_store(store.clone());
                tokens
            }
            None => self.tokens.clone(),
        };
        self.channel.reconfigure(ws_url, tokens.clone());
        self.tokens = tokens;

        let stale = self.cache.invalidate(&cache_key![]);
        info!(
            from = %self.store.api_base_url(),
            to = %store.api_base_url(),
            stale,
            "Sync runtime reconfigured"
        );
        self.store = store;
        Ok(true)
    }

    /// Stops the reconciler and closes the push channel for good.
    pub fn shutdown(&mut self) {
        info!("Shutting down sync runtime");
        if let Some(task) = self.reconcile_task.take() {
            task.abort();
        }
        self.channel.shutdown();
        info!("Sync runtime stopped");
    }
}

impl Drop for SyncRuntime {
    fn drop(&mut self) {
        if let Some(task) = self.reconcile_task.take() {
            task.abort();
        }
    }
}
