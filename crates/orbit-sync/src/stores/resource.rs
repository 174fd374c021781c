//! # Resource Store
//!
//! One generic store per CRUD resource (orders, products, inventory,
//! customers, returns, workflows, sales channels).
//!
//! ## Mutation Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     create / update / delete                            │
//! │                                                                         │
//! │  optimistic?                                                            │
//! │     yes ──► snapshot list + entity entries                              │
//! │             patch them locally (same merge rules as push events)        │
//! │             record PendingMutation                                      │
//! │                                                                         │
//! │  call remote API                                                        │
//! │     Ok  ──► invalidate [resource, "list"] and [resource, "detail", id]  │
//! │     Err ──► restore snapshot (optimistic only), surface the error       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use orbit_core::validation::validate_entity_id;
use orbit_core::{CacheKey, EventKind, Page, PollingPolicy, PushEvent};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cache::{fetcher, QueryCache, QuerySubscription};
use crate::client::AdminApi;
use crate::error::SyncResult;
use crate::keys::{ListQuery, ResourceKind};
use crate::queries::QueryDef;
use crate::reconcile::Reconciler;
use crate::stores::resolve_def;

const LIST_STALE: std::time::Duration = std::time::Duration::from_secs(30);
const DETAIL_STALE: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

/// An optimistic write waiting for the server.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub id: Uuid,
    pub op: MutationOp,
    pub entity_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LocalState {
    query: ListQuery,
    selected: Option<String>,
    pending: Vec<PendingMutation>,
}

/// Cached entries captured before an optimistic patch.
type Snapshot = Vec<(CacheKey, Value)>;

/// Store of one CRUD resource. `T` is the item type.
pub struct ResourceStore<T> {
    kind: ResourceKind,
    cache: QueryCache,
    api: Arc<dyn AdminApi>,
    reconciler: Reconciler,
    optimistic: bool,
    local: Arc<Mutex<LocalState>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ResourceStore<T> {
    fn clone(&self) -> Self {
        ResourceStore {
            kind: self.kind,
            cache: self.cache.clone(),
            api: self.api.clone(),
            reconciler: self.reconciler.clone(),
            optimistic: self.optimistic,
            local: self.local.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> ResourceStore<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(
        kind: ResourceKind,
        cache: QueryCache,
        api: Arc<dyn AdminApi>,
        reconciler: Reconciler,
    ) -> Self {
        ResourceStore {
            kind,
            cache,
            api,
            reconciler,
            optimistic: false,
            local: Arc::new(Mutex::new(LocalState::default())),
            _marker: PhantomData,
        }
    }

    /// Opts in to optimistic writes.
    pub fn optimistic(mut self, enabled: bool) -> Self {
        self.optimistic = enabled;
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn local(&self) -> MutexGuard<'_, LocalState> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Local State
    // =========================================================================

    pub fn query(&self) -> ListQuery {
        self.local().query.clone()
    }

    pub fn set_search(&self, search: Option<String>) {
        let mut local = self.local();
        local.query.search = search.filter(|s| !s.trim().is_empty());
        local.query.page = 1;
    }

    pub fn set_status(&self, status: Option<String>) {
        let mut local = self.local();
        local.query.status = status;
        local.query.page = 1;
    }

    pub fn set_sort(&self, sort: Option<String>) {
        let mut local = self.local();
        local.query.sort = sort;
        local.query.page = 1;
    }

    pub fn set_page(&self, page: u32) -> SyncResult<()> {
        let mut local = self.local();
        let next = ListQuery {
            page,
            ..local.query.clone()
        };
        next.validate()?;
        local.query = next;
        Ok(())
    }

    pub fn set_page_size(&self, page_size: u32) -> SyncResult<()> {
        let mut local = self.local();
        let next = ListQuery {
            page: 1,
            page_size,
            ..local.query.clone()
        };
        next.validate()?;
        local.query = next;
        Ok(())
    }

    pub fn next_page(&self) {
        self.local().query.page += 1;
    }

    pub fn prev_page(&self) {
        let mut local = self.local();
        local.query.page = local.query.page.saturating_sub(1).max(1);
    }

    pub fn select(&self, id: Option<&str>) {
        self.local().selected = id.map(str::to_string);
    }

    pub fn selected(&self) -> Option<String> {
        self.local().selected.clone()
    }

    pub fn pending(&self) -> Vec<PendingMutation> {
        self.local().pending.clone()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Query for the current list parameters.
    pub fn list_def(&self) -> QueryDef<Page<T>> {
        let query = self.query();
        let (api, kind) = (self.api.clone(), self.kind);
        let list_query = query.clone();
        QueryDef::new(
            kind.list_key(&query),
            fetcher(move || {
                let (api, query) = (api.clone(), list_query.clone());
                async move { api.list_resources(kind, &query).await }
            }),
            PollingPolicy::stale_for(LIST_STALE),
        )
        .topics(&[kind.path()])
    }

    pub fn detail_def(&self, id: &str) -> SyncResult<QueryDef<T>> {
        validate_entity_id(id)?;
        let (api, kind, owned) = (self.api.clone(), self.kind, id.to_string());
        Ok(QueryDef::new(
            kind.detail_key(id),
            fetcher(move || {
                let (api, id) = (api.clone(), owned.clone());
                async move { api.get_resource(kind, &id).await }
            }),
            PollingPolicy::stale_for(DETAIL_STALE),
        )
        .topics(&[kind.path()]))
    }

    /// Keeps the current list page cached while held.
    ///
    /// Holds the cache entry only. Push topics are held by a mounted hook:
    /// pass [`list_def`](Self::list_def) to `Hooks::use_query` to get both.
    pub fn subscribe_list(&self) -> QuerySubscription {
        let def = self.list_def();
        self.cache.subscribe(&def.key, def.fetcher, def.policy)
    }

    pub async fn list(&self) -> SyncResult<Page<T>> {
        self.query().validate()?;
        resolve_def(&self.cache, self.list_def()).await
    }

    pub async fn get(&self, id: &str) -> SyncResult<T> {
        resolve_def(&self.cache, self.detail_def(id)?).await
    }

    pub async fn selected_item(&self) -> SyncResult<Option<T>> {
        match self.selected() {
            Some(id) => self.get(&id).await.map(Some),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub async fn create(&self, item: &T) -> SyncResult<T> {
        let body = serde_json::to_value(item)?;

        let temp_id = format!("tmp-{}", Uuid::new_v4());
        let optimistic = self.optimistic.then(|| {
            let mut payload = body.clone();
            if let Value::Object(obj) = &mut payload {
                obj.insert("id".into(), Value::String(temp_id.clone()));
            }
            self.event(EventKind::Insert, &temp_id, Some(payload))
        });

        let api = self.api.clone();
        let kind = self.kind;
        let created = self
            .mutate(MutationOp::Create, &temp_id, optimistic, async move {
                api.create_resource(kind, &body).await
            })
            .await?;

        if let Some(id) = created.get("id").and_then(Value::as_str) {
            self.cache.invalidate(&self.kind.detail_key(id));
        }
        Ok(serde_json::from_value(created)?)
    }

    pub async fn update(&self, id: &str, patch: &Value) -> SyncResult<T> {
        validate_entity_id(id)?;
        let optimistic = self
            .optimistic
            .then(|| self.event(EventKind::Update, id, Some(patch.clone())));

        let (api, kind, owned, body) = (self.api.clone(), self.kind, id.to_string(), patch.clone());
        let updated = self
            .mutate(MutationOp::Update, id, optimistic, async move {
                api.update_resource(kind, &owned, &body).await
            })
            .await?;
        Ok(serde_json::from_value(updated)?)
    }

    pub async fn delete(&self, id: &str) -> SyncResult<()> {
        validate_entity_id(id)?;
        let optimistic = self.optimistic.then(|| self.event(EventKind::Delete, id, None));

        let (api, kind, owned) = (self.api.clone(), self.kind, id.to_string());
        self.mutate(MutationOp::Delete, id, optimistic, async move {
            api.delete_resource(kind, &owned).await
        })
        .await?;

        let mut local = self.local();
        if local.selected.as_deref() == Some(id) {
            local.selected = None;
        }
        Ok(())
    }

    fn event(&self, kind: EventKind, id: &str, payload: Option<Value>) -> PushEvent {
        PushEvent {
            topic: self.kind.topic(),
            entity_id: Some(id.to_string()),
            kind,
            payload,
        }
    }

    async fn mutate<R, Fut>(
        &self,
        op: MutationOp,
        entity_id: &str,
        optimistic: Option<PushEvent>,
        call: Fut,
    ) -> SyncResult<R>
    where
        Fut: Future<Output = SyncResult<R>>,
    {
        let pending = PendingMutation {
            id: Uuid::new_v4(),
            op,
            entity_id: entity_id.to_string(),
            started_at: Utc::now(),
        };

        let snapshot = optimistic.map(|event| {
            let snapshot = self.snapshot(entity_id);
            self.reconciler.patch(&event);
            self.local().pending.push(pending.clone());
            debug!(resource = %self.kind, ?op, entity_id, "Optimistic patch applied");
            snapshot
        });

        let result = call.await;

        self.local().pending.retain(|p| p.id != pending.id);
        match &result {
            Ok(_) => {
                if op == MutationOp::Create && snapshot.is_some() {
                    // Drop the placeholder row before the refetch starts.
                    self.reconciler.patch(&self.event(EventKind::Delete, entity_id, None));
                }
                self.cache.invalidate(&self.kind.list_prefix());
                if op != MutationOp::Create {
                    self.cache.invalidate(&self.kind.detail_key(entity_id));
                }
                info!(resource = %self.kind, ?op, entity_id, "Mutation applied");
            }
            Err(e) => {
                if let Some(snapshot) = snapshot {
                    self.rollback(snapshot);
                }
                error!(resource = %self.kind, ?op, entity_id, error = %e, "Mutation failed");
            }
        }
        result
    }

    fn snapshot(&self, entity_id: &str) -> Snapshot {
        let mut keys = self.cache.keys_with_prefix(&self.kind.list_prefix());
        keys.push(self.kind.detail_key(entity_id));
        keys.into_iter()
            .filter_map(|key| {
                let value = self.cache.snapshot(&key)?.value?;
                Some((key, value))
            })
            .collect()
    }

    fn rollback(&self, snapshot: Snapshot) {
        let restored = snapshot.len();
        for (key, value) in snapshot {
            self.cache.set_data(&key, move |_| Some(value));
        }
        debug!(resource = %self.kind, restored, "Optimistic patch rolled back");
    }
}
