//! # Push Event Reconciler
//!
//! Applies server push events to the query cache.
//!
//! ## Routing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Event Application                               │
//! │                                                                         │
//! │   PushChannel ──broadcast──► Reconciler task (one, sequential)          │
//! │                                   │                                     │
//! │                    topic ──► routes: lists / entity / related           │
//! │                                   │                                     │
//! │   insert, update ──► list entries: drop old copy by id, insert merged   │
//! │                      item at the list's comparator position             │
//! │                      entity entry: shallow merge of the payload         │
//! │   delete         ──► list entries: drop by id; entity entry absent      │
//! │   invalidate     ──► cache.invalidate(every prefix of the route)        │
//! │                                                                         │
//! │   related keys are invalidated for every event kind                     │
//! │   unknown list shape / missing id or payload ──► invalidate instead     │
//! │   receiver lagged ──► invalidate every routed prefix                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Events are handled one at a time in receipt order, so events for the
//! same entity are applied in the order the server sent them.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use orbit_core::{CacheKey, EventKind, KeyPart, PushEvent, Topic};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::QueryCache;
use crate::keys::{self, ResourceKind, SortOrder};

// =============================================================================
// Routes
// =============================================================================

/// How far a cached list may grow after an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListBounds {
    Unbounded,
    /// The last key part is the item limit (`["dashboard", "activity", 20]`).
    LastPartLimit,
    /// Key continues with `page, page_size` and then filter parts.
    ///
    /// Only page 1 receives new items; filtered lists are invalidated since
    /// the client cannot evaluate the server's filter.
    Paged,
}

/// A family of list entries fed by one topic.
#[derive(Debug, Clone)]
pub struct ListTarget {
    pub prefix: CacheKey,
    pub order: SortOrder,
    pub bounds: ListBounds,
}

/// Cache entries affected by one topic.
#[derive(Debug, Clone, Default)]
pub struct TopicRoute {
    pub lists: Vec<ListTarget>,
    /// Prefix of entity entries; the entity id is appended.
    pub entity: Option<CacheKey>,
    /// Prefixes invalidated on every event.
    pub related: Vec<CacheKey>,
}

impl TopicRoute {
    /// Standard route of a CRUD resource.
    pub fn resource(kind: ResourceKind) -> Self {
        TopicRoute {
            lists: vec![ListTarget {
                prefix: kind.list_prefix(),
                order: kind.sort_order(),
                bounds: ListBounds::Paged,
            }],
            entity: Some(kind.detail_prefix()),
            related: vec![keys::dashboard_stats()],
        }
    }

    pub fn invalidating(prefix: CacheKey) -> Self {
        TopicRoute {
            related: vec![prefix],
            ..TopicRoute::default()
        }
    }

    fn prefixes(&self) -> impl Iterator<Item = &CacheKey> {
        self.lists
            .iter()
            .map(|l| &l.prefix)
            .chain(self.entity.iter())
            .chain(self.related.iter())
    }
}

/// Routes for every topic the dashboard listens to.
pub fn default_routes() -> HashMap<Topic, Vec<TopicRoute>> {
    let mut routes = HashMap::new();

    for kind in ResourceKind::ALL {
        let mut route = TopicRoute::resource(kind);
        if kind == ResourceKind::Orders {
            route.related.push(keys::recent_orders_prefix());
        }
        routes.insert(kind.topic(), vec![route]);
    }

    routes.insert(
        Topic::new(Topic::DASHBOARD),
        vec![TopicRoute::invalidating(keys::dashboard())],
    );
    routes.insert(
        Topic::new(Topic::ACTIVITY),
        vec![TopicRoute {
            lists: vec![ListTarget {
                prefix: keys::activity_prefix(),
                order: SortOrder::desc("occurredAt"),
                bounds: ListBounds::LastPartLimit,
            }],
            ..TopicRoute::default()
        }],
    );
    routes.insert(
        Topic::new(Topic::SECURITY),
        vec![TopicRoute::invalidating(keys::security())],
    );

    routes
}

// =============================================================================
// Reconciler
// =============================================================================

/// What one event did to the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub patched: usize,
    pub invalidated: usize,
    pub absent: usize,
}

/// Applies push events to a [`QueryCache`].
#[derive(Clone)]
pub struct Reconciler {
    cache: QueryCache,
    routes: Arc<RwLock<HashMap<Topic, Vec<TopicRoute>>>>,
}

impl Reconciler {
    pub fn new(cache: QueryCache) -> Self {
        Self::with_routes(cache, default_routes())
    }

    pub fn with_routes(cache: QueryCache, routes: HashMap<Topic, Vec<TopicRoute>>) -> Self {
        Reconciler {
            cache,
            routes: Arc::new(RwLock::new(routes)),
        }
    }

    pub fn add_route(&self, topic: Topic, route: TopicRoute) {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic)
            .or_default()
            .push(route);
    }

    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    fn routes_for(&self, topic: &Topic) -> Vec<TopicRoute> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Runs the reconciler until the event queue closes.
    pub fn spawn(self, mut events: broadcast::Receiver<PushEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Reconciler started");
            loop {
                match events.recv().await {
                    Ok(event) => {
                        self.apply(&event);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Reconciler lagged behind push events, invalidating routed keys");
                        self.invalidate_all();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            info!("Reconciler stopped");
        })
    }

    /// Invalidates every prefix any route touches.
    pub fn invalidate_all(&self) -> usize {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner()).clone();
        routes
            .values()
            .flatten()
            .flat_map(|route| route.prefixes().cloned().collect::<Vec<_>>())
            .map(|prefix| self.cache.invalidate(&prefix))
            .sum()
    }

    /// Applies one event synchronously.
    pub fn apply(&self, event: &PushEvent) -> ApplyReport {
        self.apply_with(event, true)
    }

    /// Applies an event's list and entity edits without invalidating its
    /// related keys. Used for optimistic local writes.
    pub fn patch(&self, event: &PushEvent) -> ApplyReport {
        self.apply_with(event, false)
    }

    fn apply_with(&self, event: &PushEvent, related: bool) -> ApplyReport {
        let routes = self.routes_for(&event.topic);
        let mut report = ApplyReport::default();
        if routes.is_empty() {
            debug!(topic = %event.topic, "No route for push event");
            return report;
        }

        for route in &routes {
            let id = event.resolved_entity_id();
            match (event.kind, id, event.payload.as_ref()) {
                (EventKind::Insert | EventKind::Update, Some(id), Some(payload)) => {
                    self.upsert(route, &id, payload, &mut report);
                }
                (EventKind::Delete, Some(id), _) => self.remove(route, &id, &mut report),
                (EventKind::Invalidate, _, _) => {
                    self.invalidate_route(route, &mut report);
                    continue;
                }
                _ => {
                    debug!(topic = %event.topic, kind = ?event.kind, "Event without entity, invalidating");
                    self.invalidate_route(route, &mut report);
                    continue;
                }
            }
            if related {
                self.invalidate_related(route, &mut report);
            }
        }

        debug!(
            topic = %event.topic,
            kind = ?event.kind,
            patched = report.patched,
            invalidated = report.invalidated,
            absent = report.absent,
            "Applied push event"
        );
        report
    }

    fn invalidate_route(&self, route: &TopicRoute, report: &mut ApplyReport) {
        for prefix in route.prefixes() {
            report.invalidated += self.cache.invalidate(prefix);
        }
    }

    fn invalidate_related(&self, route: &TopicRoute, report: &mut ApplyReport) {
        for prefix in &route.related {
            report.invalidated += self.cache.invalidate(prefix);
        }
    }

    fn upsert(&self, route: &TopicRoute, id: &str, payload: &Value, report: &mut ApplyReport) {
        for list in &route.lists {
            for key in self.cache.keys_with_prefix(&list.prefix) {
                let placement = placement_for(list, &key);
                self.patch_list(&key, report, |items| {
                    upsert_item(items, id, payload, &list.order, placement)
                });
            }
        }

        if let Some(prefix) = &route.entity {
            let key = prefix.with(id);
            if self.cache.set_data(&key, |current| Some(merge_entity(current, payload))) {
                report.patched += 1;
            }
        }
    }

    fn remove(&self, route: &TopicRoute, id: &str, report: &mut ApplyReport) {
        for list in &route.lists {
            for key in self.cache.keys_with_prefix(&list.prefix) {
                self.patch_list(&key, report, |items| {
                    match items.iter().position(|item| has_id(item, id)) {
                        Some(pos) => {
                            items.remove(pos);
                            ListEdit::Changed(-1)
                        }
                        None => ListEdit::Unchanged,
                    }
                });
            }
        }

        if let Some(prefix) = &route.entity {
            if self.cache.mark_absent(&prefix.with(id)) {
                report.absent += 1;
            }
        }
    }

    /// Edits the item array of a list entry in place.
    ///
    /// Entries whose value is not a recognizable list, or whose edit asks
    /// for a refetch, are invalidated instead.
    fn patch_list<F>(&self, key: &CacheKey, report: &mut ApplyReport, edit: F)
    where
        F: FnOnce(&mut Vec<Value>) -> ListEdit,
    {
        let mut result = ListEdit::Refetch;
        self.cache.set_data(key, |current| {
            let mut next = current?.clone();
            let (outcome, changed) = edit_list(&mut next, edit);
            result = outcome;
            changed.then_some(next)
        });

        match result {
            ListEdit::Changed(_) => report.patched += 1,
            ListEdit::Unchanged => {}
            ListEdit::Refetch => report.invalidated += self.cache.invalidate(key),
        }
    }
}

// =============================================================================
// List Editing
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListEdit {
    /// Items changed; the number is the change in item count.
    Changed(i64),
    Unchanged,
    Refetch,
}

/// Where a new item may go in one particular list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Anywhere { limit: Option<usize> },
    /// Known items may be replaced; unseen ones force a refetch.
    ReplaceOnly,
    Refetch,
}

fn int_part(key: &CacheKey, index: usize) -> Option<i64> {
    match key.parts().get(index) {
        Some(KeyPart::Int(n)) => Some(*n),
        _ => None,
    }
}

fn placement_for(list: &ListTarget, key: &CacheKey) -> Placement {
    match list.bounds {
        ListBounds::Unbounded => Placement::Anywhere { limit: None },
        ListBounds::LastPartLimit => {
            let limit = match key.parts().last() {
                Some(KeyPart::Int(n)) if *n > 0 => Some(*n as usize),
                _ => None,
            };
            Placement::Anywhere { limit }
        }
        ListBounds::Paged => {
            let base = list.prefix.len();
            if key.len() <= base {
                return Placement::Anywhere { limit: None };
            }
            let filtered = key.parts()[base..].iter().skip(2).any(|part| match part {
                KeyPart::Str(s) => !s.is_empty(),
                _ => false,
            });
            if filtered {
                return Placement::Refetch;
            }
            let page = int_part(key, base).unwrap_or(1);
            let size = int_part(key, base + 1).filter(|n| *n > 0).map(|n| n as usize);
            if page <= 1 {
                Placement::Anywhere { limit: size }
            } else {
                Placement::ReplaceOnly
            }
        }
    }
}

/// Runs `edit` against the items of a list value.
///
/// Accepts a bare array or an object holding the array in `data` or
/// `items`; an object's numeric `total` follows the item count change.
fn edit_list<F>(list: &mut Value, edit: F) -> (ListEdit, bool)
where
    F: FnOnce(&mut Vec<Value>) -> ListEdit,
{
    let outcome = match list {
        Value::Array(items) => edit(items),
        Value::Object(obj) => {
            let field = ["data", "items"]
                .into_iter()
                .find(|f| obj.get(*f).map(Value::is_array).unwrap_or(false));
            let Some(field) = field else {
                return (ListEdit::Refetch, false);
            };
            let outcome = match obj.get_mut(field) {
                Some(Value::Array(items)) => edit(items),
                _ => ListEdit::Refetch,
            };
            if let ListEdit::Changed(delta) = outcome {
                if let Some(total) = obj.get("total").and_then(Value::as_i64) {
                    obj.insert("total".into(), Value::from((total + delta).max(0)));
                }
            }
            outcome
        }
        _ => ListEdit::Refetch,
    };
    let changed = matches!(outcome, ListEdit::Changed(_));
    (outcome, changed)
}

fn upsert_item(
    items: &mut Vec<Value>,
    id: &str,
    payload: &Value,
    order: &SortOrder,
    placement: Placement,
) -> ListEdit {
    if placement == Placement::Refetch {
        return ListEdit::Refetch;
    }

    let existing = items.iter().position(|item| has_id(item, id));
    let limit = match (existing, placement) {
        (None, Placement::ReplaceOnly) => return ListEdit::Refetch,
        (_, Placement::Anywhere { limit }) => limit,
        _ => None,
    };

    let (merged, delta) = match existing {
        Some(pos) => (merge_entity(Some(&items.remove(pos)), payload), 0),
        None => (merge_entity(None, payload), 1),
    };

    let pos = items
        .iter()
        .position(|item| precedes(&merged, item, order))
        .unwrap_or(items.len());
    items.insert(pos, merged);

    let mut delta = delta;
    if let Some(limit) = limit {
        if items.len() > limit {
            items.truncate(limit);
            // The inserted item may itself have fallen off the end.
            if existing.is_none() {
                delta = 0;
            }
        }
    }
    ListEdit::Changed(delta)
}

fn has_id(item: &Value, id: &str) -> bool {
    match item.get("id") {
        Some(Value::String(s)) => s == id,
        Some(Value::Number(n)) => n.to_string() == id,
        _ => false,
    }
}

/// Shallow merge of `payload` over `current`.
fn merge_entity(current: Option<&Value>, payload: &Value) -> Value {
    match (current, payload) {
        (Some(Value::Object(base)), Value::Object(patch)) => {
            let mut merged: Map<String, Value> = base.clone();
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => payload.clone(),
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// True if `a` belongs before `b` under `order`. Items without the sort
/// field sort last.
fn precedes(a: &Value, b: &Value, order: &SortOrder) -> bool {
    let field = order.field.as_str();
    match (a.get(field).filter(|v| !v.is_null()), b.get(field).filter(|v| !v.is_null())) {
        (Some(x), Some(y)) => {
            let cmp = compare_values(x, y);
            if order.descending {
                cmp == Ordering::Greater
            } else {
                cmp == Ordering::Less
            }
        }
        (Some(_), None) => true,
        _ => false,
    }
}
