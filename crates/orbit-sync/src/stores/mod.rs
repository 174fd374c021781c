//! # Domain Stores
//!
//! Stores pair cached reads with local state the cache does not hold:
//! filters, selection, pagination and pending optimistic writes.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Store Architecture                                   │
//! │                                                                         │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐       │
//! │  │ ResourceStore<T> │  │  DashboardStore  │  │  SecurityStore   │       │
//! │  │                  │  │                  │  │                  │       │
//! │  │ query, selection │  │ selected period  │  │ ip rule filter   │       │
//! │  │ pending writes   │  │                  │  │                  │       │
//! │  └────────┬─────────┘  └────────┬─────────┘  └────────┬─────────┘       │
//! │           └─────────────────────┼─────────────────────┘                 │
//! │                                 ▼                                       │
//! │                   QueryCache (shared Arc handle)                        │
//! │                                                                         │
//! │  Writes go to the remote API; on success only the affected list         │
//! │  prefix and entity key are invalidated.                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod dashboard;
mod resource;
mod security;

pub use dashboard::DashboardStore;
pub use resource::{MutationOp, PendingMutation, ResourceStore};
pub use security::SecurityStore;

use serde::de::DeserializeOwned;

use crate::cache::QueryCache;
use crate::error::{SyncError, SyncResult};
use crate::queries::QueryDef;

/// Resolves a query through the cache and decodes its value.
pub(crate) async fn resolve_def<T: DeserializeOwned>(
    cache: &QueryCache,
    def: QueryDef<T>,
) -> SyncResult<T> {
    let entry = cache.resolve(&def.key, def.fetcher, def.policy).await?;
    entry.data::<T>()?.ok_or_else(|| SyncError::NotFound {
        resource: "cache entry".into(),
        id: def.key.to_string(),
    })
}
