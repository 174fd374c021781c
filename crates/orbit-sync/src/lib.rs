//! # orbit-sync: Data Sync Layer for the Orbit Admin Dashboard
//!
//! Keeps the dashboard's view of the remote admin API fresh: a query cache
//! with stale-while-revalidate and polling, a WebSocket push channel that
//! patches the cache, and the stores and hooks the UI reads through.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncRuntime                                      │
//! │                                                                         │
//! │   Hooks ──────────┐        Stores ───────────┐                          │
//! │   (mount queries) │        (filters, writes) │                          │
//! │                   ▼                          ▼                          │
//! │            ┌──────────────────────────────────────┐                     │
//! │            │             QueryCache               │                     │
//! │            │  TTL • dedupe • SWR • polling • gc   │                     │
//! │            └──────▲──────────────────────┬────────┘                     │
//! │                   │ patch / invalidate   │ fetch                        │
//! │            ┌──────┴───────┐       ┌──────▼────────┐                     │
//! │            │  Reconciler  │       │   ApiClient   │──► remote admin API │
//! │            └──────▲───────┘       └───────────────┘                     │
//! │                   │ broadcast<PushEvent>                                │
//! │            ┌──────┴───────┐                                             │
//! │            │ PushChannel  │◄── WebSocket (token from ws_token_endpoint) │
//! │            │ refcounted   │                                             │
//! │            │ topics       │                                             │
//! │            └──────────────┘                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Cache & Queries
//! - [`cache`] - `QueryCache` with per-key dedupe, SWR, polling and gc
//! - [`keys`] - Cache key shapes and list queries
//! - [`queries`] - Key + fetcher + policy + topics per remote read
//! - [`hooks`] - Mounted queries for the UI
//! - [`stores`] - Domain stores with local state and mutations
//!
//! ### Push Channel
//! - [`channel`] - Refcounted push channel with reconnect supervisor
//! - [`transport`] - WebSocket connector and reconnect backoff
//! - [`protocol`] - Wire frames
//! - [`reconcile`] - Applies push events to the cache
//!
//! ### Plumbing
//! - [`client`] - Remote admin API client
//! - [`auth`] - Session and push token handling
//! - [`config`] - Store config and layered settings
//! - [`error`] - Sync error types
//! - [`runtime`] - `SyncRuntime` wiring everything together
//!
//! ## Usage
//!
//! ```rust,ignore
//! use orbit_sync::{SessionStore, SyncConfig, SyncRuntime};
//! use orbit_core::Period;
//!
//! let config = SyncConfig::load(None)?;
//! let mut runtime = SyncRuntime::new(config, SessionStore::with_token(token))?;
//! runtime.start();
//!
//! let mut kpis = runtime.hooks().use_dashboard_kpis(Period::Days30);
//! let kpis_now = kpis.resolve().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Cache & queries
pub mod cache;
pub mod hooks;
pub mod keys;
pub mod queries;
pub mod stores;

// Push channel
pub mod channel;
pub mod protocol;
pub mod reconcile;
pub mod transport;

// Plumbing
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth::{SessionStore, TokenInfo, TokenProvider, WsTokenClient};
pub use cache::{fetcher, CacheEntry, FetchOutcome, Fetcher, QueryCache, QuerySubscription};
pub use channel::{ChannelState, PushChannel, TopicSubscription};
pub use client::{AdminApi, ApiClient};
pub use config::{CacheSettings, ChannelSettings, HttpSettings, StoreConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use hooks::{Hooks, QueryState, UseQuery};
pub use keys::{ListQuery, ResourceKind};
pub use queries::QueryDef;
pub use reconcile::{Reconciler, TopicRoute};
pub use runtime::{Backend, RuntimeStatus, SyncRuntime};
pub use stores::{DashboardStore, ResourceStore, SecurityStore};
pub use transport::{Connector, WsConnector};
