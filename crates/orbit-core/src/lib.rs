//! # orbit-core: Pure Types for the Orbit Admin Sync Layer
//!
//! The vocabulary shared by the query cache, the push channel and the
//! dashboard front-end. Nothing in here performs I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Orbit Admin Data Layer                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Dashboard UI (TypeScript)                       │   │
//! │  │   Stats cards ──► KPI cards ──► Activity feed ──► Security     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ hooks                                  │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │      orbit-sync: QueryCache, PushChannel, Stores, Hooks         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ orbit-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   query   │  │   push    │  │   types   │  │ validation│  │   │
//! │  │   │ CacheKey  │  │ PushEvent │  │ Dashboard │  │  limits   │  │   │
//! │  │   │ Policy    │  │ Topic     │  │ Security  │  │  ids, ip  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO TIMERS                               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`query`] - Cache keys, polling policies, entry status
//! - [`push`] - Push channel topics and events
//! - [`period`] - KPI/analytics reporting periods
//! - [`types`] - Remote API response shapes
//! - [`error`] - Domain error types and the cache error record
//! - [`validation`] - Input checks
//!
//! ## Example Usage
//!
//! ```rust
//! use orbit_core::{cache_key, Period};
//!
//! let a = cache_key!["dashboard", "kpis", Period::Days30];
//! let b = cache_key!["dashboard", "kpis", Period::Days7];
//! assert_ne!(a, b);
//! assert!(a.starts_with(&cache_key!["dashboard"]));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod period;
pub mod push;
pub mod query;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ErrorInfo, ErrorKind, ValidationError};
pub use period::Period;
pub use push::{EventKind, PushEvent, Topic};
pub use query::{CacheKey, KeyPart, PollingPolicy, QueryStatus};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Largest `limit` accepted by list widgets (recent orders, activity, events).
pub const MAX_LIST_LIMIT: u32 = 100;

/// Largest page size accepted by store list endpoints.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Default page size for store lists.
pub const DEFAULT_PAGE_SIZE: u32 = 25;
