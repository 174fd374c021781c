//! # Orbit Probe
//!
//! Mounts the dashboard hooks against a live admin API and logs what the
//! sync layer does with them.
//!
//! ## Usage
//! ```text
//! ORBIT_API_BASE_URL=https://admin.example.com/api \
//! ORBIT_WS_ENDPOINT=ws ORBIT_WS_TOKEN_ENDPOINT=auth/ws-token \
//! ORBIT_SESSION_TOKEN=... orbit-probe [path/to/sync.toml]
//! ```
//!
//! - `ORBIT_PERIOD` - KPI period (`7d`, `30d`, `90d`, `12m`; default `30d`)
//! - `RUST_LOG` - log filter (default `info,orbit=debug`)

use std::fmt::Debug;
use std::path::PathBuf;
use std::time::Duration;

use orbit_core::Period;
use orbit_sync::{QueryState, SessionStore, SyncConfig, SyncRuntime};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const ACTIVITY_LIMIT: u32 = 20;
const STATUS_EVERY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SyncConfig::load(config_path)?;

    let session = match std::env::var("ORBIT_SESSION_TOKEN") {
        Ok(token) if !token.trim().is_empty() => SessionStore::with_token(token),
        _ => {
            warn!("ORBIT_SESSION_TOKEN not set, push channel will keep retrying");
            SessionStore::new()
        }
    };

    let period = match std::env::var("ORBIT_PERIOD") {
        Ok(p) => p.parse::<Period>()?,
        Err(_) => Period::default(),
    };

    let mut runtime = SyncRuntime::new(config, session)?;
    runtime.start();
    info!(api = %runtime.store_config().api_base_url(), %period, "Orbit probe started");

    let hooks = runtime.hooks();
    let mut stats = hooks.use_dashboard_stats();
    let mut kpis = hooks.use_dashboard_kpis(period);
    let mut activity = hooks.use_activity_feed(ACTIVITY_LIMIT)?;
    let mut channel = runtime.watch_channel();

    let mut status = interval_at(Instant::now() + STATUS_EVERY, STATUS_EVERY);
    status.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = stats.changed() => match changed {
                Ok(state) => report("dashboard stats", &state),
                Err(e) => { warn!(error = %e, "Stats hook closed"); break; }
            },
            changed = kpis.changed() => match changed {
                Ok(state) => report("kpis", &state),
                Err(e) => { warn!(error = %e, "KPI hook closed"); break; }
            },
            changed = activity.changed() => match changed {
                Ok(state) => report("activity", &state),
                Err(e) => { warn!(error = %e, "Activity hook closed"); break; }
            },
            changed = channel.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *channel.borrow_and_update();
                info!(%state, "Push channel state changed");
            }
            _ = status.tick() => {
                let s = runtime.status();
                info!(
                    channel = %s.channel_state,
                    topics = ?s.topics,
                    entries = s.cache_entries,
                    "Status"
                );
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "Ctrl-C handler failed");
                }
                info!("Ctrl-C received");
                break;
            }
        }
    }

    drop((stats, kpis, activity));
    runtime.shutdown();
    info!("Orbit probe stopped");
    Ok(())
}

fn report<T: Debug>(name: &str, state: &QueryState<T>) {
    match &state.error {
        Some(error) if state.data.is_some() => warn!(
            query = name,
            error = %error.message,
            "Refresh failed, serving last good value"
        ),
        Some(error) => warn!(query = name, error = %error.message, "Query failed"),
        None => info!(
            query = name,
            status = %state.status,
            fetching = state.is_fetching,
            stale = state.is_stale,
            "Query updated"
        ),
    }
    if let Some(data) = &state.data {
        debug!(query = name, ?data, "Query data");
    }
}

/// Installs the log subscriber.
///
/// `RUST_LOG` overrides the default `info,orbit=debug`.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,orbit=debug"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
