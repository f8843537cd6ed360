//! Metric access pipeline
//!
//! Pulls metric points for alerting strategies, normalizes them into detector
//! records and pushes them onto per `(strategy, item)` detector queues in a
//! shared KV store. Two paths share the same filter, dedup and push logic:
//!
//! - [`realtime`]: Kafka consumers sharded across a fleet of nodes by an
//!   elected leader with a consistent-hash ring
//! - [`batch`]: periodic pulls per strategy group with checkpoints, fanned out
//!   to sub-tasks when a pull is too big for one worker
//!
//! # Example
//!
//! ```no_run
//! use metric_access::batch::{AccessContext, AccessDataProcess, ChannelDispatcher};
//! use metric_access::datasource::UnifyQueryClient;
//! use metric_access::kv::{RedisStore, SharedKv};
//! use metric_access::strategy::KvStrategyCache;
//! use metric_access::{AccessMetrics, AccessSettings, HostCache, SystemClock};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let settings = Arc::new(AccessSettings::load(None)?);
//! let kv: SharedKv = Arc::new(RedisStore::connect(&settings.redis_url).await?);
//! let (dispatcher, _sub_tasks) = ChannelDispatcher::channel(16);
//! let ctx = Arc::new(AccessContext {
//!     settings: Arc::clone(&settings),
//!     kv: Arc::clone(&kv),
//!     strategies: Arc::new(KvStrategyCache::new(Arc::clone(&kv))),
//!     data_source: Arc::new(UnifyQueryClient::new(
//!         &settings.access.unify_query_url,
//!         settings.access.query_timeout,
//!     )?),
//!     clock: Arc::new(SystemClock),
//!     hosts: HostCache::new(),
//!     metrics: Arc::new(AccessMetrics::new()),
//!     dispatcher: Arc::new(dispatcher),
//! });
//! let outcome = AccessDataProcess::new(ctx, "group-key").process().await?;
//! tracing::info!(?outcome, "access cycle done");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod batch;
pub mod checkpoint;
pub mod circuit_breaking;
pub mod config;
pub mod datasource;
pub mod duplicate;
pub mod error;
pub mod filter;
pub mod host;
pub mod keys;
pub mod kv;
pub mod metrics;
pub mod priority;
pub mod push;
pub mod realtime;
pub mod record;
pub mod shutdown;
pub mod strategy;
pub mod time;

/// OpenTelemetry integration for distributed tracing
#[cfg(feature = "telemetry")]
pub mod telemetry;

pub use config::AccessSettings;
pub use error::{AccessError, AccessResult};
pub use host::HostCache;
pub use metrics::AccessMetrics;
pub use shutdown::ShutdownState;
pub use time::{Clock, SystemClock};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `RUST_LOG` when set, otherwise INFO (DEBUG with `debug`)
pub fn env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default))
}

/// Initialize the tracing subscriber with JSON output
pub fn init_tracing(debug: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(env_filter(debug))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
