//! Real-time access from Kafka
//!
//! A node runs four loops that share state only through the KV store, the
//! consumer set and a bounded work queue:
//!
//! - [`Leader`]: elects one node per cluster and publishes topic assignments
//! - [`ConsumerManager`]: reconciles local consumers with this node's row
//! - [`Poller`]: polls every consumer and feeds the work queue
//! - [`Handler`]: fans records out per strategy and pushes them to detectors
//!
//! [`RealTimeAccess`] wires them together and heartbeats the node registry.

pub mod assignment;
pub mod consumer_manager;
pub mod handler;
pub mod hashring;
pub mod kafka;
pub mod leader;
pub mod poller;
pub mod registry;
pub mod storage;

pub use self::consumer_manager::{AssignmentView, ConsumerManager, ConsumerSet};
pub use self::handler::Handler;
pub use self::kafka::{ConsumerFactory, KafkaRecord, MemoryKafka, TopicConsumer};
pub use self::leader::Leader;
pub use self::poller::{work_queue, Poller, WorkItem};
pub use self::registry::NodeRegistry;
pub use self::storage::{MetadataClient, StorageApi, StorageResolver};

use self::leader::sleep_or_cancel;
use crate::config::AccessSettings;
use crate::error::AccessResult;
use crate::host::{HostCache, TopoNodeFuller};
use crate::kv::SharedKv;
use crate::metrics::AccessMetrics;
use crate::push::DetectorPusher;
use crate::shutdown::{join_with_timeout, ShutdownState};
use crate::strategy::{CachedStrategies, StrategyCache};
use crate::time::Clock;
use std::sync::Arc;
use tracing::{info, warn};

/// Collaborators of one real-time node
pub struct RealTimeContext {
    pub settings: Arc<AccessSettings>,
    pub kv: SharedKv,
    pub strategies: Arc<dyn StrategyCache>,
    pub kafka: Arc<dyn ConsumerFactory>,
    pub storage_api: Option<Box<dyn StorageApi>>,
    pub clock: Arc<dyn Clock>,
    pub hosts: HostCache,
    pub metrics: Arc<AccessMetrics>,
}

/// The four loops of one node plus the registry heartbeat
pub struct RealTimeAccess {
    node_id: String,
    settings: Arc<AccessSettings>,
    kv: SharedKv,
    hosts: HostCache,
    registry: NodeRegistry,
    consumers: ConsumerSet,
    leader: Leader,
    manager: ConsumerManager,
    poller: Poller,
    handler: Handler,
}

impl RealTimeAccess {
    pub fn new(ctx: RealTimeContext) -> Self {
        let settings = ctx.settings;
        let real_time = &settings.real_time;
        let access = &settings.access;
        let node_id = settings.node_id();

        let registry = NodeRegistry::new(Arc::clone(&ctx.kv), &settings);
        let consumers = ConsumerSet::default();
        let assignment = AssignmentView::default();
        let (tx, rx) = work_queue(real_time.queue_capacity);

        let leader = Leader::new(
            node_id.clone(),
            Arc::clone(&settings),
            Arc::clone(&ctx.kv),
            Arc::clone(&ctx.strategies),
            StorageResolver::new(Arc::clone(&ctx.kv), ctx.storage_api, real_time.storage_info_ttl),
            Arc::clone(&ctx.kafka),
            registry.clone(),
        );
        let manager = ConsumerManager::new(
            node_id.clone(),
            settings.consumer_group_id(),
            Arc::clone(&ctx.kv),
            ctx.kafka,
            Arc::clone(&consumers),
            Arc::clone(&assignment),
            real_time.reconcile_interval,
        );
        let poller = Poller::new(
            Arc::clone(&consumers),
            tx,
            real_time.poll_timeout,
            real_time.poll_max_records,
            real_time.idle_sleep,
            Arc::clone(&ctx.metrics),
        );
        let handler = Handler::new(
            rx,
            assignment,
            CachedStrategies::new(ctx.strategies, real_time.strategy_cache_ttl),
            TopoNodeFuller::new(ctx.hosts.clone()),
            Handler::default_filters(
                ctx.clock,
                access.access_data_expire_seconds,
                access.event_data_expire_seconds,
                ctx.hosts.clone(),
            ),
            DetectorPusher::new(
                Arc::clone(&ctx.kv),
                access.queue_hard_cap(),
                Arc::clone(&ctx.metrics),
            ),
            ctx.metrics,
            real_time.handler_timeout,
        );

        Self {
            node_id,
            kv: ctx.kv,
            hosts: ctx.hosts,
            registry,
            consumers,
            leader,
            manager,
            poller,
            handler,
            settings,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Shared consumer set, for inspection
    pub fn consumers(&self) -> ConsumerSet {
        Arc::clone(&self.consumers)
    }

    /// Run every loop once, in pipeline order
    pub async fn run_once(self, shutdown: &ShutdownState) -> AccessResult<()> {
        let token = shutdown.token();
        heartbeat(&self.registry, &self.node_id, &self.hosts, &self.kv).await;
        self.leader.run(token.clone(), true).await;
        self.manager.run(token.clone(), true).await;
        self.poller.run(token.clone(), true).await;
        self.handler.run(token, true).await;
        self.manager.close_all().await;
        Ok(())
    }

    /// Run until `shutdown` is triggered, then stop every loop
    pub async fn run(self, shutdown: Arc<ShutdownState>) -> AccessResult<()> {
        let token = shutdown.token();
        let Self {
            node_id,
            settings,
            kv,
            hosts,
            registry,
            leader,
            manager,
            poller,
            handler,
            ..
        } = self;
        info!(node_id = %node_id, "real-time access starting");

        heartbeat(&registry, &node_id, &hosts, &kv).await;

        let tasks = vec![
            ("leader", {
                let token = token.clone();
                tokio::spawn(async move { leader.run(token, false).await })
            }),
            ("consumer_manager", {
                let token = token.clone();
                tokio::spawn(async move { manager.run(token, false).await })
            }),
            ("poller", {
                let token = token.clone();
                tokio::spawn(async move { poller.run(token, false).await })
            }),
            ("handler", {
                let token = token.clone();
                tokio::spawn(async move { handler.run(token, false).await })
            }),
        ];

        let real_time = &settings.real_time;
        while sleep_or_cancel(&token, real_time.heartbeat_interval).await {
            heartbeat(&registry, &node_id, &hosts, &kv).await;
        }

        info!(node_id = %node_id, "real-time access stopping");
        join_with_timeout(tasks, real_time.shutdown_timeout).await;
        if let Err(e) = registry.deregister(&node_id).await {
            warn!(node_id = %node_id, "registry deregister failed: {}", e);
        }
        Ok(())
    }
}

/// Registry heartbeat plus a host cache refresh, both best effort
async fn heartbeat(registry: &NodeRegistry, node_id: &str, hosts: &HostCache, kv: &SharedKv) {
    if let Err(e) = registry.heartbeat(node_id).await {
        warn!(node_id, "registry heartbeat failed: {}", e);
    }
    if let Err(e) = hosts.refresh(kv).await {
        warn!("host cache refresh failed: {}", e);
    }
}
