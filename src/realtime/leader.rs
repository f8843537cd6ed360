//! Leader election and topic assignment

use super::assignment::{self, Distribution, TopicAssignment};
use super::kafka::ConsumerFactory;
use super::registry::NodeRegistry;
use super::storage::StorageResolver;
use crate::config::AccessSettings;
use crate::error::AccessResult;
use crate::keys;
use crate::kv::{KvStore, SharedKv};
use crate::strategy::{StrategyCache, StrategyId};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `broker|topic` -> (assignment, partition ids)
pub type TopicTable = BTreeMap<String, (TopicAssignment, Vec<i32>)>;

pub struct Leader {
    node_id: String,
    settings: Arc<AccessSettings>,
    kv: SharedKv,
    strategies: Arc<dyn StrategyCache>,
    storage: StorageResolver,
    kafka: Arc<dyn ConsumerFactory>,
    registry: NodeRegistry,
}

impl Leader {
    pub fn new(
        node_id: impl Into<String>,
        settings: Arc<AccessSettings>,
        kv: SharedKv,
        strategies: Arc<dyn StrategyCache>,
        storage: StorageResolver,
        kafka: Arc<dyn ConsumerFactory>,
        registry: NodeRegistry,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            settings,
            kv,
            strategies,
            storage,
            kafka,
            registry,
        }
    }

    /// Take or keep the leader lock
    pub async fn elect(&self) -> AccessResult<bool> {
        let ttl = self.settings.real_time.leader_ttl;
        if self.kv.set_nx_ex(keys::LEADER_KEY, &self.node_id, ttl).await? {
            info!(node_id = %self.node_id, "elected real-time access leader");
            return Ok(true);
        }
        let holder = self.kv.get(keys::LEADER_KEY).await?;
        if holder.as_deref() == Some(self.node_id.as_str()) {
            self.kv.expire(keys::LEADER_KEY, ttl).await?;
            return Ok(true);
        }
        debug!(node_id = %self.node_id, leader = ?holder, "not the leader");
        Ok(false)
    }

    /// Release the lock if this node still holds it
    pub async fn resign(&self) -> AccessResult<()> {
        if self.kv.get(keys::LEADER_KEY).await?.as_deref() == Some(self.node_id.as_str()) {
            self.kv.delete(keys::LEADER_KEY).await?;
            info!(node_id = %self.node_id, "resigned real-time access leader");
        }
        Ok(())
    }

    /// Every topic read by an enabled real-time strategy of this cluster.
    ///
    /// Tables are resolved concurrently. A table whose storage or partitions
    /// cannot be resolved is skipped for this cycle.
    pub async fn compute_assignment(&self) -> AccessResult<TopicTable> {
        let result_tables = self.strategies.get_real_time_data_strategy_ids().await?;
        let mut rt_ids: Vec<&String> = result_tables.keys().collect();
        rt_ids.sort();

        let wanted: Vec<(&String, BTreeSet<StrategyId>)> = rt_ids
            .into_iter()
            .map(|rt_id| {
                let strategy_ids = result_tables[rt_id]
                    .iter()
                    .filter(|(biz_id, _)| self.settings.cluster_matches_biz(**biz_id))
                    .flat_map(|(_, ids)| ids.iter().copied())
                    .collect();
                (rt_id, strategy_ids)
            })
            .filter(|(_, ids): &(&String, BTreeSet<StrategyId>)| !ids.is_empty())
            .collect();
        let resolved = join_all(wanted.iter().map(|(rt_id, _)| self.resolve_topic(rt_id))).await;

        let mut table = TopicTable::new();
        for ((rt_id, strategy_ids), topic) in wanted.into_iter().zip(resolved) {
            match topic {
                Ok(Some((topic_key, dimensions, partitions))) => {
                    let (entry, known) = table.entry(topic_key).or_default();
                    entry.strategy_ids.extend(strategy_ids);
                    entry.dimensions.extend(dimensions);
                    for partition in partitions {
                        if !known.contains(&partition) {
                            known.push(partition);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(result_table_id = %rt_id, "get real time result table info error: {}", e),
            }
        }
        Ok(table)
    }

    async fn resolve_topic(&self, rt_id: &str) -> AccessResult<Option<(String, BTreeSet<String>, Vec<i32>)>> {
        let Some(info) = self.storage.result_table(rt_id).await? else {
            debug!(result_table_id = rt_id, "result table not cached");
            return Ok(None);
        };
        let Some(storage) = self.storage.storage(rt_id, &info).await? else {
            return Ok(None);
        };
        let broker = storage.broker();
        let mut partitions = self.kafka.partitions(&broker, storage.topic()).await?;
        if partitions.is_empty() {
            partitions.push(0);
        }
        Ok(Some((
            assignment::topic_key(&broker, storage.topic()),
            info.dimensions(),
            partitions,
        )))
    }

    /// Hash partitions onto the live roster
    pub async fn distribute(&self, topics: &TopicTable) -> AccessResult<Distribution> {
        let roster = self.registry.roster().await?;
        if roster.is_empty() {
            warn!("registry roster is empty, nothing to assign");
        }
        Ok(assignment::distribute(&roster, topics))
    }

    /// Replace the assignment hash in one step
    pub async fn publish(&self, distribution: &Distribution) -> AccessResult<()> {
        let mut fields = Vec::with_capacity(distribution.rows.len());
        for (node, row) in &distribution.rows {
            fields.push((node.clone(), serde_json::to_string(row)?));
        }
        self.kv
            .replace_hash(
                keys::HOST_TOPIC_KEY,
                &fields,
                self.settings.real_time.assignment_ttl,
            )
            .await?;
        info!(
            nodes = fields.len(),
            partitions = distribution.owners.len(),
            "published real-time topic assignment"
        );
        Ok(())
    }

    /// One election attempt followed, when elected, by a full assignment cycle.
    /// Returns whether this node led the cycle.
    pub async fn run_once(&self) -> AccessResult<bool> {
        if !self.elect().await? {
            return Ok(false);
        }
        let topics = self.compute_assignment().await?;
        let distribution = self.distribute(&topics).await?;
        self.publish(&distribution).await?;
        Ok(true)
    }

    pub async fn run(&self, token: CancellationToken, once: bool) {
        let real_time = &self.settings.real_time;
        loop {
            let started = Instant::now();
            let led = match self.run_once().await {
                Ok(led) => led,
                Err(e) => {
                    e.log("real-time leader cycle");
                    false
                }
            };
            if once || token.is_cancelled() {
                break;
            }

            let pause = if led {
                real_time.leader_min_period.saturating_sub(started.elapsed())
            } else {
                real_time.election_retry_interval
            };
            if !sleep_or_cancel(&token, pause).await {
                break;
            }
        }

        if token.is_cancelled() {
            if let Err(e) = self.resign().await {
                warn!("failed to release leader lock: {}", e);
            }
        }
        info!("real_time leader get stop signal");
    }
}

/// Sleep for `pause`; false when cancelled first
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, pause: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(pause) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use crate::realtime::kafka::MemoryKafka;
    use crate::realtime::storage::StorageResolver;
    use crate::strategy::StaticStrategyCache;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Fixture {
        kv: SharedKv,
        kafka: MemoryKafka,
        strategies: Arc<StaticStrategyCache>,
        settings: Arc<AccessSettings>,
    }

    impl Fixture {
        async fn new(cluster_biz_ids: Vec<i64>) -> Self {
            let kv: SharedKv = Arc::new(MemoryStore::new());
            let table = json!({
                "storage_info": {
                    "cluster_config": {"domain_name": "kafka", "port": 9092},
                    "storage_config": {"topic": "t_cpu"}
                },
                "fields": [{"field_name": "ip", "is_dimension": true}]
            });
            kv.hset(keys::RESULT_TABLE_CACHE_KEY, "2_cpu", &table.to_string())
                .await
                .unwrap();
            let kafka = MemoryKafka::new();
            kafka.add_topic("kafka:9092", "t_cpu", 4);

            let strategies = Arc::new(StaticStrategyCache::new());
            strategies.register_real_time("2_cpu", 2, 10);
            strategies.register_real_time("2_cpu", 3, 11);
            strategies.register_real_time("2_unknown", 2, 12);

            let settings = Arc::new(
                AccessSettings::builder()
                    .cluster_biz_ids(cluster_biz_ids)
                    .build(),
            );
            Self {
                kv,
                kafka,
                strategies,
                settings,
            }
        }

        fn leader(&self, node_id: &str) -> Leader {
            Leader::new(
                node_id,
                Arc::clone(&self.settings),
                Arc::clone(&self.kv),
                self.strategies.clone(),
                StorageResolver::new(Arc::clone(&self.kv), None, Duration::from_secs(60)),
                Arc::new(self.kafka.clone()),
                NodeRegistry::new(Arc::clone(&self.kv), &self.settings),
            )
        }
    }

    #[tokio::test]
    async fn test_single_leader() {
        let fixture = Fixture::new(vec![]).await;
        let a = fixture.leader("a");
        let b = fixture.leader("b");
        assert!(a.elect().await.unwrap());
        assert!(a.elect().await.unwrap());
        assert!(!b.elect().await.unwrap());

        b.resign().await.unwrap();
        assert!(!b.elect().await.unwrap());
        a.resign().await.unwrap();
        assert!(b.elect().await.unwrap());
    }

    #[tokio::test]
    async fn test_compute_assignment_filters_cluster() {
        let fixture = Fixture::new(vec![2]).await;
        let table = fixture.leader("a").compute_assignment().await.unwrap();
        assert_eq!(table.len(), 1);
        let (assignment, partitions) = &table["kafka:9092|t_cpu"];
        assert_eq!(assignment.strategy_ids, BTreeSet::from([10]));
        assert_eq!(assignment.dimensions, BTreeSet::from(["ip".to_string()]));
        assert_eq!(partitions, &vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unreachable_broker_skips_topic() {
        let fixture = Fixture::new(vec![]).await;
        fixture.kafka.set_unreachable("kafka:9092", true);
        let table = fixture.leader("a").compute_assignment().await.unwrap();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_run_once_publishes_rows_for_roster() {
        let fixture = Fixture::new(vec![]).await;
        let leader = fixture.leader("a");
        let registry = NodeRegistry::new(Arc::clone(&fixture.kv), &fixture.settings);
        registry.heartbeat("a").await.unwrap();
        registry.heartbeat("b").await.unwrap();

        assert!(leader.run_once().await.unwrap());
        let rows = fixture.kv.hgetall(keys::HOST_TOPIC_KEY).await.unwrap();
        assert_eq!(rows.len(), 2);
        let assigned: usize = rows
            .values()
            .map(|raw| serde_json::from_str::<assignment::NodeAssignment>(raw).unwrap().len())
            .sum();
        assert!(assigned >= 1);
        assert!(fixture.kv.ttl(keys::HOST_TOPIC_KEY).await.unwrap().is_some());

        assert!(!fixture.leader("b").run_once().await.unwrap());
    }
}
