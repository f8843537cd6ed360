use super::{ItemId, Strategy, StrategyId, StrategyItem};
use crate::error::AccessResult;
use crate::keys;
use crate::kv::{KvStore, SharedKv};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// `{result_table_id: {bk_biz_id: [strategy_id, ...]}}`
pub type RealTimeStrategyIds = HashMap<String, HashMap<i64, Vec<StrategyId>>>;

/// Read-only view over the strategy store
#[async_trait]
pub trait StrategyCache: Send + Sync {
    async fn get_strategy(&self, strategy_id: StrategyId) -> AccessResult<Option<Arc<Strategy>>>;

    /// Result tables consumed by enabled real-time strategies
    async fn get_real_time_data_strategy_ids(&self) -> AccessResult<RealTimeStrategyIds>;

    /// `{strategy_id: [item_id, ...]}` of one strategy group
    async fn get_strategy_group_detail(
        &self,
        strategy_group_key: &str,
    ) -> AccessResult<HashMap<StrategyId, Vec<ItemId>>>;

    /// Items of a group, ordered by strategy id then item id
    async fn load_group_items(&self, strategy_group_key: &str) -> AccessResult<Vec<Arc<StrategyItem>>> {
        let detail = self.get_strategy_group_detail(strategy_group_key).await?;
        let mut strategy_ids: Vec<_> = detail.keys().copied().collect();
        strategy_ids.sort_unstable();

        let mut items = Vec::new();
        for strategy_id in strategy_ids {
            let Some(strategy) = self.get_strategy(strategy_id).await? else {
                debug!(strategy_id, "strategy missing from cache, skipped");
                continue;
            };
            let wanted = &detail[&strategy_id];
            let mut bound: Vec<_> = strategy
                .bind_items()
                .into_iter()
                .filter(|i| wanted.contains(&i.item_id()))
                .collect();
            bound.sort_by_key(|i| i.item_id());
            items.extend(bound);
        }
        Ok(items)
    }
}

/// Strategy cache maintained in the shared KV store by the strategy service
pub struct KvStrategyCache {
    kv: SharedKv,
}

impl KvStrategyCache {
    pub fn new(kv: SharedKv) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl StrategyCache for KvStrategyCache {
    async fn get_strategy(&self, strategy_id: StrategyId) -> AccessResult<Option<Arc<Strategy>>> {
        let raw = self
            .kv
            .hget(keys::STRATEGY_CACHE_KEY, &strategy_id.to_string())
            .await?;
        match raw {
            Some(raw) => Ok(Some(Arc::new(serde_json::from_str(&raw)?))),
            None => Ok(None),
        }
    }

    async fn get_real_time_data_strategy_ids(&self) -> AccessResult<RealTimeStrategyIds> {
        match self.kv.get(keys::REAL_TIME_STRATEGY_IDS_KEY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(HashMap::new()),
        }
    }

    async fn get_strategy_group_detail(
        &self,
        strategy_group_key: &str,
    ) -> AccessResult<HashMap<StrategyId, Vec<ItemId>>> {
        match self
            .kv
            .hget(keys::STRATEGY_GROUP_CACHE_KEY, strategy_group_key)
            .await?
        {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(HashMap::new()),
        }
    }
}

#[derive(Default)]
struct StaticInner {
    strategies: HashMap<StrategyId, Arc<Strategy>>,
    real_time: RealTimeStrategyIds,
}

/// In-process strategy cache for tests and fixed deployments
#[derive(Default, Clone)]
pub struct StaticStrategyCache {
    inner: Arc<RwLock<StaticInner>>,
}

impl StaticStrategyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, strategy: Strategy) -> Arc<Strategy> {
        let strategy = Arc::new(strategy);
        self.inner
            .write()
            .strategies
            .insert(strategy.id, Arc::clone(&strategy));
        strategy
    }

    pub fn remove(&self, strategy_id: StrategyId) {
        self.inner.write().strategies.remove(&strategy_id);
    }

    /// Mark a strategy as consuming `result_table_id` in real time
    pub fn register_real_time(&self, result_table_id: &str, bk_biz_id: i64, strategy_id: StrategyId) {
        self.inner
            .write()
            .real_time
            .entry(result_table_id.to_string())
            .or_default()
            .entry(bk_biz_id)
            .or_default()
            .push(strategy_id);
    }
}

#[async_trait]
impl StrategyCache for StaticStrategyCache {
    async fn get_strategy(&self, strategy_id: StrategyId) -> AccessResult<Option<Arc<Strategy>>> {
        Ok(self.inner.read().strategies.get(&strategy_id).cloned())
    }

    async fn get_real_time_data_strategy_ids(&self) -> AccessResult<RealTimeStrategyIds> {
        Ok(self.inner.read().real_time.clone())
    }

    async fn get_strategy_group_detail(
        &self,
        strategy_group_key: &str,
    ) -> AccessResult<HashMap<StrategyId, Vec<ItemId>>> {
        let inner = self.inner.read();
        Ok(inner
            .strategies
            .values()
            .filter(|s| s.strategy_group_key.as_deref() == Some(strategy_group_key))
            .map(|s| (s.id, s.items.iter().map(|i| i.id).collect()))
            .collect())
    }
}

/// Handler-private strategy lookups with a per-entry TTL
pub struct CachedStrategies {
    source: Arc<dyn StrategyCache>,
    ttl: Duration,
    entries: HashMap<StrategyId, (Instant, Option<Arc<Strategy>>)>,
}

impl CachedStrategies {
    pub fn new(source: Arc<dyn StrategyCache>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Fetch a strategy, reloading it once its entry is older than the TTL
    pub async fn get(&mut self, strategy_id: StrategyId) -> Option<Arc<Strategy>> {
        if let Some((loaded_at, strategy)) = self.entries.get(&strategy_id) {
            if loaded_at.elapsed() <= self.ttl {
                return strategy.clone();
            }
        }

        let strategy = match self.source.get_strategy(strategy_id).await {
            Ok(strategy) => strategy,
            Err(e) => {
                warn!(strategy_id, "Failed to load strategy: {}", e);
                // keep serving the stale copy until the source recovers
                return self.entries.get(&strategy_id).and_then(|(_, s)| s.clone());
            }
        };
        self.entries
            .insert(strategy_id, (Instant::now(), strategy.clone()));
        strategy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
