//! Detector push policy shared by the real-time and batch paths

use crate::error::{AccessError, AccessResult};
use crate::keys;
use crate::kv::{KvStore, SharedKv};
use crate::metrics::AccessMetrics;
use crate::record::{fingerprint, DataRecord};
use crate::strategy::{ItemId, StrategyId, StrategyItem};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Records per LPUSH
pub const PUSH_CHUNK_SIZE: usize = 10_000;

/// Which queue family a push targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Data,
    NoData,
}

impl QueueKind {
    fn key(&self, strategy_id: StrategyId, item_id: ItemId) -> String {
        match self {
            QueueKind::Data => keys::data_list_key(strategy_id, item_id),
            QueueKind::NoData => keys::no_data_list_key(strategy_id, item_id),
        }
    }

    fn default_ttl(&self) -> Duration {
        match self {
            QueueKind::Data => keys::DATA_LIST_TTL,
            QueueKind::NoData => keys::NO_DATA_LIST_TTL,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushCount {
    pub output_key: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoisePushCount {
    pub record_key: String,
    pub dimension_key: String,
    pub count: usize,
}

/// What one push call wrote
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushOutcome {
    pub push_data: BTreeMap<ItemId, PushCount>,
    pub push_noise_data: BTreeMap<ItemId, NoisePushCount>,
    pub strategy_ids: BTreeSet<StrategyId>,
}

impl PushOutcome {
    pub fn total_pushed(&self) -> usize {
        self.push_data.values().map(|p| p.count).sum()
    }
}

/// Writes records into per `(strategy, item)` detector queues
pub struct DetectorPusher {
    kv: SharedKv,
    hard_cap: usize,
    metrics: Arc<AccessMetrics>,
}

impl DetectorPusher {
    pub fn new(kv: SharedKv, hard_cap: usize, metrics: Arc<AccessMetrics>) -> Self {
        Self {
            kv,
            hard_cap,
            metrics,
        }
    }

    /// Push every pushable record, grouped by item.
    ///
    /// A full detector queue aborts the whole push with
    /// [`AccessError::QueueOverflow`]. When `log_counts` is false the per-item
    /// log lines are skipped and the caller reports the returned counts instead.
    pub async fn push(&self, records: &[DataRecord], log_counts: bool) -> AccessResult<PushOutcome> {
        let records: Vec<&DataRecord> = records.iter().filter(|r| !r.is_duplicate).collect();

        let mut items: BTreeMap<ItemId, Arc<StrategyItem>> = BTreeMap::new();
        let mut pending: HashMap<ItemId, Vec<&DataRecord>> = HashMap::new();
        for record in &records {
            for item in &record.items {
                let item_id = item.item_id();
                items.entry(item_id).or_insert_with(|| Arc::clone(item));
                let queue = pending.entry(item_id).or_default();
                if record.is_pushable(item_id) {
                    queue.push(record);
                }
            }
        }

        let mut outcome = PushOutcome::default();
        for (item_id, item) in &items {
            let survivors = pending.remove(item_id).unwrap_or_default();
            if !survivors.is_empty() {
                outcome.strategy_ids.insert(item.strategy_id());

                let pushed = self
                    .push_item(item, &survivors, QueueKind::Data)
                    .await
                    .inspect_err(|e| {
                        if matches!(e, AccessError::QueueOverflow { .. }) {
                            AccessMetrics::incr(&self.metrics.queue_overflows);
                        }
                    })?;
                AccessMetrics::add(&self.metrics.records_pushed, pushed.count);
                if log_counts {
                    info!(
                        output_key = %pushed.output_key,
                        strategy_id = item.strategy_id(),
                        item_id,
                        "push records({})",
                        pushed.count
                    );
                }
                outcome.push_data.insert(*item_id, pushed);

                match self.push_noise_data(item, &survivors).await {
                    Ok(Some(noise)) => {
                        if log_counts {
                            info!(
                                record_key = %noise.record_key,
                                dimension_key = %noise.dimension_key,
                                strategy_id = item.strategy_id(),
                                item_id,
                                "push dimension records({})",
                                noise.count
                            );
                        }
                        outcome.push_noise_data.insert(*item_id, noise);
                    }
                    Ok(None) => {}
                    Err(e) => error!(
                        strategy_id = item.strategy_id(),
                        "push noise data error: {}", e
                    ),
                }
            }

            if item.item().no_data_config.is_enabled {
                let all: Vec<&DataRecord> = records
                    .iter()
                    .copied()
                    .filter(|r| r.items.iter().any(|i| i.item_id() == *item_id))
                    .collect();
                self.push_item(item, &all, QueueKind::NoData).await?;
            }
        }

        if !records.is_empty() {
            let signal = keys::data_signal_key();
            if !outcome.strategy_ids.is_empty() {
                let ids: Vec<String> = outcome.strategy_ids.iter().map(|id| id.to_string()).collect();
                self.kv.lpush(signal, &ids).await?;
            }
            self.kv.expire(signal, keys::DATA_SIGNAL_TTL).await?;
        }
        Ok(outcome)
    }

    /// Push one item's records in chunks, then extend the queue TTL
    async fn push_item(
        &self,
        item: &StrategyItem,
        records: &[&DataRecord],
        kind: QueueKind,
    ) -> AccessResult<PushCount> {
        let output_key = kind.key(item.strategy_id(), item.item_id());
        let length = self.kv.llen(&output_key).await?;
        if length >= self.hard_cap {
            let err = AccessError::QueueOverflow {
                key: output_key,
                length,
                limit: self.hard_cap,
            };
            err.log(&format!(
                "strategy({}), item({}) detector queue full, please check the detect process",
                item.strategy_id(),
                item.item_id()
            ));
            return Err(err);
        }

        for chunk in records.chunks(PUSH_CHUNK_SIZE) {
            let values = chunk
                .iter()
                .map(|r| serde_json::to_string(&r.to_detector_json(item)))
                .collect::<Result<Vec<_>, _>>()?;
            self.kv.lpush(&output_key, &values).await?;
        }
        let ttl = keys::ttl_at_least(kind.default_ttl(), item.item().agg_interval(), 5);
        self.kv.expire(&output_key, ttl).await?;

        Ok(PushCount {
            output_key,
            count: records.len(),
        })
    }

    /// Upsert dimension fingerprints of noise-reduced strategies
    async fn push_noise_data(
        &self,
        item: &StrategyItem,
        records: &[&DataRecord],
    ) -> AccessResult<Option<NoisePushCount>> {
        let Some(config) = item.strategy.noise_reduce() else {
            return Ok(None);
        };
        let dimension_hash = fingerprint(&config.dimensions);
        let record_key = keys::noise_reduce_total_key(item.strategy_id(), &dimension_hash);

        let mut latest: BTreeMap<String, i64> = BTreeMap::new();
        for record in records {
            let values: BTreeMap<&str, Option<&String>> = config
                .dimensions
                .iter()
                .map(|k| (k.as_str(), record.dimensions.get(k)))
                .collect();
            let hash = fingerprint(&values);
            let time = latest.entry(hash).or_insert(record.time);
            *time = (*time).max(record.time);
        }
        if latest.is_empty() {
            warn!(strategy_id = item.strategy_id(), "No noise dimensions to record");
            return Ok(None);
        }

        let members: Vec<(String, f64)> = latest.into_iter().map(|(h, t)| (h, t as f64)).collect();
        self.kv.zadd(&record_key, &members).await?;
        self.kv
            .expire(&record_key, keys::NOISE_REDUCE_TOTAL_TTL)
            .await?;

        Ok(Some(NoisePushCount {
            record_key,
            dimension_key: config.dimensions.join("|"),
            count: members.len(),
        }))
    }
}
