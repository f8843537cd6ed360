//! Fixtures shared by the scenario tests: everything runs against the
//! in-process KV store, a fixed clock and scripted data sources.

#![allow(dead_code)]

use metric_access::batch::{AccessContext, ChannelDispatcher, SubTask};
use metric_access::datasource::StaticDataSource;
use metric_access::kv::{MemoryStore, SharedKv};
use metric_access::record::RawRecord;
use metric_access::strategy::{StaticStrategyCache, Strategy};
use metric_access::time::FixedClock;
use metric_access::{AccessMetrics, AccessSettings, HostCache};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const GROUP: &str = "group-1";

/// A one-item strategy of `GROUP`
pub fn strategy(id: i64, bk_biz_id: i64, source: &str, interval: i64, dims: &[&str]) -> Strategy {
    serde_json::from_value(json!({
        "id": id,
        "bk_biz_id": bk_biz_id,
        "name": format!("strategy {}", id),
        "strategy_group_key": GROUP,
        "items": [{
            "id": id * 10,
            "query_configs": [{
                "data_source_label": source,
                "data_type_label": "time_series",
                "result_table_id": "2_system_cpu",
                "metric_field": "usage",
                "agg_interval": interval,
                "agg_dimension": dims
            }]
        }]
    }))
    .unwrap()
}

/// Stamp every item of `strategy` with a modification time
pub fn updated_at(mut strategy: Strategy, update_time: i64) -> Strategy {
    for item in &mut strategy.items {
        item.update_time = update_time;
    }
    strategy
}

pub fn point(time: i64, value: f64, extra: Value) -> RawRecord {
    let mut raw = json!({"_time_": time, "_result_": value});
    if let (Some(map), Value::Object(extra)) = (raw.as_object_mut(), extra) {
        map.extend(extra);
    }
    serde_json::from_value(raw).unwrap()
}

/// Batch collaborators with handles kept for assertions
pub struct BatchHarness {
    pub kv: SharedKv,
    pub clock: FixedClock,
    pub strategies: StaticStrategyCache,
    pub source: Arc<StaticDataSource>,
    pub metrics: Arc<AccessMetrics>,
    pub sub_tasks: mpsc::Receiver<SubTask>,
    pub ctx: Arc<AccessContext>,
}

impl BatchHarness {
    pub fn new(settings: AccessSettings, now: i64) -> Self {
        let kv: SharedKv = Arc::new(MemoryStore::new());
        let clock = FixedClock::new(now);
        let strategies = StaticStrategyCache::new();
        let source = Arc::new(StaticDataSource::default());
        let metrics = Arc::new(AccessMetrics::new());
        let (dispatcher, sub_tasks) = ChannelDispatcher::channel(16);
        let ctx = Arc::new(AccessContext {
            settings: Arc::new(settings),
            kv: Arc::clone(&kv),
            strategies: Arc::new(strategies.clone()),
            data_source: source.clone(),
            clock: Arc::new(clock.clone()),
            hosts: HostCache::new(),
            metrics: Arc::clone(&metrics),
            dispatcher: Arc::new(dispatcher),
        });
        Self {
            kv,
            clock,
            strategies,
            source,
            metrics,
            sub_tasks,
            ctx,
        }
    }
}
