//! Alerting strategies as seen by access
//!
//! Strategies are owned elsewhere and reach this crate read-only through a
//! [`StrategyCache`]. A polling cycle works against an immutable snapshot: each
//! item is paired with its strategy in a [`StrategyItem`] so records can point
//! back at both without copying.

mod cache;

pub use self::cache::{CachedStrategies, KvStrategyCache, StaticStrategyCache, StrategyCache};

use crate::record::RawRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

pub type StrategyId = i64;
pub type ItemId = i64;

/// Where the data of a query comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceLabel {
    BkMonitor,
    BkData,
    BkLogSearch,
    Custom,
    Prometheus,
}

/// Shape of the data behind a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataTypeLabel {
    TimeSeries,
    Event,
    Log,
}

/// One query of an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    pub data_source_label: DataSourceLabel,
    pub data_type_label: DataTypeLabel,
    #[serde(default)]
    pub result_table_id: String,
    pub metric_field: String,
    #[serde(default = "default_agg_method")]
    pub agg_method: String,
    #[serde(default = "default_agg_interval")]
    pub agg_interval: i64,
    #[serde(default)]
    pub agg_dimension: Vec<String>,
    /// Filter predicates, passed to the data source untouched
    #[serde(default)]
    pub agg_condition: Vec<serde_json::Value>,
}

fn default_agg_method() -> String {
    "AVG".to_string()
}

fn default_agg_interval() -> i64 {
    60
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoDataConfig {
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub continuous: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoiseReduceConfig {
    #[serde(default)]
    pub is_enabled: bool,
    /// Dimension keys forming the fingerprint
    #[serde(default)]
    pub dimensions: Vec<String>,
}

impl NoiseReduceConfig {
    pub fn active(&self) -> bool {
        self.is_enabled && !self.dimensions.is_empty()
    }
}

/// One metric definition inside a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    #[serde(default)]
    pub name: String,
    pub query_configs: Vec<QueryConfig>,
    #[serde(default)]
    pub no_data_config: NoDataConfig,
    /// Extra seconds to hold back the pull window
    #[serde(default)]
    pub time_delay: i64,
    #[serde(default)]
    pub use_aiops_sdk: bool,
    /// Last modification; a group without a checkpoint starts from its oldest item
    #[serde(default)]
    pub update_time: i64,
}

/// A per-metric point produced by [`Item::expand`]
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedPoint {
    pub time: i64,
    pub metric_field: String,
    pub value: Option<f64>,
    pub dimensions: BTreeMap<String, String>,
}

impl Item {
    /// Smallest aggregation interval over all queries
    pub fn agg_interval(&self) -> i64 {
        self.query_configs
            .iter()
            .map(|q| q.agg_interval)
            .min()
            .unwrap_or_else(default_agg_interval)
    }

    pub fn max_agg_interval(&self) -> i64 {
        self.query_configs
            .iter()
            .map(|q| q.agg_interval)
            .max()
            .unwrap_or_else(default_agg_interval)
    }

    pub fn data_source_types(&self) -> HashSet<(DataSourceLabel, DataTypeLabel)> {
        self.query_configs
            .iter()
            .map(|q| (q.data_source_label, q.data_type_label))
            .collect()
    }

    pub fn is_bk_data(&self) -> bool {
        self.query_configs
            .iter()
            .any(|q| q.data_source_label == DataSourceLabel::BkData)
    }

    /// Whether every query is plain time series
    pub fn is_time_series(&self) -> bool {
        self.query_configs
            .iter()
            .all(|q| q.data_type_label == DataTypeLabel::TimeSeries)
    }

    /// Extra delay on top of the global access delay
    pub fn extra_time_delay(&self) -> i64 {
        if self.time_delay > 0 {
            self.time_delay
        } else if self
            .data_source_types()
            .contains(&(DataSourceLabel::BkLogSearch, DataTypeLabel::Log))
            || self.use_aiops_sdk
        {
            60
        } else {
            0
        }
    }

    /// Dimensions used to key records of this item
    pub fn agg_dimensions(&self) -> &[String] {
        self.query_configs
            .first()
            .map(|q| q.agg_dimension.as_slice())
            .unwrap_or_default()
    }

    /// Expand one flat record into zero or more per-metric points.
    ///
    /// `group_by` rebinds the aggregation dimensions for this call only; the
    /// item itself is left untouched.
    pub fn expand<'a>(
        &'a self,
        raw: &'a RawRecord,
        group_by: Option<&'a [String]>,
    ) -> impl Iterator<Item = ExpandedPoint> + 'a {
        let time = raw.time();
        self.query_configs.iter().filter_map(move |qc| {
            let time = time?;
            let value = raw.number(&qc.metric_field)?;
            let dims = group_by.unwrap_or(&qc.agg_dimension);
            Some(ExpandedPoint {
                time,
                metric_field: qc.metric_field.clone(),
                value: Some(value),
                dimensions: raw.dimensions(dims),
            })
        })
    }
}

/// A user-defined alerting strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: StrategyId,
    pub bk_biz_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub strategy_group_key: Option<String>,
    /// Free-form labels, matched by circuit breaking rules
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub priority_group_key: Option<String>,
    #[serde(default)]
    pub noise_reduce_config: Option<NoiseReduceConfig>,
    pub items: Vec<Item>,
}

impl Strategy {
    /// Pair every item with this strategy
    pub fn bind_items(self: &Arc<Self>) -> Vec<Arc<StrategyItem>> {
        (0..self.items.len())
            .map(|index| {
                Arc::new(StrategyItem {
                    strategy: Arc::clone(self),
                    index,
                })
            })
            .collect()
    }

    /// First item bound to this strategy
    pub fn first_item(self: &Arc<Self>) -> Option<Arc<StrategyItem>> {
        (!self.items.is_empty()).then(|| {
            Arc::new(StrategyItem {
                strategy: Arc::clone(self),
                index: 0,
            })
        })
    }

    pub fn has_priority(&self) -> bool {
        self.priority.is_some() && self.priority_group_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    pub fn noise_reduce(&self) -> Option<&NoiseReduceConfig> {
        self.noise_reduce_config.as_ref().filter(|c| c.active())
    }
}

/// An item together with the strategy that owns it
#[derive(Debug, Clone)]
pub struct StrategyItem {
    pub strategy: Arc<Strategy>,
    index: usize,
}

impl StrategyItem {
    pub fn item(&self) -> &Item {
        &self.strategy.items[self.index]
    }

    pub fn item_id(&self) -> ItemId {
        self.item().id
    }

    pub fn strategy_id(&self) -> StrategyId {
        self.strategy.id
    }
}
