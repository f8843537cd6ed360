//! Record filters
//!
//! Filters run per `(record, item)` in order and the first non-keep verdict
//! wins. An erroring filter drops the record for that item.

use crate::host::{record_host_key, HostCache, HostStatus};
use crate::record::DataRecord;
use crate::strategy::StrategyItem;
use crate::time::Clock;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    Keep,
    Drop,
    Error(String),
}

pub trait RecordFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, record: &DataRecord, item: &StrategyItem) -> FilterVerdict;
}

/// Drops points outside `[from, until]`. Without a window every point is kept.
#[derive(Debug, Clone, Default)]
pub struct RangeFilter {
    window: Option<(i64, i64)>,
}

impl RangeFilter {
    pub fn new(from: i64, until: i64) -> Self {
        Self {
            window: Some((from, until)),
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }
}

impl RecordFilter for RangeFilter {
    fn name(&self) -> &'static str {
        "range"
    }

    fn check(&self, record: &DataRecord, _item: &StrategyItem) -> FilterVerdict {
        match self.window {
            Some((from, until)) if record.time < from || record.time > until => FilterVerdict::Drop,
            _ => FilterVerdict::Keep,
        }
    }
}

/// Drops points older than the TTL of their data type
pub struct ExpireFilter {
    clock: Arc<dyn Clock>,
    time_series_ttl: i64,
    event_ttl: i64,
}

impl ExpireFilter {
    pub fn new(clock: Arc<dyn Clock>, time_series_ttl: i64, event_ttl: i64) -> Self {
        Self {
            clock,
            time_series_ttl,
            event_ttl,
        }
    }
}

impl RecordFilter for ExpireFilter {
    fn name(&self) -> &'static str {
        "expire"
    }

    fn check(&self, record: &DataRecord, item: &StrategyItem) -> FilterVerdict {
        let ttl = if item.item().is_time_series() {
            self.time_series_ttl
        } else {
            self.event_ttl
        };
        if self.clock.now() - record.time > ttl {
            FilterVerdict::Drop
        } else {
            FilterVerdict::Keep
        }
    }
}

/// Drops points of hosts currently known to be dead
pub struct HostStatusFilter {
    hosts: HostCache,
}

impl HostStatusFilter {
    pub fn new(hosts: HostCache) -> Self {
        Self { hosts }
    }
}

impl RecordFilter for HostStatusFilter {
    fn name(&self) -> &'static str {
        "host_status"
    }

    fn check(&self, record: &DataRecord, _item: &StrategyItem) -> FilterVerdict {
        match record_host_key(&record.dimensions) {
            Some(key) if self.hosts.status(&key) == HostStatus::Dead => FilterVerdict::Drop,
            _ => FilterVerdict::Keep,
        }
    }
}

/// Ordered filter pipeline
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn RecordFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: impl RecordFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    /// Range, expiry and host-status filters in their standard order
    pub fn standard(
        range: RangeFilter,
        clock: Arc<dyn Clock>,
        time_series_ttl: i64,
        event_ttl: i64,
        hosts: HostCache,
    ) -> Self {
        Self::new()
            .with(range)
            .with(ExpireFilter::new(clock, time_series_ttl, event_ttl))
            .with(HostStatusFilter::new(hosts))
    }

    fn verdict(&self, record: &DataRecord, item: &StrategyItem) -> FilterVerdict {
        for filter in &self.filters {
            match filter.check(record, item) {
                FilterVerdict::Keep => continue,
                FilterVerdict::Drop => {
                    debug!(
                        filter = filter.name(),
                        item_id = item.item_id(),
                        time = record.time,
                        "Record filtered"
                    );
                    return FilterVerdict::Drop;
                }
                FilterVerdict::Error(e) => {
                    warn!(filter = filter.name(), item_id = item.item_id(), "Filter error: {}", e);
                    return FilterVerdict::Error(e);
                }
            }
        }
        FilterVerdict::Keep
    }

    /// Mark `is_retains` for every item; returns whether any item kept the record
    pub fn apply(&self, record: &mut DataRecord) -> bool {
        let items = record.items.clone();
        let mut kept_any = false;
        for item in &items {
            let keep = self.verdict(record, item) == FilterVerdict::Keep;
            record.is_retains.insert(item.item_id(), keep);
            kept_any |= keep;
        }
        kept_any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::strategy::{
        DataSourceLabel, DataTypeLabel, Item, NoDataConfig, QueryConfig, Strategy,
    };
    use crate::time::FixedClock;
    use std::collections::BTreeMap;

    fn item(data_type_label: DataTypeLabel) -> Arc<StrategyItem> {
        let strategy = Arc::new(Strategy {
            id: 1,
            bk_biz_id: 2,
            name: String::new(),
            strategy_group_key: None,
            labels: vec![],
            priority: None,
            priority_group_key: None,
            noise_reduce_config: None,
            items: vec![Item {
                id: 11,
                name: String::new(),
                query_configs: vec![QueryConfig {
                    data_source_label: DataSourceLabel::BkMonitor,
                    data_type_label,
                    result_table_id: String::new(),
                    metric_field: "usage".into(),
                    agg_method: "AVG".into(),
                    agg_interval: 60,
                    agg_dimension: vec!["ip".into()],
                    agg_condition: vec![],
                }],
                no_data_config: NoDataConfig::default(),
                time_delay: 0,
                use_aiops_sdk: false,
                update_time: 0,
            }],
        });
        strategy.first_item().unwrap()
    }

    fn record(item: &Arc<StrategyItem>, time: i64, ip: &str) -> DataRecord {
        let mut dimensions = BTreeMap::new();
        dimensions.insert("ip".to_string(), ip.to_string());
        DataRecord::from_expanded(
            Arc::clone(item),
            crate::strategy::ExpandedPoint {
                time,
                metric_field: "usage".into(),
                value: Some(1.0),
                dimensions,
            },
        )
    }

    #[test]
    fn test_range_filter() {
        let item = item(DataTypeLabel::TimeSeries);
        let filter = RangeFilter::new(100, 200);
        assert_eq!(filter.check(&record(&item, 99, "a"), &item), FilterVerdict::Drop);
        assert_eq!(filter.check(&record(&item, 100, "a"), &item), FilterVerdict::Keep);
        assert_eq!(filter.check(&record(&item, 201, "a"), &item), FilterVerdict::Drop);
        assert_eq!(
            RangeFilter::unbounded().check(&record(&item, 1, "a"), &item),
            FilterVerdict::Keep
        );
    }

    #[test]
    fn test_expire_filter_by_data_type() {
        let clock = Arc::new(FixedClock::new(10_000));
        let filter = ExpireFilter::new(clock, 3600, 600);
        let ts = item(DataTypeLabel::TimeSeries);
        let event = item(DataTypeLabel::Event);
        assert_eq!(filter.check(&record(&ts, 9_000, "a"), &ts), FilterVerdict::Keep);
        assert_eq!(filter.check(&record(&event, 9_000, "a"), &event), FilterVerdict::Drop);
    }

    #[test]
    fn test_chain_marks_retains() {
        let hosts = HostCache::new();
        hosts.insert(Host {
            ip: "10.0.0.9".into(),
            bk_cloud_id: 0,
            bk_host_id: 1,
            bk_biz_id: 2,
            bk_set_ids: vec![],
            bk_module_ids: vec![],
            status: HostStatus::Dead,
        });
        let chain = FilterChain::standard(
            RangeFilter::unbounded(),
            Arc::new(FixedClock::new(1_000)),
            3600,
            600,
            hosts,
        );
        let item = item(DataTypeLabel::TimeSeries);

        let mut alive = record(&item, 900, "10.0.0.1");
        assert!(chain.apply(&mut alive));
        assert!(alive.is_pushable(11));

        let mut dead = record(&item, 900, "10.0.0.9");
        assert!(!chain.apply(&mut dead));
        assert!(!dead.is_pushable(11));
    }
}
