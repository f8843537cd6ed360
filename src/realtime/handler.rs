//! Turns queued Kafka batches into detector pushes

use super::assignment::{topic_key, NodeAssignment};
use super::consumer_manager::AssignmentView;
use super::poller::WorkItem;
use crate::error::AccessResult;
use crate::filter::{FilterChain, RangeFilter};
use crate::host::{HostCache, TopoNodeFuller};
use crate::metrics::AccessMetrics;
use crate::push::{DetectorPusher, PushOutcome};
use crate::record::{DataRecord, KafkaPayload};
use crate::strategy::CachedStrategies;
use crate::time::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Handler {
    rx: mpsc::Receiver<WorkItem>,
    assignment: AssignmentView,
    strategies: CachedStrategies,
    fuller: TopoNodeFuller,
    filters: FilterChain,
    pusher: DetectorPusher,
    metrics: Arc<AccessMetrics>,
    timeout: Duration,
}

impl Handler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<WorkItem>,
        assignment: AssignmentView,
        strategies: CachedStrategies,
        fuller: TopoNodeFuller,
        filters: FilterChain,
        pusher: DetectorPusher,
        metrics: Arc<AccessMetrics>,
        timeout: Duration,
    ) -> Self {
        Self {
            rx,
            assignment,
            strategies,
            fuller,
            filters,
            pusher,
            metrics,
            timeout,
        }
    }

    /// The real-time filter pipeline. Points arrive as they are produced, so
    /// the range check is open-ended.
    pub fn default_filters(
        clock: Arc<dyn Clock>,
        time_series_ttl: i64,
        event_ttl: i64,
        hosts: HostCache,
    ) -> FilterChain {
        FilterChain::standard(RangeFilter::unbounded(), clock, time_series_ttl, event_ttl, hosts)
    }

    /// Decode and fan out one batch into records, one per strategy and metric
    async fn flat(&mut self, item: &WorkItem, row: &NodeAssignment) -> Vec<DataRecord> {
        let mut records = Vec::new();
        for record in &item.records {
            let payload = match KafkaPayload::decode(&record.value) {
                Ok(payload) => payload,
                Err(e) => {
                    AccessMetrics::incr(&self.metrics.decode_errors);
                    warn!(broker = %item.broker, topic = %record.topic, "decode kafka record failed: {}", e);
                    continue;
                }
            };
            let bk_biz_id = payload.bk_biz_id();
            if bk_biz_id == 0 {
                continue;
            }
            let key = topic_key(&item.broker, &record.topic);
            let Some(topic) = row.get(&key) else {
                debug!(topic = %key, "record from unassigned topic");
                continue;
            };

            let flat = payload.flatten();
            let dimensions: Vec<String> = topic.dimensions.iter().cloned().collect();
            for strategy_id in &topic.strategy_ids {
                let Some(strategy) = self.strategies.get(*strategy_id).await else {
                    continue;
                };
                if strategy.bk_biz_id != bk_biz_id {
                    continue;
                }
                let Some(bound) = strategy.first_item() else {
                    continue;
                };
                records.extend(
                    bound
                        .item()
                        .expand(&flat, Some(dimensions.as_slice()))
                        .map(|point| DataRecord::from_expanded(Arc::clone(&bound), point)),
                );
            }
        }
        records
    }

    /// Run one batch through enrichment, filters and the push policy
    pub async fn handle(&mut self, item: WorkItem) -> AccessResult<PushOutcome> {
        let row = self.assignment.read().clone();
        let mut records = self.flat(&item, &row).await;
        AccessMetrics::add(&self.metrics.records_accessed, records.len());

        let mut filtered = 0;
        for record in records.iter_mut() {
            self.fuller.full(record);
            if !self.filters.apply(record) {
                filtered += 1;
            }
            record.clean();
        }
        AccessMetrics::add(&self.metrics.filtered, filtered);

        if records.is_empty() {
            return Ok(PushOutcome::default());
        }
        self.pusher.push(&records, true).await
    }

    async fn handle_logged(&mut self, item: WorkItem) {
        let broker = item.broker.clone();
        if let Err(e) = self.handle(item).await {
            e.log(&format!("real-time handler ({})", broker));
        }
    }

    /// Handle batches until cancelled, then drain what is already queued
    pub async fn run(mut self, token: CancellationToken, once: bool) {
        loop {
            match tokio::time::timeout(self.timeout, self.rx.recv()).await {
                Ok(Some(item)) => self.handle_logged(item).await,
                Ok(None) => break,
                Err(_) => {
                    if once {
                        break;
                    }
                }
            }
            if token.is_cancelled() || once {
                break;
            }
        }

        self.rx.close();
        let mut drained = 0;
        while let Ok(item) = self.rx.try_recv() {
            self.handle_logged(item).await;
            drained += 1;
        }
        info!(drained, "real_time handler get stop signal");
    }
}
