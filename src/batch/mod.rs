//! Batch access of one strategy group
//!
//! [`AccessDataProcess`] pulls the group's window from a data source, splits
//! big pulls into shards handed to [`AccessBatchDataProcess`] sub-tasks, pushes
//! its own shard and waits for the sub-task reports before re-persisting the
//! group checkpoint.

mod dispatch;
mod report;
mod shard;

pub use self::dispatch::{
    BatchWorkerPool, ChannelDispatcher, KvQueueDispatcher, SubTask, SubTaskDispatcher, TaskSource,
};
pub use self::report::{
    BatchReport, BatchSummary, ItemTotals, ProcessCounts, PullCounts, TotalPushData,
};
pub use self::shard::{decode_shard, encode_shard, parse_sub_task_id, split_points, sub_task_id};

use crate::checkpoint::Checkpoint;
use crate::circuit_breaking::{CircuitBreakingRules, ACCESS_DATA_MODULE};
use crate::config::AccessSettings;
use crate::datasource::{
    needs_local_time, take_local_times, DataSource, QueryOutput, QueryRequest,
};
use crate::duplicate::Duplicate;
use crate::error::{AccessError, AccessResult};
use crate::filter::{FilterChain, RangeFilter};
use crate::host::{HostCache, TopoNodeFuller};
use crate::keys;
use crate::kv::{KvStore, SharedKv};
use crate::metrics::AccessMetrics;
use crate::priority::PriorityChecker;
use crate::push::DetectorPusher;
use crate::record::{DataRecord, RawRecord};
use crate::strategy::{StrategyCache, StrategyItem};
use crate::time::{align_down, format_ts, Clock};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Collaborators shared by every batch process
pub struct AccessContext {
    pub settings: Arc<AccessSettings>,
    pub kv: SharedKv,
    pub strategies: Arc<dyn StrategyCache>,
    pub data_source: Arc<dyn DataSource>,
    pub clock: Arc<dyn Clock>,
    pub hosts: HostCache,
    pub metrics: Arc<AccessMetrics>,
    pub dispatcher: Arc<dyn SubTaskDispatcher>,
}

impl AccessContext {
    fn pusher(&self) -> DetectorPusher {
        DetectorPusher::new(
            Arc::clone(&self.kv),
            self.settings.access.queue_hard_cap(),
            Arc::clone(&self.metrics),
        )
    }
}

/// How a parent cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum AccessOutcome {
    /// The group has no items left in the strategy cache
    NoItems,
    /// Every item of the group is circuit broken; nothing was pulled
    CircuitBroken,
    /// `from > until`, nothing to pull yet
    EmptyWindow { from: i64, until: i64 },
    /// BK-data is still writing; `until` was stored for the next cycle
    Deferred { until: i64 },
    Processed(CycleReport),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub from: i64,
    pub until: i64,
    pub total_points: usize,
    pub batch_count: usize,
    /// Records pushed by this process and every reporting sub-task
    pub pushed: usize,
    pub checkpoint: Option<i64>,
    pub missing_sub_tasks: Vec<String>,
}

/// Steps shared by parents and sub-tasks of one group
struct GroupAccess {
    ctx: Arc<AccessContext>,
    strategy_group_key: String,
    items: Vec<Arc<StrategyItem>>,
    sub_task_id: Option<String>,
    process_counts: ProcessCounts,
    /// Last kept time when the time point cap cut the current pull
    last_time_point: Option<i64>,
}

impl GroupAccess {
    async fn load(
        ctx: Arc<AccessContext>,
        strategy_group_key: String,
        sub_task_id: Option<String>,
    ) -> AccessResult<Self> {
        let items = ctx.strategies.load_group_items(&strategy_group_key).await?;
        Ok(Self {
            ctx,
            strategy_group_key,
            items,
            sub_task_id,
            process_counts: ProcessCounts::default(),
            last_time_point: None,
        })
    }

    fn first_item(&self) -> AccessResult<&Arc<StrategyItem>> {
        self.items.first().ok_or_else(|| {
            AccessError::Internal(format!(
                "strategy group {} has no items",
                self.strategy_group_key
            ))
        })
    }

    fn interval(&self) -> i64 {
        self.items
            .first()
            .map(|i| i.item().agg_interval())
            .unwrap_or(60)
    }

    /// Oldest known modification time of the group's items
    fn min_update_time(&self) -> Option<i64> {
        self.items
            .iter()
            .map(|i| i.item().update_time)
            .filter(|t| *t > 0)
            .min()
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(
            Arc::clone(&self.ctx.kv),
            self.strategy_group_key.clone(),
            self.interval(),
        )
    }

    /// Build records from points, newest first, registering unseen ones with
    /// the duplicate oracle, then apply the time point cap. Returns the records
    /// and the newest non-duplicate time.
    async fn filter_duplicates(&mut self, points: &[RawRecord]) -> AccessResult<(Vec<DataRecord>, i64)> {
        let first = Arc::clone(self.first_item()?);
        let dup_ttl = Duration::from_secs((first.item().max_agg_interval().max(1) * 10) as u64);
        let mut duplicate = Duplicate::new(
            Arc::clone(&self.ctx.kv),
            self.strategy_group_key.clone(),
            dup_ttl,
        );
        let have_priority = self.items.iter().any(|i| i.strategy.has_priority());

        let mut records = Vec::with_capacity(points.len());
        let (mut duplicate_count, mut none_point_count) = (0, 0);
        let mut max_data_time = 0;
        for point in points.iter().rev() {
            let mut record = match DataRecord::from_point(&self.items, point) {
                Ok(record) => record,
                Err(e) => {
                    warn!(strategy_group_key = %self.strategy_group_key, "Dropping point: {}", e);
                    none_point_count += 1;
                    continue;
                }
            };
            if record.value.is_none() {
                none_point_count += 1;
                continue;
            }
            if duplicate.is_duplicate(&record).await? {
                duplicate_count += 1;
                if have_priority {
                    record.is_duplicate = true;
                    records.push(record);
                }
            } else {
                duplicate.add_record(&record).await?;
                max_data_time = max_data_time.max(record.time);
                records.push(record);
            }
        }
        self.last_time_point = self.limit_time_points(&mut records);
        if let Some(last_time_point) = self.last_time_point {
            // cut records must stay unseen so a later cycle pushes them
            duplicate.discard_after(last_time_point);
        }
        duplicate.refresh_cache().await?;

        let metrics = &self.ctx.metrics;
        AccessMetrics::add(&metrics.points_pulled, points.len());
        AccessMetrics::add(&metrics.records_accessed, records.len());
        AccessMetrics::add(&metrics.duplicates, duplicate_count);
        AccessMetrics::add(&metrics.none_points, none_point_count);

        let counts = PullCounts {
            total_count: points.len(),
            access_count: records.len(),
            duplicate_count,
            none_point_count,
        };
        for item in &self.items {
            self.process_counts.pull_data.insert(item.item_id(), counts);
        }
        Ok((records, max_data_time))
    }

    /// Enrich, filter and clean in place
    fn handle(&self, records: &mut [DataRecord], range: RangeFilter) {
        let access = &self.ctx.settings.access;
        let chain = FilterChain::standard(
            range,
            Arc::clone(&self.ctx.clock),
            access.access_data_expire_seconds,
            access.event_data_expire_seconds,
            self.ctx.hosts.clone(),
        );
        let fuller = TopoNodeFuller::new(self.ctx.hosts.clone());
        let mut filtered = 0;
        for record in records.iter_mut() {
            fuller.full(record);
            if !chain.apply(record) {
                filtered += 1;
            }
            record.clean();
        }
        AccessMetrics::add(&self.ctx.metrics.filtered, filtered);
    }

    /// Keep only the first `access_data_max_time_points` unique times of a
    /// time-series pull. Returns the last kept time when records were cut.
    fn limit_time_points(&self, records: &mut Vec<DataRecord>) -> Option<i64> {
        let max_points = self.ctx.settings.access.access_data_max_time_points;
        let time_series = self
            .items
            .first()
            .is_some_and(|i| i.item().is_time_series());
        if max_points == 0 || records.is_empty() || !time_series {
            return None;
        }
        let unique: BTreeSet<i64> = records.iter().map(|r| r.time).collect();
        if unique.len() <= max_points {
            return None;
        }
        let last_time_point = unique.iter().nth(max_points - 1).copied()?;
        let before = records.len();
        records.retain(|r| r.time <= last_time_point);
        AccessMetrics::incr(&self.ctx.metrics.time_point_limited);
        info!(
            strategy_group_key = %self.strategy_group_key,
            total = unique.len(),
            processed = max_points,
            last_time_point,
            "time points limited, records: {} -> {}",
            before,
            records.len()
        );
        Some(last_time_point)
    }

    /// Priority check, push and checkpoint; returns the stored checkpoint
    async fn push(&mut self, records: &mut [DataRecord]) -> AccessResult<i64> {
        let last_time_point = self.last_time_point.take();
        PriorityChecker::new(Arc::clone(&self.ctx.kv))
            .check_records(records)
            .await?;

        let outcome = self
            .ctx
            .pusher()
            .push(records, self.sub_task_id.is_none())
            .await?;
        self.process_counts.record_push(&outcome);

        let checkpoint = self.checkpoint();
        let current = checkpoint.current().await?.unwrap_or(0);
        let last_checkpoint = match last_time_point {
            Some(last) => last,
            None => records
                .iter()
                .map(|r| r.time)
                .max()
                .map_or(current, |newest| current.max(newest)),
        };
        let stored = if last_checkpoint > 0 {
            checkpoint.set(last_checkpoint).await?
        } else {
            current
        };

        let now = self.ctx.clock.now();
        self.ctx
            .kv
            .set(
                &keys::access_run_timestamp_key(&self.strategy_group_key),
                &now.to_string(),
                Some(keys::RUN_TIMESTAMP_TTL),
            )
            .await?;

        if self.sub_task_id.is_none() {
            info!(
                strategy_group_key = %self.strategy_group_key,
                last_checkpoint = %format_ts(stored),
                "process records({})",
                records.len()
            );
        } else {
            self.process_counts.total_push_data = TotalPushData {
                count: outcome.total_pushed(),
                last_checkpoint: stored,
            };
        }
        Ok(stored)
    }

    fn log_pull(&self, from: i64, until: i64) {
        let Some(counts) = self
            .items
            .first()
            .and_then(|i| self.process_counts.pull_data.get(&i.item_id()).copied())
        else {
            return;
        };
        for item in &self.items {
            info!(
                strategy_id = item.strategy_id(),
                item_id = item.item_id(),
                strategy_group_key = %self.strategy_group_key,
                total_records = counts.total_count,
                access_records = counts.access_count,
                duplicate = counts.duplicate_count,
                none_point_counts = counts.none_point_count,
                "time range({} - {})",
                format_ts(from),
                format_ts(until)
            );
        }
    }
}

/// Parent batch cycle of one strategy group
pub struct AccessDataProcess {
    ctx: Arc<AccessContext>,
    strategy_group_key: String,
}

impl AccessDataProcess {
    pub fn new(ctx: Arc<AccessContext>, strategy_group_key: impl Into<String>) -> Self {
        Self {
            ctx,
            strategy_group_key: strategy_group_key.into(),
        }
    }

    pub async fn process(&self) -> AccessResult<AccessOutcome> {
        let started = Instant::now();
        let result = self.run().await;
        self.ctx.metrics.record_cycle_duration(started.elapsed());
        if let Err(e) = &result {
            self.ctx.metrics.record_error(error_kind(e));
            e.log(&format!("strategy_group_key({}) access failed", self.strategy_group_key));
        }
        result
    }

    /// Pull window `(from, until)`, consuming a stored resume `until` if present
    async fn query_time_range(&self, group: &GroupAccess, now: i64) -> AccessResult<(i64, i64)> {
        let access = &self.ctx.settings.access;
        let first = group.first_item()?;
        let interval = group.interval();

        let time_delay = access.access_data_time_delay + first.item().extra_time_delay();
        let default_checkpoint = group
            .min_update_time()
            .unwrap_or_else(|| align_down(now - time_delay, interval));
        let checkpoint = group.checkpoint().get(default_checkpoint).await?;
        let from = checkpoint - access.num_of_count_freq_access * interval;

        let mut until = None;
        if first.item().is_bk_data() {
            let key = keys::access_end_time_key(&self.strategy_group_key);
            if let Some(raw) = self.ctx.kv.get(&key).await? {
                self.ctx.kv.delete(&key).await?;
                until = raw.trim().parse::<i64>().ok().filter(|u| *u > 0);
            }
        }
        let until = until.unwrap_or_else(|| align_down(now - time_delay, interval));
        Ok((from, until))
    }

    /// Store `until` when BK-data wrote a point too recently; returns whether deferred
    async fn defer_if_fresh(
        &self,
        group: &GroupAccess,
        points: &mut [RawRecord],
        now: i64,
        until: i64,
    ) -> AccessResult<bool> {
        let access = &self.ctx.settings.access;
        let local_times = take_local_times(points, access.bkdata_local_timezone_offset);
        let fresh = local_times
            .iter()
            .find(|(_, local)| now - local <= access.bkdata_local_time_threshold);
        let Some(&(point_time, local_time)) = fresh else {
            return Ok(false);
        };

        let ttl = keys::ttl_at_least(keys::END_TIME_TTL, group.interval(), 5);
        self.ctx
            .kv
            .set(
                &keys::access_end_time_key(&self.strategy_group_key),
                &until.to_string(),
                Some(ttl),
            )
            .await?;
        AccessMetrics::incr(&self.ctx.metrics.deferred_cycles);
        info!(
            strategy_group_key = %self.strategy_group_key,
            now,
            local_time,
            point_time,
            "skip access data because data local time is too close"
        );
        Ok(true)
    }

    /// Write shards 2.. and dispatch them; returns the in-process shard and the split size
    async fn send_batch_data(
        &self,
        shards: Vec<Vec<RawRecord>>,
        batch_timestamp: i64,
    ) -> AccessResult<(Vec<RawRecord>, usize)> {
        let batch_count = shards.len();
        let mut shards = shards.into_iter();
        let first = shards.next().unwrap_or_default();
        for (offset, shard) in shards.enumerate() {
            let id = sub_task_id(batch_timestamp, offset + 2);
            let key = keys::access_batch_data_key(&self.strategy_group_key, &id);
            self.ctx
                .kv
                .set(&key, &encode_shard(&shard)?, Some(keys::BATCH_DATA_TTL))
                .await?;
            let task = SubTask {
                strategy_group_key: self.strategy_group_key.clone(),
                sub_task_id: id.clone(),
            };
            if let Err(e) = self.ctx.dispatcher.dispatch(task).await {
                error!(
                    strategy_group_key = %self.strategy_group_key,
                    sub_task_id = %id,
                    "Failed to dispatch sub-task: {}", e
                );
            }
        }
        if batch_count > 1 {
            AccessMetrics::incr(&self.ctx.metrics.batch_splits);
            info!(
                strategy_group_key = %self.strategy_group_key,
                "split access data into {} batch tasks",
                batch_count
            );
        }
        Ok((first, batch_count))
    }

    /// Drop circuit broken items; returns whether any item is left to pull
    async fn apply_circuit_breaking(&self, group: &mut GroupAccess) -> bool {
        let rules = CircuitBreakingRules::load(&self.ctx.kv, ACCESS_DATA_MODULE).await;
        if rules.is_empty() {
            return true;
        }
        let total = group.items.len();
        let (broken, remaining): (Vec<_>, Vec<_>) = std::mem::take(&mut group.items)
            .into_iter()
            .partition(|i| rules.breaks_strategy(i.strategy_id(), &i.strategy.labels));
        group.items = remaining;
        if broken.is_empty() {
            return true;
        }

        for item in &broken {
            warn!(
                strategy_id = item.strategy_id(),
                item_id = item.item_id(),
                strategy_group_key = %self.strategy_group_key,
                "[circuit breaking] triggered before data pull"
            );
        }
        AccessMetrics::add(&self.ctx.metrics.circuit_broken, broken.len());
        info!(
            strategy_group_key = %self.strategy_group_key,
            filtered = broken.len(),
            total,
            remaining = group.items.len(),
            "[circuit breaking] applied before data pull"
        );
        !group.items.is_empty()
    }

    /// Points of a pull, discarding partial answers for double-checked strategies
    fn accept_points(&self, group: &GroupAccess, output: QueryOutput) -> Vec<RawRecord> {
        if !output.is_partial {
            return output.points;
        }
        let Some(first) = group.items.first() else {
            return output.points;
        };
        info!(
            strategy_group_key = %self.strategy_group_key,
            strategy_id = first.strategy_id(),
            points = output.points.len(),
            "query records is partial"
        );
        if self
            .ctx
            .settings
            .access
            .double_check_strategy_ids
            .contains(&first.strategy_id())
        {
            warn!(
                strategy_id = first.strategy_id(),
                "double check strategy is partial: skip query results"
            );
            return Vec::new();
        }
        output.points
    }

    fn observe_big_latency(&self, group: &GroupAccess, until: i64, max_data_time: i64) {
        let access = &self.ctx.settings.access;
        let interval = group.interval();
        let latency = until - max_data_time - interval;
        let threshold =
            interval * access.latency_interval_factor + access.latency_threshold_constant;
        if latency > threshold {
            if let Some(first) = group.items.first() {
                warn!(
                    strategy_id = first.strategy_id(),
                    "[data source delay] big latency {}", latency
                );
            }
        }
    }

    async fn run(&self) -> AccessResult<AccessOutcome> {
        let mut group =
            GroupAccess::load(Arc::clone(&self.ctx), self.strategy_group_key.clone(), None).await?;
        if group.items.is_empty() {
            return Ok(AccessOutcome::NoItems);
        }
        if self.ctx.settings.access.circuit_breaking
            && !self.apply_circuit_breaking(&mut group).await
        {
            info!(
                strategy_group_key = %self.strategy_group_key,
                "[circuit breaking] every strategy of the group is broken, skipping data query"
            );
            return Ok(AccessOutcome::CircuitBroken);
        }

        let now = self.ctx.clock.now();
        let (from, until) = self.query_time_range(&group, now).await?;
        if from > until {
            return Ok(AccessOutcome::EmptyWindow { from, until });
        }

        let first = Arc::clone(group.first_item()?);
        let include_local_time = needs_local_time(first.item());
        let request = QueryRequest {
            item: first.item(),
            from,
            until,
            include_local_time,
        };
        let mut points = match self.ctx.data_source.query(request).await {
            Ok(output) => self.accept_points(&group, output),
            Err(e) => {
                e.log(&format!(
                    "strategy_group_key({}) query records error",
                    self.strategy_group_key
                ));
                Vec::new()
            }
        };

        if include_local_time && self.defer_if_fresh(&group, &mut points, now, until).await? {
            return Ok(AccessOutcome::Deferred { until });
        }

        let total_points = points.len();
        let access = &self.ctx.settings.access;
        let shards = split_points(
            points,
            access.access_data_batch_process_threshold,
            access.access_data_batch_process_size,
        );
        let batch_timestamp = now;
        let (points, batch_count) = self.send_batch_data(shards, batch_timestamp).await?;
        if batch_count > 1 {
            group.sub_task_id = Some(sub_task_id(batch_timestamp, 1));
        }

        let mut report = CycleReport {
            from,
            until,
            total_points,
            batch_count,
            ..Default::default()
        };

        let own = self.process_own_shard(&mut group, &points, from, now, until).await;

        if batch_count <= 1 {
            let checkpoint = own?;
            group.log_pull(from, until);
            report.pushed = group
                .process_counts
                .push_data
                .values()
                .map(|p| p.count)
                .sum();
            report.checkpoint = checkpoint;
            return Ok(AccessOutcome::Processed(report));
        }

        let own_id = sub_task_id(batch_timestamp, 1);
        let own_report = match &own {
            Ok(_) => BatchReport::ok(own_id, group.process_counts.clone()),
            Err(e) => BatchReport::failed(own_id, e, group.process_counts.clone()),
        };
        let (reports, missing) = self
            .collect_reports(own_report, batch_timestamp, batch_count)
            .await;
        let summary = BatchSummary::aggregate(&reports);
        report.missing_sub_tasks = missing;
        report.pushed = summary.total_push_count;
        report.checkpoint = self.batch_log(&group, &summary, from, until).await?;
        own?;
        Ok(AccessOutcome::Processed(report))
    }

    async fn process_own_shard(
        &self,
        group: &mut GroupAccess,
        points: &[RawRecord],
        from: i64,
        now: i64,
        until: i64,
    ) -> AccessResult<Option<i64>> {
        let (mut records, max_data_time) = group.filter_duplicates(points).await?;
        if group.sub_task_id.is_none() && max_data_time > 0 {
            self.observe_big_latency(group, until, max_data_time);
        }
        if records.is_empty() {
            return Ok(None);
        }
        group.handle(&mut records, RangeFilter::new(from, now));
        Ok(Some(group.push(&mut records).await?))
    }

    /// Wait for sub-task reports until all arrived or the deadline passed
    async fn collect_reports(
        &self,
        own: BatchReport,
        batch_timestamp: i64,
        batch_count: usize,
    ) -> (Vec<BatchReport>, Vec<String>) {
        let result_key =
            keys::access_batch_data_result_key(&self.strategy_group_key, batch_timestamp);
        let deadline =
            Instant::now() + Duration::from_secs(self.ctx.settings.access.batch_result_timeout_secs);
        let mut reports = vec![own];
        while reports.len() < batch_count && Instant::now() < deadline {
            match self.ctx.kv.brpop(&result_key, Duration::from_secs(1)).await {
                Ok(Some(raw)) => match serde_json::from_str::<BatchReport>(&raw) {
                    Ok(report) => reports.push(report),
                    Err(e) => warn!(
                        strategy_group_key = %self.strategy_group_key,
                        "Undecodable batch report: {}", e
                    ),
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(strategy_group_key = %self.strategy_group_key, "Waiting for batch reports: {}", e);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }

        let missing: Vec<String> = (1..=batch_count)
            .map(|index| sub_task_id(batch_timestamp, index))
            .filter(|id| !reports.iter().any(|r| &r.sub_task_id == id))
            .collect();
        if !missing.is_empty() {
            AccessMetrics::add(&self.ctx.metrics.batch_timeouts, missing.len());
            error!(
                strategy_group_key = %self.strategy_group_key,
                expect_count = batch_count,
                actual_count = reports.len(),
                missing = ?missing,
                "get batch task result timeout"
            );
        }
        (reports, missing)
    }

    /// Log aggregated counts and re-persist the highest reported checkpoint
    async fn batch_log(
        &self,
        group: &GroupAccess,
        summary: &BatchSummary,
        from: i64,
        until: i64,
    ) -> AccessResult<Option<i64>> {
        for (sub_task, error) in &summary.failed {
            error!(
                strategy_group_key = %self.strategy_group_key,
                sub_task_id = %sub_task,
                "access batch task error({})", error
            );
        }
        for item in &group.items {
            let Some(totals) = summary.items.get(&item.item_id()) else {
                continue;
            };
            if totals.pull.total_count > 0 {
                info!(
                    strategy_id = item.strategy_id(),
                    item_id = item.item_id(),
                    strategy_group_key = %self.strategy_group_key,
                    total_records = totals.pull.total_count,
                    access_records = totals.pull.access_count,
                    duplicate = totals.pull.duplicate_count,
                    none_point_counts = totals.pull.none_point_count,
                    "time range({} - {})",
                    format_ts(from),
                    format_ts(until)
                );
            }
            if totals.push_count > 0 {
                info!(
                    output_key = totals.output_key.as_deref().unwrap_or_default(),
                    strategy_id = item.strategy_id(),
                    item_id = item.item_id(),
                    "push records({})",
                    totals.push_count
                );
            }
            if totals.noise_count > 0 {
                info!(
                    record_key = totals.record_key.as_deref().unwrap_or_default(),
                    dimension_key = totals.dimension_key.as_deref().unwrap_or_default(),
                    strategy_id = item.strategy_id(),
                    item_id = item.item_id(),
                    "push dimension records({})",
                    totals.noise_count
                );
            }
        }

        if summary.total_push_count == 0 && summary.last_checkpoint <= 0 {
            return Ok(None);
        }
        info!(
            strategy_group_key = %self.strategy_group_key,
            last_checkpoint = %format_ts(summary.last_checkpoint),
            "push records({})",
            summary.total_push_count
        );
        if summary.last_checkpoint > 0 {
            return Ok(Some(group.checkpoint().set(summary.last_checkpoint).await?));
        }
        Ok(group.checkpoint().current().await?)
    }
}

/// One shard of a split, run by a batch worker
pub struct AccessBatchDataProcess {
    ctx: Arc<AccessContext>,
    strategy_group_key: String,
    sub_task_id: String,
}

impl AccessBatchDataProcess {
    pub fn new(
        ctx: Arc<AccessContext>,
        strategy_group_key: impl Into<String>,
        sub_task_id: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            strategy_group_key: strategy_group_key.into(),
            sub_task_id: sub_task_id.into(),
        }
    }

    /// Run the shard and publish its report; the report is returned as well
    pub async fn process(&self) -> BatchReport {
        let (report, batch_timestamp) = match parse_sub_task_id(&self.sub_task_id) {
            Ok((timestamp, _)) => (self.run().await, Some(timestamp)),
            Err(e) => (
                BatchReport::failed(self.sub_task_id.clone(), e, ProcessCounts::default()),
                None,
            ),
        };
        if !report.result {
            error!(
                strategy_group_key = %self.strategy_group_key,
                sub_task_id = %self.sub_task_id,
                "access batch task failed: {}",
                report.error.as_deref().unwrap_or_default()
            );
        }
        if let Some(timestamp) = batch_timestamp {
            if let Err(e) = self.publish(&report, timestamp).await {
                e.log(&format!(
                    "strategy_group_key({}) sub task({}) report lost",
                    self.strategy_group_key, self.sub_task_id
                ));
            }
        }
        report
    }

    async fn run(&self) -> BatchReport {
        let mut group = match GroupAccess::load(
            Arc::clone(&self.ctx),
            self.strategy_group_key.clone(),
            Some(self.sub_task_id.clone()),
        )
        .await
        {
            Ok(group) => group,
            Err(e) => {
                return BatchReport::failed(self.sub_task_id.clone(), e, ProcessCounts::default())
            }
        };
        match self.run_group(&mut group).await {
            Ok(()) => BatchReport::ok(self.sub_task_id.clone(), group.process_counts),
            Err(e) => BatchReport::failed(self.sub_task_id.clone(), e, group.process_counts),
        }
    }

    async fn run_group(&self, group: &mut GroupAccess) -> AccessResult<()> {
        if group.items.is_empty() {
            return Err(AccessError::Internal(format!(
                "strategy group {} has no items",
                self.strategy_group_key
            )));
        }
        let points = self.pull().await?;
        let (mut records, _) = group.filter_duplicates(&points).await?;
        if records.is_empty() {
            return Ok(());
        }
        group.handle(&mut records, RangeFilter::unbounded());
        group.push(&mut records).await?;
        Ok(())
    }

    /// Read and delete the shard
    async fn pull(&self) -> AccessResult<Vec<RawRecord>> {
        let key = keys::access_batch_data_key(&self.strategy_group_key, &self.sub_task_id);
        let raw = self.ctx.kv.get(&key).await?;
        self.ctx.kv.delete(&key).await?;
        match raw {
            Some(encoded) => decode_shard(&encoded),
            None => {
                warn!(
                    strategy_group_key = %self.strategy_group_key,
                    sub_task_id = %self.sub_task_id,
                    "Shard already consumed or expired"
                );
                Ok(Vec::new())
            }
        }
    }

    async fn publish(&self, report: &BatchReport, batch_timestamp: i64) -> AccessResult<()> {
        let key = keys::access_batch_data_result_key(&self.strategy_group_key, batch_timestamp);
        self.ctx
            .kv
            .lpush(&key, &[serde_json::to_string(report)?])
            .await?;
        self.ctx.kv.expire(&key, keys::BATCH_RESULT_TTL).await?;
        Ok(())
    }
}

fn error_kind(error: &AccessError) -> &'static str {
    match error {
        AccessError::QueueOverflow { .. } => "queue_overflow",
        AccessError::DataSource(_) => "data_source",
        AccessError::Kv(_) | AccessError::KvType { .. } => "kv",
        _ => "other",
    }
}
