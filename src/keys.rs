//! KV key templates and their default TTLs
//!
//! Every key the pipeline reads or writes is built here so that producers and
//! consumers agree on names.

use std::time::Duration;

pub const MINUTE: u64 = 60;
pub const HOUR: u64 = 60 * MINUTE;
pub const DAY: u64 = 24 * HOUR;

/// Leader lock, value is the node id
pub const LEADER_KEY: &str = "real-time-handler-leader";

/// Hash of node id -> topic assignment JSON
pub const HOST_TOPIC_KEY: &str = "real_time_host_topic";

/// Strategy ids that received data this cycle
pub const DATA_SIGNAL_KEY: &str = "access.data.signal";

/// Pending batch sub-tasks for the KV worker pool
pub const BATCH_TASK_QUEUE_KEY: &str = "access.data.batch.tasks";

/// Result-table info cache (field = result table id)
pub const RESULT_TABLE_CACHE_KEY: &str = "cache.result_table";

/// Strategy id -> strategy JSON
pub const STRATEGY_CACHE_KEY: &str = "cache.strategy";

/// Strategy group key -> `{strategy_id: [item_id, ...]}`
pub const STRATEGY_GROUP_CACHE_KEY: &str = "cache.strategy_group";

/// `{result_table_id: {bk_biz_id: [strategy_id, ...]}}`
pub const REAL_TIME_STRATEGY_IDS_KEY: &str = "cache.real_time_data_strategy_ids";

/// Host key (`ip|bk_cloud_id`) -> host JSON
pub const HOST_CACHE_KEY: &str = "cache.host";

pub const DATA_LIST_TTL: Duration = Duration::from_secs(30 * MINUTE);
pub const DATA_SIGNAL_TTL: Duration = Duration::from_secs(30 * MINUTE);
pub const NO_DATA_LIST_TTL: Duration = Duration::from_secs(10 * MINUTE);
pub const NOISE_REDUCE_TOTAL_TTL: Duration = Duration::from_secs(DAY);
pub const CHECKPOINT_TTL: Duration = Duration::from_secs(HOUR);
pub const RUN_TIMESTAMP_TTL: Duration = Duration::from_secs(HOUR);
pub const END_TIME_TTL: Duration = Duration::from_secs(5 * MINUTE);
pub const BATCH_DATA_TTL: Duration = Duration::from_secs(HOUR);
pub const BATCH_RESULT_TTL: Duration = Duration::from_secs(HOUR);
pub const PRIORITY_TTL: Duration = Duration::from_secs(30 * MINUTE);

/// Detector queue of one `(strategy, item)`
pub fn data_list_key(strategy_id: i64, item_id: i64) -> String {
    format!("access.data.{}.{}", strategy_id, item_id)
}

/// No-data detection queue of one `(strategy, item)`
pub fn no_data_list_key(strategy_id: i64, item_id: i64) -> String {
    format!("access.nodata.{}.{}", strategy_id, item_id)
}

pub fn data_signal_key() -> &'static str {
    DATA_SIGNAL_KEY
}

/// Sorted set of dimension fingerprint -> latest point time
pub fn noise_reduce_total_key(strategy_id: i64, dimension_hash: &str) -> String {
    format!("access.noise_reduce.total.{}.{}", strategy_id, dimension_hash)
}

pub fn checkpoint_key(strategy_group_key: &str) -> String {
    format!("checkpoint.strategy_group_{}", strategy_group_key)
}

pub fn access_run_timestamp_key(strategy_group_key: &str) -> String {
    format!("access.run.strategy_group_{}", strategy_group_key)
}

/// Operator circuit breaking rules of one module
pub fn circuit_breaking_key(module: &str) -> String {
    format!("circuit_breaking.{}", module)
}

/// Resume `until` for a deferred BK-data cycle
pub fn access_end_time_key(strategy_group_key: &str) -> String {
    format!("access.data.last_end_time.group_key_{}", strategy_group_key)
}

/// Set of record ids already seen at one timestamp
pub fn duplicate_key(strategy_group_key: &str, dt_event_time: i64) -> String {
    format!(
        "access.data.duplicate.strategy_group_{}.{}",
        strategy_group_key, dt_event_time
    )
}

/// Compressed shard of one sub-task
pub fn access_batch_data_key(strategy_group_key: &str, sub_task_id: &str) -> String {
    format!("access.data.batch.{}.{}", strategy_group_key, sub_task_id)
}

/// Report list shared by all sub-tasks of one split
pub fn access_batch_data_result_key(strategy_group_key: &str, timestamp: i64) -> String {
    format!(
        "access.data.batch.result.{}.{}",
        strategy_group_key, timestamp
    )
}

/// Hash of dimension hash -> `"priority:time"` for one priority group
pub fn priority_key(priority_group_key: &str) -> String {
    format!("access.priority.{}", priority_group_key)
}

/// Registry directory of one node class
pub fn registry_prefix(app: &str, platform: &str, env: &str, cluster: &str) -> String {
    format!(
        "nodes/{}_{}_{}_{}/run_access-real_time_data/",
        app, platform, env, cluster
    )
}

/// Registry heartbeat of one node
pub fn registry_node_key(prefix: &str, node_id: &str) -> String {
    format!("{}{}", prefix, node_id)
}

/// TTL that outlives `periods` aggregation intervals, never below `floor`
pub fn ttl_at_least(floor: Duration, interval: i64, periods: i64) -> Duration {
    let by_interval = interval.max(0).saturating_mul(periods.max(0)) as u64;
    floor.max(Duration::from_secs(by_interval))
}
