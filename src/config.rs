//! Service configuration structures
//!
//! Settings are read from an optional TOML file and then overridden by
//! environment variables. Only the keys listed in [`ENV_OVERRIDES`] are read
//! from the environment.

use crate::error::{AccessError, AccessResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Environment variables recognized as overrides
pub const ENV_OVERRIDES: &[&str] = &[
    "REDIS_URL",
    "NODE_ID",
    "ACCESS_DATA_BATCH_PROCESS_THRESHOLD",
    "ACCESS_DATA_BATCH_PROCESS_SIZE",
    "ACCESS_DATA_TIME_DELAY",
    "BKDATA_LOCAL_TIME_THRESHOLD",
    "BKDATA_LOCAL_TIMEZONE_OFFSET",
    "NUM_OF_COUNT_FREQ_ACCESS",
    "SQL_MAX_LIMIT",
    "METRIC_CACHE_TASK_PERIOD",
    "ACCESS_DATA_MAX_TIME_POINTS",
];

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessSettings {
    /// Application code, used in the consumer group id and registry path
    #[serde(default = "default_app_code")]
    pub app_code: String,

    /// Platform name used in the registry path
    #[serde(default = "default_platform")]
    pub platform: String,

    /// Deployment environment used in the registry path
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Cluster this node belongs to
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Business ids served by this cluster; empty means all
    #[serde(default)]
    pub cluster_biz_ids: Vec<i64>,

    /// Identity of this node; generated when absent
    #[serde(default)]
    pub node_id: Option<String>,

    /// Redis connection url
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Batch access settings
    #[serde(default)]
    pub access: AccessConfig,

    /// Real-time access settings
    #[serde(default)]
    pub real_time: RealTimeConfig,

    /// Kafka consumer settings
    #[serde(default)]
    pub kafka: KafkaConsumerConfig,
}

/// Settings of the pull/normalize/push pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Split a pull into shards when it has more points than this; 0 disables
    pub access_data_batch_process_threshold: usize,
    /// Points per shard
    pub access_data_batch_process_size: usize,
    /// Seconds "now" is shifted back before alignment
    pub access_data_time_delay: i64,
    /// BK-data freshness deferral window in seconds
    pub bkdata_local_time_threshold: i64,
    /// Hours added to BK-data `localTime` before comparing
    pub bkdata_local_timezone_offset: i64,
    /// Back-fill depth in aggregation intervals
    pub num_of_count_freq_access: i64,
    /// Detector soft limit; queues above ten times this reject pushes
    pub sql_max_limit: usize,
    /// Accepted for compatibility, not used by access
    pub metric_cache_task_period: u64,
    /// Time-series points older than this many seconds are dropped
    pub access_data_expire_seconds: i64,
    /// Event and log points older than this many seconds are dropped
    pub event_data_expire_seconds: i64,
    /// How long a parent waits for sub-task reports
    pub batch_result_timeout_secs: u64,
    /// Big-latency warning factor (multiplied by the interval)
    pub latency_interval_factor: i64,
    /// Big-latency warning constant in seconds
    pub latency_threshold_constant: i64,
    /// Unified query endpoint
    pub unify_query_url: String,
    /// Metadata API endpoint used for result-table storage lookups
    pub metadata_api_url: Option<String>,
    /// HTTP timeout for external queries
    pub query_timeout: Duration,
    /// Unique time points pushed per time-series pull; 0 disables the cap
    pub access_data_max_time_points: usize,
    /// Strategies whose partial query results are discarded
    pub double_check_strategy_ids: Vec<i64>,
    /// Consult the KV circuit breaking rules before each pull
    pub circuit_breaking: bool,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            access_data_batch_process_threshold: 500_000,
            access_data_batch_process_size: 50_000,
            access_data_time_delay: 10,
            bkdata_local_time_threshold: 60,
            bkdata_local_timezone_offset: 0,
            num_of_count_freq_access: 3,
            sql_max_limit: 50_000,
            metric_cache_task_period: 10,
            access_data_expire_seconds: 3600,
            event_data_expire_seconds: 600,
            batch_result_timeout_secs: 300,
            latency_interval_factor: 2,
            latency_threshold_constant: 180,
            unify_query_url: "http://127.0.0.1:10205/query/ts".to_string(),
            metadata_api_url: None,
            query_timeout: Duration::from_secs(60),
            access_data_max_time_points: 30,
            double_check_strategy_ids: vec![],
            circuit_breaking: true,
        }
    }
}

impl AccessConfig {
    /// Detector queue hard cap
    pub fn queue_hard_cap(&self) -> usize {
        self.sql_max_limit.saturating_mul(10)
    }
}

/// Real-time loops settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealTimeConfig {
    pub leader_ttl: Duration,
    pub election_retry_interval: Duration,
    pub leader_min_period: Duration,
    pub reconcile_interval: Duration,
    pub poll_timeout: Duration,
    pub poll_max_records: usize,
    pub idle_sleep: Duration,
    pub queue_capacity: usize,
    pub handler_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// TTL of a registry heartbeat; should outlive a couple of heartbeats
    pub heartbeat_ttl: Duration,
    pub strategy_cache_ttl: Duration,
    pub assignment_ttl: Duration,
    pub storage_info_ttl: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for RealTimeConfig {
    fn default() -> Self {
        Self {
            leader_ttl: Duration::from_secs(120),
            election_retry_interval: Duration::from_secs(30),
            leader_min_period: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(15),
            poll_timeout: Duration::from_millis(500),
            poll_max_records: 5000,
            idle_sleep: Duration::from_secs(1),
            queue_capacity: 100,
            handler_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_ttl: Duration::from_secs(45),
            strategy_cache_ttl: Duration::from_secs(60),
            assignment_ttl: Duration::from_secs(3600),
            storage_info_ttl: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConsumerConfig {
    /// Session timeout in milliseconds
    pub session_timeout_ms: u32,

    /// Maximum poll interval in milliseconds
    pub max_poll_interval_ms: u32,

    /// Enable auto-commit
    pub enable_auto_commit: bool,

    /// Auto-commit interval in milliseconds
    pub auto_commit_interval_ms: u32,

    /// Offset reset policy (earliest, latest, none)
    pub auto_offset_reset: String,

    /// Connection timeout for consumer creation and metadata calls
    pub connection_timeout: Duration,

    /// Additional Kafka properties
    pub kafka_properties: HashMap<String, String>,
}

impl Default for KafkaConsumerConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 30000,
            max_poll_interval_ms: 300000,
            enable_auto_commit: true,
            auto_commit_interval_ms: 5000,
            auto_offset_reset: "latest".to_string(),
            connection_timeout: Duration::from_secs(10),
            kafka_properties: HashMap::new(),
        }
    }
}

fn default_app_code() -> String {
    "bkmonitorv3".to_string()
}
fn default_platform() -> String {
    "community".to_string()
}
fn default_environment() -> String {
    "production".to_string()
}
fn default_cluster_name() -> String {
    "default".to_string()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

impl Default for AccessSettings {
    fn default() -> Self {
        Self {
            app_code: default_app_code(),
            platform: default_platform(),
            environment: default_environment(),
            cluster_name: default_cluster_name(),
            cluster_biz_ids: vec![],
            node_id: None,
            redis_url: default_redis_url(),
            access: AccessConfig::default(),
            real_time: RealTimeConfig::default(),
            kafka: KafkaConsumerConfig::default(),
        }
    }
}

impl AccessSettings {
    /// Create a new settings builder
    pub fn builder() -> AccessSettingsBuilder {
        AccessSettingsBuilder::new()
    }

    /// Load settings from an optional TOML file, then apply env overrides
    pub fn load(path: Option<&Path>) -> AccessResult<Self> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)
                    .map_err(|e| AccessError::Config(format!("{}: {}", path.display(), e)))?
            }
            None => Self::default(),
        };
        settings.apply_overrides(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply overrides from a lookup function (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> AccessResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for name in ENV_OVERRIDES {
            let Some(raw) = lookup(name) else { continue };
            let raw = raw.trim().to_string();
            let access = &mut self.access;
            match *name {
                "REDIS_URL" => self.redis_url = raw,
                "NODE_ID" => self.node_id = Some(raw),
                "ACCESS_DATA_BATCH_PROCESS_THRESHOLD" => {
                    access.access_data_batch_process_threshold = parse_env(name, &raw)?
                }
                "ACCESS_DATA_BATCH_PROCESS_SIZE" => {
                    access.access_data_batch_process_size = parse_env(name, &raw)?
                }
                "ACCESS_DATA_TIME_DELAY" => access.access_data_time_delay = parse_env(name, &raw)?,
                "BKDATA_LOCAL_TIME_THRESHOLD" => {
                    access.bkdata_local_time_threshold = parse_env(name, &raw)?
                }
                "BKDATA_LOCAL_TIMEZONE_OFFSET" => {
                    access.bkdata_local_timezone_offset = parse_env(name, &raw)?
                }
                "NUM_OF_COUNT_FREQ_ACCESS" => {
                    access.num_of_count_freq_access = parse_env(name, &raw)?
                }
                "SQL_MAX_LIMIT" => access.sql_max_limit = parse_env(name, &raw)?,
                "METRIC_CACHE_TASK_PERIOD" => {
                    access.metric_cache_task_period = parse_env(name, &raw)?
                }
                "ACCESS_DATA_MAX_TIME_POINTS" => {
                    access.access_data_max_time_points = parse_env(name, &raw)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Node identity, falling back to the host name and then a random id
    pub fn node_id(&self) -> String {
        self.node_id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// Kafka consumer group used by real-time consumers
    pub fn consumer_group_id(&self) -> String {
        format!("{}.real_time_access", self.app_code)
    }

    /// Whether a business belongs to this cluster
    pub fn cluster_matches_biz(&self, bk_biz_id: i64) -> bool {
        self.cluster_biz_ids.is_empty() || self.cluster_biz_ids.contains(&bk_biz_id)
    }

    /// Validate the configuration
    pub fn validate(&self) -> AccessResult<()> {
        let fail = |msg: &str| Err(AccessError::Config(msg.to_string()));

        if self.redis_url.is_empty() {
            return fail("Redis url cannot be empty");
        }
        if self.app_code.is_empty() {
            return fail("App code cannot be empty");
        }
        if self.access.access_data_batch_process_threshold > 0
            && self.access.access_data_batch_process_size == 0
        {
            return fail("Batch process size must be greater than 0 when batching is enabled");
        }
        if self.access.num_of_count_freq_access < 0 {
            return fail("Back-fill depth cannot be negative");
        }
        if self.access.sql_max_limit == 0 {
            return fail("SQL max limit must be greater than 0");
        }
        if self.real_time.queue_capacity == 0 {
            return fail("Work queue capacity must be greater than 0");
        }
        if self.real_time.poll_max_records == 0 {
            return fail("Poll max records must be greater than 0");
        }
        if self.real_time.heartbeat_ttl <= self.real_time.heartbeat_interval {
            return fail("Heartbeat TTL must exceed the heartbeat interval");
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> AccessResult<T> {
    raw.parse()
        .map_err(|_| AccessError::Config(format!("{} has an invalid value: {:?}", name, raw)))
}

/// Builder for AccessSettings
pub struct AccessSettingsBuilder {
    settings: AccessSettings,
}

impl AccessSettingsBuilder {
    /// Create a new settings builder
    pub fn new() -> Self {
        Self {
            settings: AccessSettings::default(),
        }
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.settings.redis_url = url.into();
        self
    }

    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.settings.node_id = Some(node_id.into());
        self
    }

    pub fn cluster_biz_ids(mut self, biz_ids: Vec<i64>) -> Self {
        self.settings.cluster_biz_ids = biz_ids;
        self
    }

    /// Set the split threshold and shard size
    pub fn batch_process(mut self, threshold: usize, size: usize) -> Self {
        self.settings.access.access_data_batch_process_threshold = threshold;
        self.settings.access.access_data_batch_process_size = size;
        self
    }

    pub fn time_delay(mut self, seconds: i64) -> Self {
        self.settings.access.access_data_time_delay = seconds;
        self
    }

    pub fn num_of_count_freq_access(mut self, n: i64) -> Self {
        self.settings.access.num_of_count_freq_access = n;
        self
    }

    pub fn sql_max_limit(mut self, limit: usize) -> Self {
        self.settings.access.sql_max_limit = limit;
        self
    }

    /// Set the BK-data freshness threshold and timezone offset
    pub fn bkdata_local_time(mut self, threshold: i64, timezone_offset: i64) -> Self {
        self.settings.access.bkdata_local_time_threshold = threshold;
        self.settings.access.bkdata_local_timezone_offset = timezone_offset;
        self
    }

    pub fn max_time_points(mut self, points: usize) -> Self {
        self.settings.access.access_data_max_time_points = points;
        self
    }

    pub fn double_check_strategy_ids(mut self, ids: Vec<i64>) -> Self {
        self.settings.access.double_check_strategy_ids = ids;
        self
    }

    pub fn batch_result_timeout(mut self, seconds: u64) -> Self {
        self.settings.access.batch_result_timeout_secs = seconds;
        self
    }

    pub fn real_time(mut self, real_time: RealTimeConfig) -> Self {
        self.settings.real_time = real_time;
        self
    }

    /// Add a custom Kafka property
    pub fn kafka_property(mut self, key: String, value: String) -> Self {
        self.settings.kafka.kafka_properties.insert(key, value);
        self
    }

    /// Build the settings
    pub fn build(self) -> AccessSettings {
        self.settings
    }
}

impl Default for AccessSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = AccessSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.access.queue_hard_cap(), 500_000);
        assert_eq!(settings.consumer_group_id(), "bkmonitorv3.real_time_access");
        assert_eq!(settings.real_time.queue_capacity, 100);
    }

    #[test]
    fn test_overrides() {
        let mut settings = AccessSettings::default();
        let env: HashMap<&str, &str> = [
            ("ACCESS_DATA_BATCH_PROCESS_THRESHOLD", "0"),
            ("SQL_MAX_LIMIT", " 10000 "),
            ("NODE_ID", "node-a"),
            ("ACCESS_DATA_MAX_TIME_POINTS", "5"),
        ]
        .into_iter()
        .collect();
        settings
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.access.access_data_batch_process_threshold, 0);
        assert_eq!(settings.access.sql_max_limit, 10_000);
        assert_eq!(settings.node_id(), "node-a");
        assert_eq!(settings.access.access_data_max_time_points, 5);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut settings = AccessSettings::default();
        let result = settings.apply_overrides(|name| {
            (name == "NUM_OF_COUNT_FREQ_ACCESS").then(|| "three".to_string())
        });
        assert!(matches!(result, Err(AccessError::Config(_))));
    }

    #[test]
    fn test_validation() {
        let settings = AccessSettings::builder().batch_process(10, 0).build();
        assert!(settings.validate().is_err());

        let settings = AccessSettings::builder().batch_process(0, 0).build();
        assert!(settings.validate().is_ok());

        let settings = AccessSettings::builder().redis_url("").build();
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
app_code = "monitor"
cluster_biz_ids = [2, 3]

[access]
access_data_batch_process_threshold = 2
access_data_batch_process_size = 2
access_data_time_delay = 30
bkdata_local_timezone_offset = 8
"#
        )
        .unwrap();

        let settings = AccessSettings::load(Some(file.path())).unwrap();
        assert_eq!(settings.app_code, "monitor");
        assert_eq!(settings.access.access_data_time_delay, 30);
        assert_eq!(settings.access.bkdata_local_timezone_offset, 8);
        assert!(settings.cluster_matches_biz(2));
        assert!(!settings.cluster_matches_biz(4));
    }
}
