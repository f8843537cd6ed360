//! Access metrics collection

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process-wide access counters
#[derive(Debug, Clone)]
pub struct AccessMetrics {
    /// Points returned by data sources or flattened from Kafka
    pub points_pulled: Arc<AtomicU64>,
    /// Records accepted after dedup
    pub records_accessed: Arc<AtomicU64>,
    /// Records pushed to detector queues
    pub records_pushed: Arc<AtomicU64>,
    /// Duplicate points
    pub duplicates: Arc<AtomicU64>,
    /// Points without a value
    pub none_points: Arc<AtomicU64>,
    /// Records dropped by filters
    pub filtered: Arc<AtomicU64>,
    /// Kafka values that failed to decode
    pub decode_errors: Arc<AtomicU64>,
    /// Pushes rejected because a detector queue was full
    pub queue_overflows: Arc<AtomicU64>,
    /// Pulls split into shards
    pub batch_splits: Arc<AtomicU64>,
    /// Sub-task reports that never arrived
    pub batch_timeouts: Arc<AtomicU64>,
    /// Cycles deferred by BK-data freshness
    pub deferred_cycles: Arc<AtomicU64>,
    /// Items dropped by circuit breaking rules before a pull
    pub circuit_broken: Arc<AtomicU64>,
    /// Pushes cut short by the time point cap
    pub time_point_limited: Arc<AtomicU64>,
    /// Batch cycle durations
    cycle_durations: Arc<RwLock<Vec<Duration>>>,
    /// Error counts by type
    error_counts: Arc<RwLock<HashMap<String, u64>>>,
    /// Start time
    start_time: Instant,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub points_pulled: u64,
    pub records_accessed: u64,
    pub records_pushed: u64,
    pub duplicates: u64,
    pub none_points: u64,
    pub filtered: u64,
    pub decode_errors: u64,
    pub queue_overflows: u64,
    pub batch_splits: u64,
    pub batch_timeouts: u64,
    pub deferred_cycles: u64,
    pub circuit_broken: u64,
    pub time_point_limited: u64,
}

impl AccessMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            points_pulled: Arc::new(AtomicU64::new(0)),
            records_accessed: Arc::new(AtomicU64::new(0)),
            records_pushed: Arc::new(AtomicU64::new(0)),
            duplicates: Arc::new(AtomicU64::new(0)),
            none_points: Arc::new(AtomicU64::new(0)),
            filtered: Arc::new(AtomicU64::new(0)),
            decode_errors: Arc::new(AtomicU64::new(0)),
            queue_overflows: Arc::new(AtomicU64::new(0)),
            batch_splits: Arc::new(AtomicU64::new(0)),
            batch_timeouts: Arc::new(AtomicU64::new(0)),
            deferred_cycles: Arc::new(AtomicU64::new(0)),
            circuit_broken: Arc::new(AtomicU64::new(0)),
            time_point_limited: Arc::new(AtomicU64::new(0)),
            cycle_durations: Arc::new(RwLock::new(Vec::new())),
            error_counts: Arc::new(RwLock::new(HashMap::new())),
            start_time: Instant::now(),
        }
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch cycle duration
    pub fn record_cycle_duration(&self, duration: Duration) {
        let mut durations = self.cycle_durations.write();
        durations.push(duration);

        // Keep only last 1000 samples
        if durations.len() > 1000 {
            durations.remove(0);
        }
    }

    /// Record an error
    pub fn record_error(&self, error_type: &str) {
        let mut errors = self.error_counts.write();
        *errors.entry(error_type.to_string()).or_insert(0) += 1;
    }

    pub fn error_count(&self, error_type: &str) -> u64 {
        self.error_counts
            .read()
            .get(error_type)
            .copied()
            .unwrap_or(0)
    }

    /// Mean cycle duration over the retained samples
    pub fn mean_cycle_duration(&self) -> Option<Duration> {
        let durations = self.cycle_durations.read();
        if durations.is_empty() {
            return None;
        }
        let total: u128 = durations.iter().map(|d| d.as_nanos()).sum();
        Some(Duration::from_nanos(
            (total / durations.len() as u128) as u64,
        ))
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &Arc<AtomicU64>| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            points_pulled: load(&self.points_pulled),
            records_accessed: load(&self.records_accessed),
            records_pushed: load(&self.records_pushed),
            duplicates: load(&self.duplicates),
            none_points: load(&self.none_points),
            filtered: load(&self.filtered),
            decode_errors: load(&self.decode_errors),
            queue_overflows: load(&self.queue_overflows),
            batch_splits: load(&self.batch_splits),
            batch_timeouts: load(&self.batch_timeouts),
            deferred_cycles: load(&self.deferred_cycles),
            circuit_broken: load(&self.circuit_broken),
            time_point_limited: load(&self.time_point_limited),
        }
    }

    /// Export counters in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut output = String::new();
        output.push_str(
            "# HELP access_records_total Records seen by access\n\
             # TYPE access_records_total counter\n",
        );
        for (status, value) in [
            ("pulled", s.points_pulled),
            ("accessed", s.records_accessed),
            ("pushed", s.records_pushed),
            ("duplicate", s.duplicates),
            ("none_point", s.none_points),
            ("filtered", s.filtered),
            ("decode_error", s.decode_errors),
        ] {
            output.push_str(&format!(
                "access_records_total{{status=\"{}\"}} {}\n",
                status, value
            ));
        }
        output.push_str(&format!(
            "# HELP access_queue_overflow_total Pushes rejected by a full detector queue\n\
             # TYPE access_queue_overflow_total counter\n\
             access_queue_overflow_total {}\n",
            s.queue_overflows
        ));
        output.push_str(&format!(
            "# HELP access_batch_total Batch split events\n\
             # TYPE access_batch_total counter\n\
             access_batch_total{{event=\"split\"}} {}\n\
             access_batch_total{{event=\"timeout\"}} {}\n\
             access_batch_total{{event=\"deferred\"}} {}\n\
             access_batch_total{{event=\"time_point_limited\"}} {}\n",
            s.batch_splits, s.batch_timeouts, s.deferred_cycles, s.time_point_limited
        ));
        output.push_str(&format!(
            "# HELP access_circuit_broken_total Items skipped by circuit breaking\n\
             # TYPE access_circuit_broken_total counter\n\
             access_circuit_broken_total {}\n",
            s.circuit_broken
        ));
        for (error_type, count) in self.error_counts.read().iter() {
            output.push_str(&format!(
                "access_errors_total{{type=\"{}\"}} {}\n",
                error_type, count
            ));
        }
        output
    }
}

impl Default for AccessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = AccessMetrics::new();
        AccessMetrics::add(&metrics.points_pulled, 5);
        AccessMetrics::incr(&metrics.queue_overflows);
        metrics.record_error("decode");
        metrics.record_error("decode");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.points_pulled, 5);
        assert_eq!(snapshot.queue_overflows, 1);
        assert_eq!(metrics.error_count("decode"), 2);

        let text = metrics.export_prometheus();
        assert!(text.contains("access_records_total{status=\"pulled\"} 5"));
        assert!(text.contains("access_errors_total{type=\"decode\"} 2"));
    }

    #[test]
    fn test_mean_cycle_duration() {
        let metrics = AccessMetrics::new();
        assert!(metrics.mean_cycle_duration().is_none());
        metrics.record_cycle_duration(Duration::from_millis(10));
        metrics.record_cycle_duration(Duration::from_millis(30));
        assert_eq!(
            metrics.mean_cycle_duration(),
            Some(Duration::from_millis(20))
        );
    }
}
