//! Wall-clock access and interval alignment

use parking_lot::Mutex;
use std::sync::Arc;

/// Source of "now" in epoch seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Manually driven clock
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: Arc<Mutex<i64>>,
}

impl FixedClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: i64) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, seconds: i64) {
        *self.now.lock() += seconds;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        *self.now.lock()
    }
}

/// Round `ts` down to a multiple of `interval`. Intervals <= 0 leave `ts` unchanged.
pub fn align_down(ts: i64, interval: i64) -> i64 {
    if interval <= 0 {
        return ts;
    }
    ts.div_euclid(interval) * interval
}

/// Format an epoch timestamp the way access logs print time ranges
pub fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
