//! Per strategy group watermark
//!
//! Writes never move the stored value backwards. The raw point time is stored;
//! reads align it down to the group's aggregation interval.

use crate::error::AccessResult;
use crate::keys;
use crate::kv::{KvStore, SharedKv};
use crate::time::align_down;
use std::time::Duration;
use tracing::debug;

pub struct Checkpoint {
    kv: SharedKv,
    strategy_group_key: String,
    interval: i64,
}

impl Checkpoint {
    pub fn new(kv: SharedKv, strategy_group_key: impl Into<String>, interval: i64) -> Self {
        Self {
            kv,
            strategy_group_key: strategy_group_key.into(),
            interval,
        }
    }

    fn key(&self) -> String {
        keys::checkpoint_key(&self.strategy_group_key)
    }

    fn ttl(&self) -> Duration {
        keys::ttl_at_least(keys::CHECKPOINT_TTL, self.interval, 5)
    }

    /// Stored checkpoint, if any
    pub async fn current(&self) -> AccessResult<Option<i64>> {
        let raw = self.kv.get(&self.key()).await?;
        Ok(raw.and_then(|v| v.trim().parse().ok()))
    }

    /// Stored checkpoint or `default`, aligned to the interval
    pub async fn get(&self, default: i64) -> AccessResult<i64> {
        let value = self.current().await?.unwrap_or(default);
        Ok(align_down(value, self.interval))
    }

    /// Max-merge `proposed` into the stored value; returns what is stored after the call
    pub async fn set(&self, proposed: i64) -> AccessResult<i64> {
        let current = self.current().await?.unwrap_or(0);
        let next = current.max(proposed);
        if next <= 0 {
            return Ok(current);
        }
        self.kv
            .set(&self.key(), &next.to_string(), Some(self.ttl()))
            .await?;
        debug!(
            strategy_group_key = %self.strategy_group_key,
            checkpoint = next,
            "Checkpoint stored"
        );
        Ok(next)
    }
}
