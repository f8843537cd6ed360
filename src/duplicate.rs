//! Duplicate detection per strategy group
//!
//! Seen record ids are kept in one KV set per point time so that sub-tasks and
//! later cycles over an overlapping window share the same view.

use crate::error::AccessResult;
use crate::keys;
use crate::kv::{KvStore, SharedKv};
use crate::record::DataRecord;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub struct Duplicate {
    kv: SharedKv,
    strategy_group_key: String,
    ttl: Duration,
    /// Ids known per time, loaded on first use
    seen: HashMap<i64, HashSet<String>>,
    /// Ids added this cycle, flushed by [`Duplicate::refresh_cache`]
    pending: HashMap<i64, Vec<String>>,
}

impl Duplicate {
    pub fn new(kv: SharedKv, strategy_group_key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kv,
            strategy_group_key: strategy_group_key.into(),
            ttl,
            seen: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    async fn seen_at(&mut self, time: i64) -> AccessResult<&mut HashSet<String>> {
        if !self.seen.contains_key(&time) {
            let key = keys::duplicate_key(&self.strategy_group_key, time);
            let members = self.kv.smembers(&key).await?;
            self.seen.insert(time, members);
        }
        Ok(self.seen.entry(time).or_default())
    }

    pub async fn is_duplicate(&mut self, record: &DataRecord) -> AccessResult<bool> {
        let id = record.record_id();
        Ok(self.seen_at(record.time).await?.contains(&id))
    }

    pub async fn add_record(&mut self, record: &DataRecord) -> AccessResult<()> {
        let id = record.record_id();
        if self.seen_at(record.time).await?.insert(id.clone()) {
            self.pending.entry(record.time).or_default().push(id);
        }
        Ok(())
    }

    /// Forget ids added after `time` that were not flushed yet; returns how many
    pub fn discard_after(&mut self, time: i64) -> usize {
        let seen = &mut self.seen;
        let mut discarded = 0;
        self.pending.retain(|t, ids| {
            if *t <= time {
                return true;
            }
            if let Some(known) = seen.get_mut(t) {
                for id in ids.iter() {
                    known.remove(id);
                }
            }
            discarded += ids.len();
            false
        });
        discarded
    }

    /// Persist ids added since the last flush
    pub async fn refresh_cache(&mut self) -> AccessResult<usize> {
        let mut flushed = 0;
        for (time, ids) in self.pending.drain() {
            let key = keys::duplicate_key(&self.strategy_group_key, time);
            self.kv.sadd(&key, &ids).await?;
            self.kv.expire(&key, self.ttl).await?;
            flushed += ids.len();
        }
        Ok(flushed)
    }
}
