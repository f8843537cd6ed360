//! Priority resolution between strategies sharing a priority group
//!
//! Among records that describe the same dimensions at the same time under one
//! priority group, only the strategies with the highest priority keep their
//! record; the others are marked as inhibited. Winners are written to a KV hash
//! per priority group so that strategies evaluated in other strategy groups
//! (other tasks, other nodes) are inhibited as well.

use crate::error::AccessResult;
use crate::keys;
use crate::kv::{KvStore, SharedKv};
use crate::record::DataRecord;
use crate::strategy::ItemId;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

/// `(priority, time)` stored as `"priority:time"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Claim {
    priority: i64,
    time: i64,
}

impl Claim {
    fn parse(raw: &str) -> Option<Self> {
        let (priority, time) = raw.split_once(':')?;
        Some(Self {
            priority: priority.parse().ok()?,
            time: time.parse().ok()?,
        })
    }

    fn encode(&self) -> String {
        format!("{}:{}", self.priority, self.time)
    }

    /// Whether this claim suppresses a candidate with `priority` at `time`
    fn inhibits(&self, priority: i64, time: i64) -> bool {
        self.time >= time && self.priority > priority
    }

    /// Whether `other` should replace this claim in the store
    fn superseded_by(&self, other: &Claim) -> bool {
        other.time > self.time || (other.time == self.time && other.priority > self.priority)
    }
}

/// One `(record, item)` pair taking part in a priority group
struct Candidate {
    record: usize,
    item_id: ItemId,
    priority: i64,
}

pub struct PriorityChecker {
    kv: SharedKv,
    ttl: Duration,
}

impl PriorityChecker {
    pub fn new(kv: SharedKv) -> Self {
        Self {
            kv,
            ttl: keys::PRIORITY_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Mark `inhibitions` on every record; returns how many pairs were inhibited
    pub async fn check_records(&self, records: &mut [DataRecord]) -> AccessResult<usize> {
        // (priority group, dimension hash, time) -> candidates
        let mut groups: BTreeMap<(String, String, i64), Vec<Candidate>> = BTreeMap::new();
        for (index, record) in records.iter().enumerate() {
            let dimension_hash = record.dimension_hash();
            for item in &record.items {
                let strategy = &item.strategy;
                if !strategy.has_priority() {
                    continue;
                }
                let (Some(group), Some(priority)) =
                    (strategy.priority_group_key.clone(), strategy.priority)
                else {
                    continue;
                };
                groups
                    .entry((group, dimension_hash.clone(), record.time))
                    .or_default()
                    .push(Candidate {
                        record: index,
                        item_id: item.item_id(),
                        priority,
                    });
            }
        }
        if groups.is_empty() {
            return Ok(0);
        }

        let mut stored: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut inhibited = 0;
        for ((group, dimension_hash, time), candidates) in &groups {
            if !stored.contains_key(group) {
                let claims = self.kv.hgetall(&keys::priority_key(group)).await?;
                stored.insert(group.clone(), claims);
            }
            let claims = stored.entry(group.clone()).or_default();
            let existing = claims.get(dimension_hash).and_then(|raw| Claim::parse(raw));

            let best = candidates.iter().map(|c| c.priority).max().unwrap_or_default();
            for candidate in candidates {
                let beaten_locally = candidate.priority < best;
                let beaten_remotely = existing.is_some_and(|c| c.inhibits(candidate.priority, *time));
                if beaten_locally || beaten_remotely {
                    records[candidate.record]
                        .inhibitions
                        .insert(candidate.item_id, true);
                    inhibited += 1;
                }
            }

            let claim = Claim {
                priority: best,
                time: *time,
            };
            if existing.map_or(true, |e| e.superseded_by(&claim)) {
                let key = keys::priority_key(group);
                self.kv.hset(&key, dimension_hash, &claim.encode()).await?;
                self.kv.expire(&key, self.ttl).await?;
                claims.insert(dimension_hash.clone(), claim.encode());
            }
        }
        debug!(groups = groups.len(), inhibited, "Priority check done");
        Ok(inhibited)
    }
}
