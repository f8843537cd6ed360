//! Shared key-value store abstraction
//!
//! Everything the pipeline keeps outside the process (detector queues,
//! checkpoints, duplicate sets, shard lists, the leader lock, the assignment
//! hash and registry heartbeats) goes through [`KvStore`]. Only single-command
//! atomicity is assumed, except for [`KvStore::replace_hash`] which must swap a
//! hash in one step.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::error::AccessResult;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Shared handle to a store
pub type SharedKv = Arc<dyn KvStore>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> AccessResult<Option<String>>;

    /// Set a string value, optionally with a TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AccessResult<()>;

    /// Set only if absent; returns whether the value was written
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> AccessResult<bool>;

    /// Delete a key of any type; returns whether it existed
    async fn delete(&self, key: &str) -> AccessResult<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> AccessResult<bool>;

    /// Remaining TTL; `None` when the key is missing or never expires
    async fn ttl(&self, key: &str) -> AccessResult<Option<Duration>>;

    async fn hget(&self, key: &str, field: &str) -> AccessResult<Option<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> AccessResult<()>;

    async fn hgetall(&self, key: &str) -> AccessResult<HashMap<String, String>>;

    /// Atomically replace the whole hash and set its TTL
    async fn replace_hash(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> AccessResult<()>;

    async fn llen(&self, key: &str) -> AccessResult<usize>;

    /// Push values to the head of a list; returns the new length
    async fn lpush(&self, key: &str, values: &[String]) -> AccessResult<usize>;

    /// Push values to the tail of a list; returns the new length
    async fn rpush(&self, key: &str, values: &[String]) -> AccessResult<usize>;

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> AccessResult<Vec<String>>;

    /// Pop from the tail, waiting up to `timeout`
    async fn brpop(&self, key: &str, timeout: Duration) -> AccessResult<Option<String>>;

    /// Upsert sorted set members as `(member, score)`
    async fn zadd(&self, key: &str, members: &[(String, f64)]) -> AccessResult<()>;

    async fn zscore(&self, key: &str, member: &str) -> AccessResult<Option<f64>>;

    async fn sadd(&self, key: &str, members: &[String]) -> AccessResult<()>;

    async fn smembers(&self, key: &str) -> AccessResult<HashSet<String>>;

    async fn keys_with_prefix(&self, prefix: &str) -> AccessResult<Vec<String>>;
}
