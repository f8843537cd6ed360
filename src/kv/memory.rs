//! In-process store with Redis-like semantics
//!
//! Used by single-node deployments without Redis and throughout the tests.
//! Expired keys are evicted lazily on access.

use super::KvStore;
use crate::error::{AccessError, AccessResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    ZSet(HashMap<String, f64>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
            Value::ZSet(_) => "zset",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    pushed: Notify,
}

/// Cloneable in-memory store; clones share the same data
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

fn wrong_type(key: &str, expected: &str, found: &Value) -> AccessError {
    AccessError::KvType {
        key: key.to_string(),
        message: format!("expected {}, found {}", expected, found.kind()),
    }
}

macro_rules! typed_entry {
    ($map:expr, $key:expr, $variant:ident, $default:expr, $expected:literal) => {{
        let entry = $map
            .entry($key.to_string())
            .or_insert_with(|| Entry::new(Value::$variant($default)));
        match &mut entry.value {
            Value::$variant(inner) => inner,
            other => return Err(wrong_type($key, $expected, other)),
        }
    }};
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` over the live map after evicting `key` if it has expired
    fn with_map<T>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut map = self.inner.entries.lock();
        let now = Instant::now();
        if map.get(key).is_some_and(|e| e.is_expired(now)) {
            map.remove(key);
        }
        f(&mut map)
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut map = self.inner.entries.lock();
        map.retain(|_, e| !e.is_expired(now));
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, key: &str, values: &[String], front: bool) -> AccessResult<usize> {
        let len = self.with_map(key, |map| {
            let list = typed_entry!(map, key, List, VecDeque::new(), "list");
            for value in values {
                if front {
                    list.push_front(value.clone());
                } else {
                    list.push_back(value.clone());
                }
            }
            Ok(list.len())
        })?;
        self.inner.pushed.notify_waiters();
        Ok(len)
    }

    fn try_rpop(&self, key: &str) -> AccessResult<Option<String>> {
        self.with_map(key, |map| {
            let Some(entry) = map.get_mut(key) else {
                return Ok(None);
            };
            let popped = match &mut entry.value {
                Value::List(list) => list.pop_back(),
                other => return Err(wrong_type(key, "list", other)),
            };
            if matches!(&entry.value, Value::List(list) if list.is_empty()) {
                map.remove(key);
            }
            Ok(popped)
        })
    }
}

fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let norm = |i: isize| if i < 0 { len + i } else { i };
    let start = norm(start).max(0);
    let stop = norm(stop).min(len - 1);
    (start <= stop && start < len).then_some((start as usize, stop as usize))
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> AccessResult<Option<String>> {
        self.with_map(key, |map| match map.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(other) => Err(wrong_type(key, "string", other)),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AccessResult<()> {
        self.with_map(key, |map| {
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
        });
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> AccessResult<bool> {
        Ok(self.with_map(key, |map| {
            if map.contains_key(key) {
                return false;
            }
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            true
        }))
    }

    async fn delete(&self, key: &str) -> AccessResult<bool> {
        Ok(self.with_map(key, |map| map.remove(key).is_some()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AccessResult<bool> {
        Ok(self.with_map(key, |map| match map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }))
    }

    async fn ttl(&self, key: &str) -> AccessResult<Option<Duration>> {
        Ok(self.with_map(key, |map| {
            map.get(key).and_then(|e| e.expires_at).map(|at| {
                let remaining = at.saturating_duration_since(Instant::now());
                Duration::from_secs(remaining.as_secs_f64().ceil() as u64)
            })
        }))
    }

    async fn hget(&self, key: &str, field: &str) -> AccessResult<Option<String>> {
        self.with_map(key, |map| match map.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Some(other) => Err(wrong_type(key, "hash", other)),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> AccessResult<()> {
        self.with_map(key, |map| {
            let hash = typed_entry!(map, key, Hash, HashMap::new(), "hash");
            hash.insert(field.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn hgetall(&self, key: &str) -> AccessResult<HashMap<String, String>> {
        self.with_map(key, |map| match map.get(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(other) => Err(wrong_type(key, "hash", other)),
        })
    }

    async fn replace_hash(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> AccessResult<()> {
        self.with_map(key, |map| {
            map.remove(key);
            if !fields.is_empty() {
                map.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Hash(fields.iter().cloned().collect()),
                        expires_at: Some(Instant::now() + ttl),
                    },
                );
            }
        });
        Ok(())
    }

    async fn llen(&self, key: &str) -> AccessResult<usize> {
        self.with_map(key, |map| match map.get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(l)) => Ok(l.len()),
            Some(other) => Err(wrong_type(key, "list", other)),
        })
    }

    async fn lpush(&self, key: &str, values: &[String]) -> AccessResult<usize> {
        self.push(key, values, true)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> AccessResult<usize> {
        self.push(key, values, false)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> AccessResult<Vec<String>> {
        self.with_map(key, |map| match map.get(key).map(|e| &e.value) {
            None => Ok(vec![]),
            Some(Value::List(l)) => Ok(resolve_range(l.len(), start, stop)
                .map(|(s, e)| l.range(s..=e).cloned().collect())
                .unwrap_or_default()),
            Some(other) => Err(wrong_type(key, "list", other)),
        })
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> AccessResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_rpop(key)? {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_rpop(key);
            }
        }
    }

    async fn zadd(&self, key: &str, members: &[(String, f64)]) -> AccessResult<()> {
        self.with_map(key, |map| {
            let zset = typed_entry!(map, key, ZSet, HashMap::new(), "zset");
            for (member, score) in members {
                zset.insert(member.clone(), *score);
            }
            Ok(())
        })
    }

    async fn zscore(&self, key: &str, member: &str) -> AccessResult<Option<f64>> {
        self.with_map(key, |map| match map.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::ZSet(z)) => Ok(z.get(member).copied()),
            Some(other) => Err(wrong_type(key, "zset", other)),
        })
    }

    async fn sadd(&self, key: &str, members: &[String]) -> AccessResult<()> {
        self.with_map(key, |map| {
            let set = typed_entry!(map, key, Set, HashSet::new(), "set");
            set.extend(members.iter().cloned());
            Ok(())
        })
    }

    async fn smembers(&self, key: &str) -> AccessResult<HashSet<String>> {
        self.with_map(key, |map| match map.get(key).map(|e| &e.value) {
            None => Ok(HashSet::new()),
            Some(Value::Set(s)) => Ok(s.clone()),
            Some(other) => Err(wrong_type(key, "set", other)),
        })
    }

    async fn keys_with_prefix(&self, prefix: &str) -> AccessResult<Vec<String>> {
        let now = Instant::now();
        let mut map = self.inner.entries.lock();
        map.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_list_order_matches_redis() {
        let store = MemoryStore::new();
        store
            .lpush("q", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        store.rpush("q", &["z".to_string()]).await.unwrap();
        assert_eq!(store.lrange("q", 0, -1).await.unwrap(), vec!["b", "a", "z"]);
        assert_eq!(store.llen("q").await.unwrap(), 3);
        assert_eq!(
            store.brpop("q", Duration::from_millis(10)).await.unwrap(),
            Some("z".to_string())
        );
    }

    #[tokio::test]
    async fn test_set_nx_and_ttl() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx_ex("lock", "a", Duration::from_secs(120))
            .await
            .unwrap());
        assert!(!store
            .set_nx_ex("lock", "b", Duration::from_secs(120))
            .await
            .unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some("a".to_string()));
        assert_eq!(
            store.ttl("lock").await.unwrap(),
            Some(Duration::from_secs(120))
        );
    }

    #[tokio::test]
    async fn test_expired_keys_disappear() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_brpop_wakes_on_push() {
        let store = MemoryStore::new();
        let producer = store.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.lpush("r", &["done".to_string()]).await.unwrap();
        });
        let popped = store.brpop("r", Duration::from_secs(2)).await.unwrap();
        assert_eq!(popped, Some("done".to_string()));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_brpop_times_out() {
        let store = MemoryStore::new();
        let popped = store.brpop("r", Duration::from_millis(20)).await.unwrap();
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        let err = store.llen("k").await.unwrap_err();
        assert!(matches!(err, AccessError::KvType { .. }));
    }

    #[tokio::test]
    async fn test_replace_hash() {
        let store = MemoryStore::new();
        store.hset("h", "stale", "1").await.unwrap();
        store
            .replace_hash(
                "h",
                &[("a".to_string(), "1".to_string())],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let all = store.hgetall("h").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(store.hget("h", "a").await.unwrap(), Some("1".to_string()));
    }
}
