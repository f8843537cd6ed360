//! Redis-backed store

use super::KvStore;
use crate::error::{AccessError, AccessResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::info;

/// Store over a multiplexed, auto-reconnecting Redis connection
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> AccessResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| AccessError::Config(format!("Invalid redis url {}: {}", url, e)))?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to redis");
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> AccessResult<Option<String>> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AccessResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(seconds(ttl));
        }
        let _: () = cmd.query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> AccessResult<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(seconds(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> AccessResult<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AccessResult<bool> {
        let applied: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(applied == 1)
    }

    async fn ttl(&self, key: &str) -> AccessResult<Option<Duration>> {
        let remaining: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok((remaining >= 0).then(|| Duration::from_secs(remaining as u64)))
    }

    async fn hget(&self, key: &str, field: &str) -> AccessResult<Option<String>> {
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> AccessResult<()> {
        let _: i64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> AccessResult<HashMap<String, String>> {
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(map)
    }

    async fn replace_hash(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> AccessResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(key).ignore();
        if !fields.is_empty() {
            let hset = pipe.cmd("HSET").arg(key);
            for (field, value) in fields {
                hset.arg(field).arg(value);
            }
            hset.ignore();
            pipe.cmd("EXPIRE").arg(key).arg(seconds(ttl)).ignore();
        }
        let _: () = pipe.query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> AccessResult<usize> {
        let len: usize = redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(len)
    }

    async fn lpush(&self, key: &str, values: &[String]) -> AccessResult<usize> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        let len: usize = redis::cmd("LPUSH")
            .arg(key)
            .arg(values)
            .query_async(&mut self.conn())
            .await?;
        Ok(len)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> AccessResult<usize> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        let len: usize = redis::cmd("RPUSH")
            .arg(key)
            .arg(values)
            .query_async(&mut self.conn())
            .await?;
        Ok(len)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> AccessResult<Vec<String>> {
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut self.conn())
            .await?;
        Ok(values)
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> AccessResult<Option<String>> {
        let reply: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut self.conn())
            .await?;
        Ok(reply.map(|(_, value)| value))
    }

    async fn zadd(&self, key: &str, members: &[(String, f64)]) -> AccessResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        for (member, score) in members {
            cmd.arg(*score).arg(member);
        }
        let _: i64 = cmd.query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn zscore(&self, key: &str, member: &str) -> AccessResult<Option<f64>> {
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await?;
        Ok(score)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> AccessResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let _: i64 = redis::cmd("SADD")
            .arg(key)
            .arg(members)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> AccessResult<HashSet<String>> {
        let members: HashSet<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(members)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> AccessResult<Vec<String>> {
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}*", prefix))
            .query_async(&mut self.conn())
            .await?;
        Ok(keys)
    }
}
