//! Result-table lookups for the leader: Kafka storage and dimension fields

use super::assignment::RESERVED_DIMENSIONS;
use crate::error::{AccessError, AccessResult, ErrorContext};
use crate::keys;
use crate::kv::{KvStore, SharedKv};
use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterConfig {
    pub domain_name: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageConfig {
    pub topic: String,
}

/// Kafka storage of a result table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageInfo {
    pub cluster_config: ClusterConfig,
    pub storage_config: StorageConfig,
}

impl StorageInfo {
    /// Bootstrap server, `domain:port`
    pub fn broker(&self) -> String {
        format!("{}:{}", self.cluster_config.domain_name, self.cluster_config.port)
    }

    pub fn topic(&self) -> &str {
        &self.storage_config.topic
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldInfo {
    pub field_name: String,
    #[serde(default)]
    pub is_dimension: bool,
}

/// Cached result-table description
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResultTableInfo {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub storage_info: Option<StorageInfo>,
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
}

/// The result-table cache writes `{}` for tables without storage
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<StorageInfo>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(other) => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

impl ResultTableInfo {
    /// Dimension fields minus the reserved ones
    pub fn dimensions(&self) -> BTreeSet<String> {
        self.fields
            .iter()
            .filter(|f| f.is_dimension && !RESERVED_DIMENSIONS.contains(&f.field_name.as_str()))
            .map(|f| f.field_name.clone())
            .collect()
    }
}

/// Storage lookups the result-table cache lacks
#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn kafka_storage(&self, result_table_id: &str) -> AccessResult<Option<StorageInfo>>;
}

/// Metadata HTTP API
pub struct MetadataClient {
    client: reqwest::Client,
    url: String,
}

impl MetadataClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> AccessResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AccessError::Config(format!("metadata client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl StorageApi for MetadataClient {
    async fn kafka_storage(&self, result_table_id: &str) -> AccessResult<Option<StorageInfo>> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("result_table_list", result_table_id), ("storage_type", "kafka")])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AccessError::DataSource(format!("metadata request failed: {}", e)))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| AccessError::DataSource(format!("metadata response: {}", e)))?;

        // the API may wrap its payload as {"result": .., "data": {..}}
        let data = body.get("data").unwrap_or(&body);
        match data.get(result_table_id) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(map)) if map.is_empty() => Ok(None),
            Some(info) => Ok(Some(serde_json::from_value(info.clone())?)),
        }
    }
}

/// Result-table and storage lookups with a TTL memo per table
pub struct StorageResolver {
    kv: SharedKv,
    api: Option<Box<dyn StorageApi>>,
    memo: Cache<String, Option<StorageInfo>>,
}

impl StorageResolver {
    pub fn new(kv: SharedKv, api: Option<Box<dyn StorageApi>>, ttl: Duration) -> Self {
        Self {
            kv,
            api,
            memo: Cache::builder().time_to_live(ttl).build(),
        }
    }

    pub async fn result_table(&self, result_table_id: &str) -> AccessResult<Option<ResultTableInfo>> {
        let Some(raw) = self
            .kv
            .hget(keys::RESULT_TABLE_CACHE_KEY, result_table_id)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Kafka storage of a table, from the memo, the cached table or the API
    pub async fn storage(
        &self,
        result_table_id: &str,
        info: &ResultTableInfo,
    ) -> AccessResult<Option<StorageInfo>> {
        if let Some(memo) = self.memo.get(result_table_id).await {
            return Ok(memo);
        }

        let storage = match (&info.storage_info, &self.api) {
            (Some(storage), _) => Some(storage.clone()),
            (None, Some(api)) => api
                .kafka_storage(result_table_id)
                .await
                .with_context(|| format!("storage lookup of {}", result_table_id))?,
            (None, None) => {
                debug!(result_table_id, "no storage info and no metadata api");
                None
            }
        };
        if storage.is_none() {
            warn!(result_table_id, "result table has no kafka storage");
        }
        self.memo
            .insert(result_table_id.to_string(), storage.clone())
            .await;
        Ok(storage)
    }
}

/// Fixed storage answers, for tests and offline runs
#[derive(Default)]
pub struct StaticStorageApi {
    pub tables: HashMap<String, StorageInfo>,
}

#[async_trait]
impl StorageApi for StaticStorageApi {
    async fn kafka_storage(&self, result_table_id: &str) -> AccessResult<Option<StorageInfo>> {
        Ok(self.tables.get(result_table_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn storage(topic: &str) -> Value {
        json!({
            "cluster_config": {"domain_name": "kafka.svc", "port": 9092},
            "storage_config": {"topic": topic}
        })
    }

    #[tokio::test]
    async fn test_result_table_dimensions_and_storage() {
        let kv: SharedKv = Arc::new(MemoryStore::new());
        let table = json!({
            "storage_info": storage("t_cpu"),
            "fields": [
                {"field_name": "ip", "is_dimension": true},
                {"field_name": "bk_supplier_id", "is_dimension": true},
                {"field_name": "usage", "is_dimension": false}
            ]
        });
        kv.hset(keys::RESULT_TABLE_CACHE_KEY, "2_cpu", &table.to_string())
            .await
            .unwrap();

        let resolver = StorageResolver::new(kv, None, Duration::from_secs(60));
        let info = resolver.result_table("2_cpu").await.unwrap().unwrap();
        assert_eq!(info.dimensions(), BTreeSet::from(["ip".to_string()]));
        let storage = resolver.storage("2_cpu", &info).await.unwrap().unwrap();
        assert_eq!(storage.broker(), "kafka.svc:9092");
        assert_eq!(storage.topic(), "t_cpu");
        assert!(resolver.result_table("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_falls_back_to_api_and_memoizes() {
        let kv: SharedKv = Arc::new(MemoryStore::new());
        kv.hset(
            keys::RESULT_TABLE_CACHE_KEY,
            "2_mem",
            &json!({"storage_info": {}, "fields": []}).to_string(),
        )
        .await
        .unwrap();
        let mut api = StaticStorageApi::default();
        api.tables.insert(
            "2_mem".into(),
            serde_json::from_value(storage("t_mem")).unwrap(),
        );

        let resolver = StorageResolver::new(kv, Some(Box::new(api)), Duration::from_secs(60));
        let info = resolver.result_table("2_mem").await.unwrap().unwrap();
        assert_eq!(info.storage_info, None);
        let first = resolver.storage("2_mem", &info).await.unwrap().unwrap();
        assert_eq!(first.topic(), "t_mem");

        // memoized even when the table later shows other storage
        let other: ResultTableInfo =
            serde_json::from_value(json!({"storage_info": storage("t_other")})).unwrap();
        let second = resolver.storage("2_mem", &other).await.unwrap().unwrap();
        assert_eq!(second.topic(), "t_mem");
    }
}
