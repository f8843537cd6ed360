//! Host topology lookups used for enrichment and host-status filtering

use crate::error::AccessResult;
use crate::keys;
use crate::kv::{KvStore, SharedKv};
use crate::record::DataRecord;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Alive,
    Dead,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub ip: String,
    #[serde(default)]
    pub bk_cloud_id: i64,
    #[serde(default)]
    pub bk_host_id: i64,
    pub bk_biz_id: i64,
    #[serde(default)]
    pub bk_set_ids: Vec<i64>,
    #[serde(default)]
    pub bk_module_ids: Vec<i64>,
    #[serde(default)]
    pub status: HostStatus,
}

impl Host {
    pub fn key(&self) -> String {
        host_key(&self.ip, self.bk_cloud_id)
    }
}

pub fn host_key(ip: &str, bk_cloud_id: i64) -> String {
    format!("{}|{}", ip, bk_cloud_id)
}

/// Host key of the target a record describes, if it describes one
pub fn record_host_key(dimensions: &BTreeMap<String, String>) -> Option<String> {
    let ip = dimensions
        .get("bk_target_ip")
        .or_else(|| dimensions.get("ip"))
        .filter(|ip| !ip.is_empty())?;
    let cloud = dimensions
        .get("bk_target_cloud_id")
        .or_else(|| dimensions.get("bk_cloud_id"))
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    Some(host_key(ip, cloud))
}

/// In-memory snapshot of the host cache kept in KV.
///
/// Lookups are synchronous; [`HostCache::refresh`] reloads the snapshot.
#[derive(Clone, Default)]
pub struct HostCache {
    hosts: Arc<RwLock<HashMap<String, Host>>>,
}

impl HostCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload from the KV hash; entries that fail to decode are skipped
    pub async fn refresh(&self, kv: &SharedKv) -> AccessResult<usize> {
        let raw = kv.hgetall(keys::HOST_CACHE_KEY).await?;
        let mut hosts = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            match serde_json::from_str::<Host>(&value) {
                Ok(host) => {
                    hosts.insert(key, host);
                }
                Err(e) => warn!(host = %key, "Skipping undecodable host: {}", e),
            }
        }
        let count = hosts.len();
        *self.hosts.write() = hosts;
        debug!(count, "Host cache refreshed");
        Ok(count)
    }

    pub fn insert(&self, host: Host) {
        self.hosts.write().insert(host.key(), host);
    }

    pub fn get(&self, key: &str) -> Option<Host> {
        self.hosts.read().get(key).cloned()
    }

    pub fn status(&self, key: &str) -> HostStatus {
        self.hosts
            .read()
            .get(key)
            .map(|h| h.status)
            .unwrap_or_default()
    }
}

/// Fills business, set and module dimensions from the host cache
#[derive(Clone)]
pub struct TopoNodeFuller {
    hosts: HostCache,
}

impl TopoNodeFuller {
    pub fn new(hosts: HostCache) -> Self {
        Self { hosts }
    }

    /// Best effort: records without a known host are left unchanged
    pub fn full(&self, record: &mut DataRecord) -> bool {
        let Some(key) = record_host_key(&record.dimensions) else {
            return false;
        };
        let Some(host) = self.hosts.get(&key) else {
            debug!(host = %key, "Host not in cache, enrichment skipped");
            return false;
        };

        let dims = &mut record.dimensions;
        dims.entry("bk_host_id".to_string())
            .or_insert_with(|| host.bk_host_id.to_string());
        dims.entry("bk_biz_id".to_string())
            .or_insert_with(|| host.bk_biz_id.to_string());
        if !host.bk_set_ids.is_empty() || !host.bk_module_ids.is_empty() {
            let nodes: Vec<String> = host
                .bk_set_ids
                .iter()
                .map(|id| format!("set|{}", id))
                .chain(host.bk_module_ids.iter().map(|id| format!("module|{}", id)))
                .collect();
            dims.insert("bk_topo_node".to_string(), nodes.join(","));
        }
        true
    }
}
