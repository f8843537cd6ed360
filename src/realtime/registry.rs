//! Service registry of live real-time nodes
//!
//! Each node keeps a heartbeat key with a TTL under a shared prefix; the
//! leader reads the roster from whatever keys are still alive.

use crate::config::AccessSettings;
use crate::error::AccessResult;
use crate::keys;
use crate::kv::{KvStore, SharedKv};
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct NodeRegistry {
    kv: SharedKv,
    prefix: String,
    ttl: Duration,
}

impl NodeRegistry {
    pub fn new(kv: SharedKv, settings: &AccessSettings) -> Self {
        Self {
            kv,
            prefix: keys::registry_prefix(
                &settings.app_code,
                &settings.platform,
                &settings.environment,
                &settings.cluster_name,
            ),
            ttl: settings.real_time.heartbeat_ttl,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register or refresh `node_id`
    pub async fn heartbeat(&self, node_id: &str) -> AccessResult<()> {
        let key = keys::registry_node_key(&self.prefix, node_id);
        self.kv
            .set(&key, &chrono::Utc::now().timestamp().to_string(), Some(self.ttl))
            .await?;
        debug!(node_id, "Registry heartbeat");
        Ok(())
    }

    pub async fn deregister(&self, node_id: &str) -> AccessResult<()> {
        self.kv
            .delete(&keys::registry_node_key(&self.prefix, node_id))
            .await?;
        Ok(())
    }

    /// Live node ids, sorted
    pub async fn roster(&self) -> AccessResult<Vec<String>> {
        let mut nodes: Vec<String> = self
            .kv
            .keys_with_prefix(&self.prefix)
            .await?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(&self.prefix)
                    .map(|rest| rest.trim_end_matches('/'))
                    .and_then(|rest| rest.rsplit('/').next())
                    .filter(|node| !node.is_empty())
                    .map(str::to_string)
            })
            .collect();
        nodes.sort();
        nodes.dedup();
        Ok(nodes)
    }
}
