//! Topic assignment rows published by the leader

use super::hashring::HashRing;
use crate::strategy::StrategyId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Dimensions never used to rebind item aggregation
pub const RESERVED_DIMENSIONS: &[&str] = &["bk_cmdb_level", "bk_supplier_id"];

/// What one node consumes from one `broker|topic`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicAssignment {
    #[serde(default)]
    pub dimensions: BTreeSet<String>,
    #[serde(default)]
    pub strategy_ids: BTreeSet<StrategyId>,
}

/// One node's row: `"broker|topic"` -> assignment
pub type NodeAssignment = BTreeMap<String, TopicAssignment>;

pub fn topic_key(broker: &str, topic: &str) -> String {
    format!("{}|{}", broker, topic)
}

/// `(broker, topic)` of a `broker|topic` key
pub fn split_topic_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('|')
        .filter(|(broker, topic)| !broker.is_empty() && !topic.is_empty())
}

/// Result of hashing every partition onto the roster
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Distribution {
    /// Owner of every `broker|topic|partition`
    pub owners: BTreeMap<String, String>,
    /// Row per roster node, empty for nodes that own nothing
    pub rows: BTreeMap<String, NodeAssignment>,
}

/// Hash partitions onto `nodes` and collapse each node's partitions back to
/// topic entries.
///
/// `topics` maps `broker|topic` to its assignment and partition ids. Every
/// node of the roster gets a row so stale rows are overwritten on publish.
pub fn distribute(
    nodes: &[String],
    topics: &BTreeMap<String, (TopicAssignment, Vec<i32>)>,
) -> Distribution {
    let ring = HashRing::new(nodes);
    let mut distribution = Distribution {
        owners: BTreeMap::new(),
        rows: nodes.iter().map(|n| (n.clone(), NodeAssignment::new())).collect(),
    };
    if ring.is_empty() {
        return distribution;
    }

    for (topic, (assignment, partitions)) in topics {
        for partition in partitions {
            let key = format!("{}|{}", topic, partition);
            let Some(node) = ring.get_node(&key) else { continue };
            distribution
                .rows
                .entry(node.to_string())
                .or_default()
                .insert(topic.clone(), assignment.clone());
            distribution.owners.insert(key, node.to_string());
        }
    }
    distribution
}

/// Assignment entries grouped by broker: broker -> topics
pub fn topics_by_broker(row: &NodeAssignment) -> BTreeMap<String, BTreeSet<String>> {
    let mut brokers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for key in row.keys() {
        if let Some((broker, topic)) = split_topic_key(key) {
            brokers
                .entry(broker.to_string())
                .or_default()
                .insert(topic.to_string());
        }
    }
    brokers
}
