//! Property tests for checkpoints, partition assignment and sharding

use metric_access::batch::split_points;
use metric_access::checkpoint::Checkpoint;
use metric_access::kv::{MemoryStore, SharedKv};
use metric_access::realtime::assignment::{distribute, TopicAssignment};
use metric_access::record::RawRecord;
use proptest::prelude::*;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn checkpoint_is_monotonic_and_aligned_on_read(
        interval in prop::sample::select(vec![10i64, 60, 300]),
        proposals in prop::collection::vec(-100i64..100_000, 1..20),
    ) {
        let kv: SharedKv = Arc::new(MemoryStore::new());
        let checkpoint = Checkpoint::new(kv, "g", interval);
        let observed = runtime().block_on(async {
            let mut observed = Vec::new();
            for proposal in &proposals {
                let stored = checkpoint.set(*proposal).await.unwrap();
                let read = checkpoint.get(0).await.unwrap();
                observed.push((stored, read));
            }
            observed
        });

        let mut previous = 0;
        for (stored, read) in observed {
            prop_assert!(stored >= previous);
            prop_assert_eq!(read % interval, 0);
            prop_assert!(read <= stored && stored - read < interval);
            previous = stored;
        }
        let best = proposals.iter().copied().filter(|p| *p > 0).max().unwrap_or(0);
        prop_assert_eq!(previous, best);
    }

    #[test]
    fn every_partition_has_exactly_one_owner(
        node_count in 1usize..6,
        partitions in prop::collection::vec(1i32..8, 1..6),
    ) {
        let nodes: Vec<String> = (0..node_count).map(|i| format!("node-{}", i)).collect();
        let topics: BTreeMap<String, (TopicAssignment, Vec<i32>)> = partitions
            .iter()
            .enumerate()
            .map(|(i, count)| {
                let assignment = TopicAssignment {
                    dimensions: BTreeSet::from(["ip".to_string()]),
                    strategy_ids: BTreeSet::from([i as i64]),
                };
                (format!("k:9092|topic_{}", i), (assignment, (0..*count).collect()))
            })
            .collect();

        let distribution = distribute(&nodes, &topics);
        let total: i32 = partitions.iter().sum();
        prop_assert_eq!(distribution.owners.len(), total as usize);
        prop_assert_eq!(distribution.rows.len(), nodes.len());

        for (node, row) in &distribution.rows {
            prop_assert!(nodes.contains(node));
            let owned: BTreeSet<&str> = distribution
                .owners
                .iter()
                .filter(|(_, owner)| *owner == node)
                .filter_map(|(key, _)| key.rsplit_once('|').map(|(topic, _)| topic))
                .collect();
            let assigned: BTreeSet<&str> = row.keys().map(String::as_str).collect();
            prop_assert_eq!(owned, assigned);
        }

        // a single-partition topic lands on one node only
        for (topic, (_, ids)) in &topics {
            if ids.len() == 1 {
                let holders = distribution.rows.values().filter(|row| row.contains_key(topic)).count();
                prop_assert_eq!(holders, 1);
            }
        }
    }

    #[test]
    fn shards_never_split_a_timestamp(
        steps in prop::collection::vec(0i64..3, 0..40),
        threshold in 0usize..20,
        batch_size in 1usize..8,
    ) {
        let mut time = 0;
        let points: Vec<RawRecord> = steps
            .iter()
            .map(|step| {
                time += step * 60;
                serde_json::from_value(json!({"_time_": time, "_result_": 1})).unwrap()
            })
            .collect();
        let times: Vec<i64> = points.iter().filter_map(RawRecord::time).collect();

        let shards = split_points(points, threshold, batch_size);
        if threshold == 0 || times.len() <= threshold {
            prop_assert_eq!(shards.len(), 1);
        }

        let flattened: Vec<i64> = shards.iter().flatten().filter_map(RawRecord::time).collect();
        prop_assert_eq!(&flattened, &times);

        let mut seen = BTreeSet::new();
        for shard in &shards {
            if !times.is_empty() {
                prop_assert!(!shard.is_empty());
            }
            let shard_times: BTreeSet<i64> = shard.iter().filter_map(RawRecord::time).collect();
            prop_assert!(seen.is_disjoint(&shard_times));
            seen.extend(shard_times);
        }
    }
}
