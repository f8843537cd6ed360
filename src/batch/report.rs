//! Sub-task reports and their aggregation

use crate::push::{NoisePushCount, PushCount, PushOutcome};
use crate::strategy::ItemId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullCounts {
    pub total_count: usize,
    pub access_count: usize,
    pub duplicate_count: usize,
    pub none_point_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalPushData {
    pub count: usize,
    pub last_checkpoint: i64,
}

/// Counters a sub-task folds into its report instead of logging them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessCounts {
    #[serde(default)]
    pub pull_data: BTreeMap<ItemId, PullCounts>,
    #[serde(default)]
    pub push_data: BTreeMap<ItemId, PushCount>,
    #[serde(default)]
    pub push_noise_data: BTreeMap<ItemId, NoisePushCount>,
    #[serde(default)]
    pub total_push_data: TotalPushData,
}

impl ProcessCounts {
    pub fn record_push(&mut self, outcome: &PushOutcome) {
        self.push_data
            .extend(outcome.push_data.iter().map(|(k, v)| (*k, v.clone())));
        self.push_noise_data
            .extend(outcome.push_noise_data.iter().map(|(k, v)| (*k, v.clone())));
    }
}

/// What a sub-task pushes onto the shared result list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub sub_task_id: String,
    pub result: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub process_counts: ProcessCounts,
}

impl BatchReport {
    pub fn ok(sub_task_id: impl Into<String>, process_counts: ProcessCounts) -> Self {
        Self {
            sub_task_id: sub_task_id.into(),
            result: true,
            error: None,
            process_counts,
        }
    }

    pub fn failed(sub_task_id: impl Into<String>, error: impl ToString, process_counts: ProcessCounts) -> Self {
        Self {
            sub_task_id: sub_task_id.into(),
            result: false,
            error: Some(error.to_string()),
            process_counts,
        }
    }
}

/// Per-item totals over every report of one split
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemTotals {
    pub pull: PullCounts,
    pub push_count: usize,
    pub output_key: Option<String>,
    pub noise_count: usize,
    pub record_key: Option<String>,
    pub dimension_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub items: BTreeMap<ItemId, ItemTotals>,
    pub total_push_count: usize,
    /// Highest checkpoint reported by a successful sub-task
    pub last_checkpoint: i64,
    pub failed: Vec<(String, String)>,
}

impl BatchSummary {
    pub fn aggregate(reports: &[BatchReport]) -> Self {
        let mut summary = Self::default();
        for report in reports {
            let counts = &report.process_counts;
            if report.result {
                summary.total_push_count += counts.total_push_data.count;
                summary.last_checkpoint =
                    summary.last_checkpoint.max(counts.total_push_data.last_checkpoint);
            } else {
                summary.failed.push((
                    report.sub_task_id.clone(),
                    report.error.clone().unwrap_or_default(),
                ));
            }

            for (item_id, pull) in &counts.pull_data {
                let totals = summary.items.entry(*item_id).or_default();
                totals.pull.total_count += pull.total_count;
                totals.pull.access_count += pull.access_count;
                totals.pull.duplicate_count += pull.duplicate_count;
                totals.pull.none_point_count += pull.none_point_count;
            }
            for (item_id, push) in &counts.push_data {
                let totals = summary.items.entry(*item_id).or_default();
                totals.push_count += push.count;
                totals.output_key = Some(push.output_key.clone());
            }
            for (item_id, noise) in &counts.push_noise_data {
                let totals = summary.items.entry(*item_id).or_default();
                totals.noise_count += noise.count;
                totals.record_key = Some(noise.record_key.clone());
                totals.dimension_key = Some(noise.dimension_key.clone());
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn report(id: &str, pushed: usize, checkpoint: i64) -> BatchReport {
        let mut counts = ProcessCounts::default();
        counts.pull_data.insert(
            7,
            PullCounts {
                total_count: pushed + 1,
                access_count: pushed,
                duplicate_count: 1,
                none_point_count: 0,
            },
        );
        counts.push_data.insert(
            7,
            PushCount {
                output_key: "access.data.1.7".into(),
                count: pushed,
            },
        );
        counts.total_push_data = TotalPushData {
            count: pushed,
            last_checkpoint: checkpoint,
        };
        BatchReport::ok(id, counts)
    }

    #[test]
    fn test_report_wire_format() {
        let encoded = serde_json::to_value(report("1.2", 3, 120)).unwrap();
        assert_eq!(encoded["result"], true);
        assert_eq!(encoded["process_counts"]["pull_data"]["7"]["access_count"], 3);
        assert_eq!(encoded["process_counts"]["total_push_data"]["last_checkpoint"], 120);
        let decoded: BatchReport = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, report("1.2", 3, 120));
    }

    #[test]
    fn test_aggregate() {
        let failed = BatchReport::failed("1.3", "queue full", ProcessCounts::default());
        let summary =
            BatchSummary::aggregate(&[report("1.1", 3, 60), report("1.2", 2, 120), failed]);
        assert_eq!(summary.total_push_count, 5);
        assert_eq!(summary.last_checkpoint, 120);
        assert_eq!(summary.failed, vec![("1.3".to_string(), "queue full".to_string())]);
        let totals = &summary.items[&7];
        assert_eq!(totals.pull.total_count, 7);
        assert_eq!(totals.pull.duplicate_count, 2);
        assert_eq!(totals.push_count, 5);
        assert_eq!(totals.output_key.as_deref(), Some("access.data.1.7"));
    }
}
