//! Batch access scenarios against the in-process KV store

mod common;

use common::{point, strategy, updated_at, BatchHarness, GROUP};
use metric_access::batch::{
    encode_shard, AccessBatchDataProcess, AccessDataProcess, AccessOutcome, BatchWorkerPool,
    CycleReport, TaskSource,
};
use metric_access::checkpoint::Checkpoint;
use metric_access::circuit_breaking::ACCESS_DATA_MODULE;
use metric_access::error::AccessError;
use metric_access::keys;
use metric_access::kv::KvStore;
use metric_access::time::format_ts;
use metric_access::AccessSettings;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const NOW: i64 = 1_700_000_120;
const START: i64 = 1_700_000_000;

fn minute_settings() -> AccessSettings {
    AccessSettings::builder()
        .num_of_count_freq_access(1)
        .time_delay(30)
        .build()
}

async fn stored_checkpoint(harness: &BatchHarness, interval: i64) -> Option<i64> {
    Checkpoint::new(Arc::clone(&harness.kv), GROUP, interval)
        .current()
        .await
        .unwrap()
}

fn processed(outcome: AccessOutcome) -> CycleReport {
    match outcome {
        AccessOutcome::Processed(report) => report,
        other => panic!("expected a processed cycle, got {:?}", other),
    }
}

#[tokio::test]
async fn test_single_shard_happy_path() {
    let harness = BatchHarness::new(minute_settings(), NOW);
    harness.strategies.insert(strategy(1, 2, "bk_monitor", 60, &[]));
    Checkpoint::new(Arc::clone(&harness.kv), GROUP, 60)
        .set(START)
        .await
        .unwrap();
    harness.source.set_points(vec![
        point(1_700_000_040, 1.0, json!({})),
        point(1_700_000_100, 2.0, json!({})),
    ]);

    let report = processed(
        AccessDataProcess::new(Arc::clone(&harness.ctx), GROUP)
            .process()
            .await
            .unwrap(),
    );
    // the seeded checkpoint is read aligned down to the interval
    assert_eq!(report.from, 1_699_999_920);
    assert_eq!(report.until, 1_700_000_040);
    assert_eq!(report.batch_count, 1);
    assert_eq!(report.pushed, 2);
    assert_eq!(report.checkpoint, Some(1_700_000_100));

    let queue = harness.kv.lrange(&keys::data_list_key(1, 10), 0, -1).await.unwrap();
    assert_eq!(queue.len(), 2);
    let values: Vec<f64> = queue
        .iter()
        .map(|raw| serde_json::from_str::<serde_json::Value>(raw).unwrap()["value"].as_f64().unwrap())
        .collect();
    assert!(values.contains(&1.0) && values.contains(&2.0));
    assert!(harness.kv.ttl(&keys::data_list_key(1, 10)).await.unwrap() >= Some(Duration::from_secs(300)));

    let signal = harness.kv.lrange(keys::data_signal_key(), 0, -1).await.unwrap();
    assert_eq!(signal, vec!["1".to_string()]);
    assert_eq!(stored_checkpoint(&harness, 60).await, Some(1_700_000_100));
}

#[tokio::test]
async fn test_replayed_pull_is_idempotent() {
    let harness = BatchHarness::new(minute_settings(), NOW);
    harness.strategies.insert(strategy(1, 2, "bk_monitor", 60, &[]));
    harness.source.set_points(vec![
        point(1_700_000_040, 1.0, json!({})),
        point(1_700_000_100, 2.0, json!({})),
    ]);
    let process = AccessDataProcess::new(Arc::clone(&harness.ctx), GROUP);

    let first = processed(process.process().await.unwrap());
    let second = processed(process.process().await.unwrap());
    assert_eq!(first.pushed, 2);
    assert_eq!(second.pushed, 0);
    assert_eq!(stored_checkpoint(&harness, 60).await, Some(1_700_000_100));
    assert_eq!(harness.kv.llen(&keys::data_list_key(1, 10)).await.unwrap(), 2);
    assert_eq!(harness.metrics.snapshot().duplicates, 2);
}

#[tokio::test]
async fn test_fresh_bk_data_defers_cycle() {
    let now = 1_700_000_140;
    let settings = AccessSettings::builder()
        .num_of_count_freq_access(1)
        .time_delay(30)
        .bkdata_local_time(60, 0)
        .build();
    let harness = BatchHarness::new(settings, now);
    harness.strategies.insert(strategy(1, 2, "bk_data", 60, &[]));
    Checkpoint::new(Arc::clone(&harness.kv), GROUP, 60)
        .set(START)
        .await
        .unwrap();
    harness.source.set_points(vec![point(
        1_700_000_040,
        1.0,
        json!({"_localTime": format_ts(now - 5)}),
    )]);

    let process = AccessDataProcess::new(Arc::clone(&harness.ctx), GROUP);
    let outcome = process.process().await.unwrap();
    assert_eq!(outcome, AccessOutcome::Deferred { until: 1_700_000_100 });
    assert_eq!(harness.kv.llen(&keys::data_list_key(1, 10)).await.unwrap(), 0);
    assert_eq!(stored_checkpoint(&harness, 60).await, Some(START));
    let resume_key = keys::access_end_time_key(GROUP);
    assert_eq!(
        harness.kv.get(&resume_key).await.unwrap(),
        Some("1700000100".to_string())
    );
    assert_eq!(harness.metrics.snapshot().deferred_cycles, 1);

    // the next cycle resumes from the stored `until` and consumes it
    harness.clock.set(1_700_000_400);
    harness.source.set_points(vec![point(
        1_700_000_040,
        1.0,
        json!({"_localTime": format_ts(1_700_000_050)}),
    )]);
    let report = processed(process.process().await.unwrap());
    assert_eq!(report.until, 1_700_000_100);
    assert_eq!(report.pushed, 1);
    assert_eq!(harness.kv.get(&resume_key).await.unwrap(), None);
    assert_eq!(stored_checkpoint(&harness, 60).await, Some(1_700_000_040));
}

fn fan_out_settings(result_timeout: u64) -> AccessSettings {
    AccessSettings::builder()
        .batch_process(2, 2)
        .num_of_count_freq_access(10)
        .time_delay(0)
        .batch_result_timeout(result_timeout)
        .build()
}

fn fan_out_points() -> Vec<metric_access::record::RawRecord> {
    vec![
        point(10, 1.0, json!({"ip": "10.0.0.1"})),
        point(10, 1.0, json!({"ip": "10.0.0.2"})),
        point(20, 2.0, json!({"ip": "10.0.0.1"})),
        point(30, 3.0, json!({"ip": "10.0.0.1"})),
        point(40, 4.0, json!({"ip": "10.0.0.1"})),
    ]
}

#[tokio::test]
async fn test_batch_fan_out_and_fan_in() {
    let BatchHarness {
        kv,
        strategies,
        source,
        sub_tasks,
        ctx,
        ..
    } = BatchHarness::new(fan_out_settings(10), 100);
    strategies.insert(strategy(1, 2, "bk_monitor", 10, &["ip"]));
    source.set_points(fan_out_points());

    let token = CancellationToken::new();
    let workers = BatchWorkerPool::new(Arc::clone(&ctx), TaskSource::channel(sub_tasks), 2)
        .with_poll_wait(Duration::from_millis(20))
        .spawn(token.clone());

    let report = processed(
        AccessDataProcess::new(Arc::clone(&ctx), GROUP)
            .process()
            .await
            .unwrap(),
    );
    token.cancel();
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(report.total_points, 5);
    assert_eq!(report.batch_count, 3);
    assert!(report.missing_sub_tasks.is_empty());
    assert_eq!(report.pushed, 5);
    assert_eq!(report.checkpoint, Some(40));
    assert_eq!(kv.llen(&keys::data_list_key(1, 10)).await.unwrap(), 5);
    assert_eq!(
        Checkpoint::new(Arc::clone(&kv), GROUP, 10).current().await.unwrap(),
        Some(40)
    );
    // shards are deleted once read
    assert!(kv
        .get(&keys::access_batch_data_key(GROUP, "100.2"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_missing_sub_task_reports_time_out() {
    let harness = BatchHarness::new(fan_out_settings(1), 100);
    harness.strategies.insert(strategy(1, 2, "bk_monitor", 10, &["ip"]));
    harness.source.set_points(fan_out_points());

    let report = processed(
        AccessDataProcess::new(Arc::clone(&harness.ctx), GROUP)
            .process()
            .await
            .unwrap(),
    );
    assert_eq!(report.batch_count, 3);
    assert_eq!(report.missing_sub_tasks, vec!["100.2".to_string(), "100.3".to_string()]);
    assert_eq!(report.pushed, 3);
    assert_eq!(report.checkpoint, Some(20));
    assert_eq!(harness.metrics.snapshot().batch_timeouts, 2);
}

#[tokio::test]
async fn test_sub_task_replay_is_deduplicated() {
    let harness = BatchHarness::new(fan_out_settings(1), 100);
    harness.strategies.insert(strategy(1, 2, "bk_monitor", 10, &["ip"]));
    let shard = vec![point(30, 3.0, json!({"ip": "10.0.0.1"}))];
    let key = keys::access_batch_data_key(GROUP, "100.2");

    let mut pushed = Vec::new();
    for _ in 0..2 {
        harness
            .kv
            .set(&key, &encode_shard(&shard).unwrap(), Some(keys::BATCH_DATA_TTL))
            .await
            .unwrap();
        let report = AccessBatchDataProcess::new(Arc::clone(&harness.ctx), GROUP, "100.2")
            .process()
            .await;
        assert!(report.result, "{:?}", report.error);
        pushed.push(report.process_counts.total_push_data.count);
    }
    assert_eq!(pushed, vec![1, 0]);
    assert_eq!(harness.kv.llen(&keys::data_list_key(1, 10)).await.unwrap(), 1);

    let results = keys::access_batch_data_result_key(GROUP, 100);
    assert_eq!(harness.kv.llen(&results).await.unwrap(), 2);
}

#[tokio::test]
async fn test_queue_overflow_keeps_checkpoint() {
    let settings = AccessSettings::builder()
        .num_of_count_freq_access(1)
        .time_delay(30)
        .sql_max_limit(10_000)
        .build();
    let harness = BatchHarness::new(settings, NOW);
    harness.strategies.insert(strategy(1, 2, "bk_monitor", 60, &[]));
    Checkpoint::new(Arc::clone(&harness.kv), GROUP, 60)
        .set(START)
        .await
        .unwrap();
    let queue = keys::data_list_key(1, 10);
    let backlog: Vec<String> = (0..100_001).map(|i| i.to_string()).collect();
    harness.kv.lpush(&queue, &backlog).await.unwrap();
    harness
        .source
        .set_points(vec![point(1_700_000_100, 2.0, json!({}))]);

    let result = AccessDataProcess::new(Arc::clone(&harness.ctx), GROUP)
        .process()
        .await;
    assert!(matches!(result, Err(AccessError::QueueOverflow { .. })));
    assert_eq!(harness.kv.llen(&queue).await.unwrap(), 100_001);
    assert_eq!(stored_checkpoint(&harness, 60).await, Some(START));
    assert_eq!(harness.metrics.snapshot().queue_overflows, 1);
    assert_eq!(harness.metrics.error_count("queue_overflow"), 1);
}

#[tokio::test]
async fn test_empty_and_failed_pulls_change_nothing() {
    let harness = BatchHarness::new(minute_settings(), NOW);
    harness.strategies.insert(strategy(1, 2, "bk_monitor", 60, &[]));
    Checkpoint::new(Arc::clone(&harness.kv), GROUP, 60)
        .set(START)
        .await
        .unwrap();
    let process = AccessDataProcess::new(Arc::clone(&harness.ctx), GROUP);

    let report = processed(process.process().await.unwrap());
    assert_eq!((report.pushed, report.checkpoint), (0, None));

    harness.source.set_points(vec![point(1_700_000_100, 2.0, json!({}))]);
    harness.source.set_failing(true);
    let report = processed(process.process().await.unwrap());
    assert_eq!((report.pushed, report.checkpoint), (0, None));

    assert_eq!(harness.source.calls(), 2);
    assert_eq!(stored_checkpoint(&harness, 60).await, Some(START));
    assert_eq!(harness.kv.llen(&keys::data_list_key(1, 10)).await.unwrap(), 0);
    assert_eq!(harness.kv.llen(keys::data_signal_key()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_group_has_no_items() {
    let harness = BatchHarness::new(minute_settings(), NOW);
    let outcome = AccessDataProcess::new(Arc::clone(&harness.ctx), "missing")
        .process()
        .await
        .unwrap();
    assert_eq!(outcome, AccessOutcome::NoItems);
    assert_eq!(harness.source.calls(), 0);
}

#[tokio::test]
async fn test_group_without_checkpoint_starts_from_update_time() {
    let harness = BatchHarness::new(minute_settings(), NOW);
    harness
        .strategies
        .insert(updated_at(strategy(1, 2, "bk_monitor", 60, &[]), 1_699_999_830));

    let report = processed(
        AccessDataProcess::new(Arc::clone(&harness.ctx), GROUP)
            .process()
            .await
            .unwrap(),
    );
    assert_eq!(report.from, 1_699_999_740);
    assert_eq!(report.until, 1_700_000_040);
    assert_eq!(stored_checkpoint(&harness, 60).await, None);

    // without an update time the window starts one interval before `until`
    let harness = BatchHarness::new(minute_settings(), NOW);
    harness.strategies.insert(strategy(1, 2, "bk_monitor", 60, &[]));
    let report = processed(
        AccessDataProcess::new(Arc::clone(&harness.ctx), GROUP)
            .process()
            .await
            .unwrap(),
    );
    assert_eq!(report.from, 1_699_999_980);
}

#[tokio::test]
async fn test_time_point_cap_backfills_progressively() {
    let settings = AccessSettings::builder()
        .num_of_count_freq_access(1)
        .time_delay(30)
        .max_time_points(2)
        .build();
    let harness = BatchHarness::new(settings, NOW);
    harness
        .strategies
        .insert(updated_at(strategy(1, 2, "bk_monitor", 60, &["ip"]), 1_699_999_800));
    harness.source.set_points(vec![
        point(1_699_999_800, 1.0, json!({"ip": "10.0.0.1"})),
        point(1_699_999_800, 1.0, json!({"ip": "10.0.0.2"})),
        point(1_699_999_860, 2.0, json!({"ip": "10.0.0.1"})),
        point(1_699_999_920, 3.0, json!({"ip": "10.0.0.1"})),
    ]);
    let process = AccessDataProcess::new(Arc::clone(&harness.ctx), GROUP);

    let first = processed(process.process().await.unwrap());
    assert_eq!(first.pushed, 3);
    assert_eq!(first.checkpoint, Some(1_699_999_860));
    assert_eq!(harness.metrics.snapshot().time_point_limited, 1);

    // the cut time point is picked up by the next cycle
    let second = processed(process.process().await.unwrap());
    assert_eq!(second.from, 1_699_999_800);
    assert_eq!(second.pushed, 1);
    assert_eq!(second.checkpoint, Some(1_699_999_920));
    assert_eq!(harness.kv.llen(&keys::data_list_key(1, 10)).await.unwrap(), 4);
}

#[tokio::test]
async fn test_circuit_broken_strategies_are_skipped() {
    let harness = BatchHarness::new(minute_settings(), NOW);
    harness.strategies.insert(strategy(1, 2, "bk_monitor", 60, &[]));
    harness.strategies.insert(strategy(2, 2, "bk_monitor", 60, &[]));
    Checkpoint::new(Arc::clone(&harness.kv), GROUP, 60)
        .set(START)
        .await
        .unwrap();
    harness.source.set_points(vec![
        point(1_700_000_040, 1.0, json!({})),
        point(1_700_000_100, 2.0, json!({})),
    ]);
    let rules_key = keys::circuit_breaking_key(ACCESS_DATA_MODULE);
    harness
        .kv
        .set(&rules_key, r#"[{"key": "strategy_id", "method": "eq", "value": [1]}]"#, None)
        .await
        .unwrap();
    let process = AccessDataProcess::new(Arc::clone(&harness.ctx), GROUP);

    let report = processed(process.process().await.unwrap());
    assert_eq!(report.pushed, 2);
    assert_eq!(harness.kv.llen(&keys::data_list_key(1, 10)).await.unwrap(), 0);
    assert_eq!(harness.kv.llen(&keys::data_list_key(2, 20)).await.unwrap(), 2);
    assert_eq!(harness.metrics.snapshot().circuit_broken, 1);

    harness
        .kv
        .set(&rules_key, r#"[{"key": "strategy_id", "value": [1, 2]}]"#, None)
        .await
        .unwrap();
    assert_eq!(process.process().await.unwrap(), AccessOutcome::CircuitBroken);
    assert_eq!(harness.source.calls(), 1);
}

#[tokio::test]
async fn test_partial_results_of_double_checked_strategy_are_dropped() {
    for (double_check, expected, checkpoint) in
        [(vec![1], 0, START), (vec![], 2, 1_700_000_100)]
    {
        let settings = AccessSettings::builder()
            .num_of_count_freq_access(1)
            .time_delay(30)
            .double_check_strategy_ids(double_check)
            .build();
        let harness = BatchHarness::new(settings, NOW);
        harness.strategies.insert(strategy(1, 2, "bk_monitor", 60, &[]));
        Checkpoint::new(Arc::clone(&harness.kv), GROUP, 60)
            .set(START)
            .await
            .unwrap();
        harness.source.set_points(vec![
            point(1_700_000_040, 1.0, json!({})),
            point(1_700_000_100, 2.0, json!({})),
        ]);
        harness.source.set_partial(true);

        let report = processed(
            AccessDataProcess::new(Arc::clone(&harness.ctx), GROUP)
                .process()
                .await
                .unwrap(),
        );
        assert_eq!(report.pushed, expected);
        assert_eq!(harness.kv.llen(&keys::data_list_key(1, 10)).await.unwrap(), expected);
        assert_eq!(stored_checkpoint(&harness, 60).await, Some(checkpoint));
    }
}
