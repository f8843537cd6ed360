//! External time-series queries used by the batch path

use crate::error::{AccessError, AccessResult};
use crate::record::{RawRecord, LOCAL_TIME_FIELD, RESULT_FIELD, TIME_FIELD};
use crate::strategy::{DataSourceLabel, Item};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

const LOCAL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One pull over `[from, until)` for the queries of an item
#[derive(Debug, Clone)]
pub struct QueryRequest<'a> {
    pub item: &'a Item,
    pub from: i64,
    pub until: i64,
    /// Ask BK-data sources for the per-point write time as `_localTime`
    pub include_local_time: bool,
}

/// Result of one pull
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    /// Points carrying `_time_` plus `_result_` or the metric field
    pub points: Vec<RawRecord>,
    /// Some storage shards did not answer; the points may be incomplete
    pub is_partial: bool,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn query(&self, request: QueryRequest<'_>) -> AccessResult<QueryOutput>;
}

/// Client for the unified time-series query API
pub struct UnifyQueryClient {
    client: Client,
    url: String,
}

impl UnifyQueryClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> AccessResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AccessError::DataSource(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    fn body(request: &QueryRequest<'_>) -> Value {
        let query_list: Vec<Value> = request
            .item
            .query_configs
            .iter()
            .enumerate()
            .map(|(index, qc)| {
                json!({
                    "reference_name": reference_name(index),
                    "data_source": qc.data_source_label,
                    "table_id": qc.result_table_id,
                    "field_name": qc.metric_field,
                    "function": [{
                        "method": qc.agg_method.to_lowercase(),
                        "dimensions": qc.agg_dimension,
                    }],
                    "conditions": qc.agg_condition,
                    "step": format!("{}s", qc.agg_interval),
                })
            })
            .collect();
        json!({
            "query_list": query_list,
            "metric_merge": reference_name(0),
            "start_time": request.from.to_string(),
            "end_time": request.until.to_string(),
            "include_local_time": request.include_local_time,
        })
    }
}

fn reference_name(index: usize) -> String {
    char::from(b'a' + (index % 26) as u8).to_string()
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    is_partial: bool,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    group_keys: Vec<String>,
    #[serde(default)]
    group_values: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

impl Series {
    /// One point per row; the first column is the time in milliseconds
    fn into_records(self) -> Vec<RawRecord> {
        let dims: Map<String, Value> = self
            .group_keys
            .into_iter()
            .zip(self.group_values)
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        let columns = self.columns;
        self.values
            .into_iter()
            .filter_map(|row| {
                let mut point = dims.clone();
                let mut cells = row.into_iter();
                let time = cells.next()?.as_i64()?;
                point.insert(TIME_FIELD.to_string(), Value::from(time / 1000));
                for (column, cell) in columns.iter().skip(1).zip(cells) {
                    let name = match column.as_str() {
                        "_value" => RESULT_FIELD,
                        "_localTime" | "localTime" => LOCAL_TIME_FIELD,
                        other => other,
                    };
                    point.insert(name.to_string(), cell);
                }
                Some(RawRecord(point))
            })
            .collect()
    }
}

#[async_trait]
impl DataSource for UnifyQueryClient {
    async fn query(&self, request: QueryRequest<'_>) -> AccessResult<QueryOutput> {
        let body = Self::body(&request);
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AccessError::DataSource(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AccessError::DataSource(format!(
                "query returned {}",
                response.status()
            )));
        }
        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| AccessError::DataSource(e.to_string()))?;
        let is_partial = parsed.is_partial;
        let records: Vec<RawRecord> = parsed
            .series
            .into_iter()
            .flat_map(Series::into_records)
            .collect();
        debug!(
            from = request.from,
            until = request.until,
            points = records.len(),
            is_partial,
            "Unify query done"
        );
        Ok(QueryOutput {
            points: records,
            is_partial,
        })
    }
}

/// Whether an item pulls from BK-data and therefore reports `_localTime`
pub fn needs_local_time(item: &Item) -> bool {
    item.query_configs
        .iter()
        .any(|qc| qc.data_source_label == DataSourceLabel::BkData)
}

/// Strip `_localTime` from every point and return the latest write time per
/// point time, ascending by point time.
///
/// The write time is machine local time of the data platform; it is shifted by
/// `timezone_offset_hours` to get epoch seconds.
pub fn take_local_times(records: &mut [RawRecord], timezone_offset_hours: i64) -> Vec<(i64, i64)> {
    let mut latest: BTreeMap<i64, i64> = BTreeMap::new();
    for record in records.iter_mut() {
        let Some(Value::String(raw)) = record.remove(LOCAL_TIME_FIELD) else {
            continue;
        };
        let Some(point_time) = record.time() else {
            continue;
        };
        let Ok(local) = NaiveDateTime::parse_from_str(raw.trim(), LOCAL_TIME_FORMAT) else {
            continue;
        };
        let local = local.and_utc().timestamp();
        let entry = latest.entry(point_time).or_insert(local);
        *entry = (*entry).max(local);
    }
    let shift = timezone_offset_hours * 3600;
    latest.into_iter().map(|(t, l)| (t, l + shift)).collect()
}

/// A data source serving canned points, for tests and dry runs
#[derive(Default)]
pub struct StaticDataSource {
    points: Mutex<Vec<RawRecord>>,
    fail: AtomicBool,
    partial: AtomicBool,
    calls: AtomicUsize,
}

impl StaticDataSource {
    pub fn new(points: Vec<RawRecord>) -> Self {
        Self {
            points: Mutex::new(points),
            ..Default::default()
        }
    }

    pub fn set_points(&self, points: Vec<RawRecord>) {
        *self.points.lock() = points;
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Flag every following answer as partial
    pub fn set_partial(&self, partial: bool) {
        self.partial.store(partial, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for StaticDataSource {
    async fn query(&self, _request: QueryRequest<'_>) -> AccessResult<QueryOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AccessError::DataSource("scripted failure".to_string()));
        }
        Ok(QueryOutput {
            points: self.points.lock().clone(),
            is_partial: self.partial.load(Ordering::SeqCst),
        })
    }
}
