//! Records flowing through access
//!
//! - [`KafkaPayload`]: the wire value of a real-time Kafka record
//! - [`RawRecord`]: a flat point, as returned by a data source or flattened from Kafka
//! - [`DataRecord`]: the working record with filter/dedup/priority marks

use crate::error::{AccessError, AccessResult};
use crate::strategy::{ExpandedPoint, ItemId, StrategyItem};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Time field of data-source points
pub const TIME_FIELD: &str = "_time_";
/// Value field of data-source points
pub const RESULT_FIELD: &str = "_result_";
/// Write time of BK-data points
pub const LOCAL_TIME_FIELD: &str = "_localTime";

/// Timestamps above this are milliseconds
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Stable short hash of any serializable value
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> String {
    let encoded = serde_json::to_vec(value).unwrap_or_default();
    let mut hex = format!("{:x}", Sha256::digest(&encoded));
    hex.truncate(32);
    hex
}

/// Kafka record value: `{"metrics": {...}, "dimensions": {...}, "time": ...}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KafkaPayload {
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub dimensions: Map<String, Value>,
    pub time: i64,
}

impl KafkaPayload {
    /// Decode a record value, tolerating one trailing NUL or newline
    pub fn decode(bytes: &[u8]) -> AccessResult<Self> {
        let bytes = match bytes.last() {
            Some(b'\0') | Some(b'\n') => &bytes[..bytes.len() - 1],
            _ => bytes,
        };
        serde_json::from_slice(bytes).map_err(|e| AccessError::Decode(e.to_string()))
    }

    /// Owning business, 0 when absent or unparsable
    pub fn bk_biz_id(&self) -> i64 {
        match self.dimensions.get("bk_biz_id") {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }

    /// Union of time, metrics and dimensions
    pub fn flatten(&self) -> RawRecord {
        let mut flat = Map::with_capacity(1 + self.metrics.len() + self.dimensions.len());
        flat.insert("time".to_string(), Value::from(self.time));
        for (k, v) in self.metrics.iter().chain(self.dimensions.iter()) {
            flat.insert(k.clone(), v.clone());
        }
        RawRecord(flat)
    }
}

/// A flat key/value point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub Map<String, Value>);

impl RawRecord {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Point time in seconds, read from `_time_` or `time`
    pub fn time(&self) -> Option<i64> {
        let raw = self.get(TIME_FIELD).or_else(|| self.get("time"))?;
        let ts = match raw {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        Some(if ts > MILLIS_THRESHOLD { ts / 1000 } else { ts })
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        match self.get(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn dimension_value(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn dimensions(&self, keys: &[String]) -> BTreeMap<String, String> {
        keys.iter()
            .filter_map(|k| self.dimension_value(k).map(|v| (k.clone(), v)))
            .collect()
    }
}

/// The working record inside one handler iteration or batch cycle
#[derive(Debug, Clone)]
pub struct DataRecord {
    pub time: i64,
    pub value: Option<f64>,
    pub metric_field: String,
    pub dimensions: BTreeMap<String, String>,
    pub items: Vec<Arc<StrategyItem>>,
    pub is_duplicate: bool,
    pub is_retains: HashMap<ItemId, bool>,
    pub inhibitions: HashMap<ItemId, bool>,
}

impl DataRecord {
    fn new(
        time: i64,
        value: Option<f64>,
        metric_field: String,
        dimensions: BTreeMap<String, String>,
        items: Vec<Arc<StrategyItem>>,
    ) -> Self {
        let is_retains = items.iter().map(|i| (i.item_id(), true)).collect();
        let inhibitions = items.iter().map(|i| (i.item_id(), false)).collect();
        Self {
            time,
            value,
            metric_field,
            dimensions,
            items,
            is_duplicate: false,
            is_retains,
            inhibitions,
        }
    }

    /// Build a record from a data-source point shared by a strategy group
    pub fn from_point(items: &[Arc<StrategyItem>], raw: &RawRecord) -> AccessResult<Self> {
        let first = items
            .first()
            .ok_or_else(|| AccessError::Internal("record without items".to_string()))?;
        let time = raw
            .time()
            .ok_or_else(|| AccessError::Decode(format!("point without time: {:?}", raw.0)))?;
        let qc = first.item().query_configs.first();
        let metric_field = qc.map(|q| q.metric_field.clone()).unwrap_or_default();
        let value = raw.number(RESULT_FIELD).or_else(|| raw.number(&metric_field));
        let dimensions = raw.dimensions(first.item().agg_dimensions());
        Ok(Self::new(time, value, metric_field, dimensions, items.to_vec()))
    }

    /// Build a record from one expanded real-time point
    pub fn from_expanded(item: Arc<StrategyItem>, point: ExpandedPoint) -> Self {
        Self::new(
            point.time,
            point.value,
            point.metric_field,
            point.dimensions,
            vec![item],
        )
    }

    pub fn dimension_hash(&self) -> String {
        fingerprint(&self.dimensions)
    }

    /// Identity used by the duplicate oracle
    pub fn record_id(&self) -> String {
        format!("{}.{}", self.dimension_hash(), self.time)
    }

    /// Whether the record should reach the detector queue of `item_id`
    pub fn is_pushable(&self, item_id: ItemId) -> bool {
        !self.is_duplicate
            && self.is_retains.get(&item_id).copied().unwrap_or(false)
            && !self.inhibitions.get(&item_id).copied().unwrap_or(false)
    }

    /// Drop a record for every item it belongs to
    pub fn drop_all(&mut self) {
        for retain in self.is_retains.values_mut() {
            *retain = false;
        }
    }

    /// Normalize value types and canonicalize dimension keys
    pub fn clean(&mut self) {
        if self.value.is_some_and(|v| !v.is_finite()) {
            self.value = None;
        }
        let dimensions = std::mem::take(&mut self.dimensions);
        for (key, value) in dimensions {
            self.dimensions
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        for (alias, canonical) in [("ip", "bk_target_ip"), ("bk_cloud_id", "bk_target_cloud_id")] {
            if let Some(value) = self.dimensions.get(alias).cloned() {
                self.dimensions.entry(canonical.to_string()).or_insert(value);
            }
        }
    }

    /// Detector wire format for one item
    pub fn to_detector_json(&self, item: &StrategyItem) -> Value {
        json!({
            "record_id": self.record_id(),
            "value": self.value,
            "values": {
                "time": self.time,
                self.metric_field.as_str(): self.value,
            },
            "dimensions": self.dimensions,
            "time": self.time,
            "strategy_id": item.strategy_id(),
            "item_id": item.item_id(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_tolerates_trailing_bytes() {
        let body = br#"{"metrics": {"load1": 2.5}, "dimensions": {"bk_biz_id": 2, "ip": "127.0.0.1"}, "time": 1573701305}"#;
        for suffix in ["", "\0", "\n"] {
            let mut bytes = body.to_vec();
            bytes.extend_from_slice(suffix.as_bytes());
            let payload = KafkaPayload::decode(&bytes).unwrap();
            assert_eq!(payload.bk_biz_id(), 2);
            assert_eq!(payload.time, 1573701305);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            KafkaPayload::decode(b"not json"),
            Err(AccessError::Decode(_))
        ));
    }

    #[test]
    fn test_bk_biz_id_variants() {
        let payload = KafkaPayload::decode(br#"{"dimensions": {"bk_biz_id": "7"}, "time": 1}"#).unwrap();
        assert_eq!(payload.bk_biz_id(), 7);
        let payload = KafkaPayload::decode(br#"{"dimensions": {}, "time": 1}"#).unwrap();
        assert_eq!(payload.bk_biz_id(), 0);
    }

    #[test]
    fn test_flatten() {
        let payload = KafkaPayload::decode(
            br#"{"metrics": {"load5": 2.56}, "dimensions": {"bk_biz_id": 2, "bk_target_ip": "127.0.0.1"}, "time": 1573701305}"#,
        )
        .unwrap();
        let flat = payload.flatten();
        assert_eq!(flat.time(), Some(1573701305));
        assert_eq!(flat.number("load5"), Some(2.56));
        assert_eq!(
            flat.dimension_value("bk_target_ip"),
            Some("127.0.0.1".to_string())
        );
        assert_eq!(flat.dimension_value("bk_biz_id"), Some("2".to_string()));
    }

    #[test]
    fn test_millisecond_time_is_normalized() {
        let raw = RawRecord(
            serde_json::from_str(r#"{"_time_": 1700000040000, "_result_": 1.0}"#).unwrap(),
        );
        assert_eq!(raw.time(), Some(1700000040));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let mut dims = BTreeMap::new();
        dims.insert("ip".to_string(), "1.1.1.1".to_string());
        assert_eq!(fingerprint(&dims), fingerprint(&dims.clone()));
        assert_eq!(fingerprint(&dims).len(), 32);
    }
}
