//! Splitting one pull into sub-task shards

use crate::error::{AccessError, AccessResult};
use crate::record::RawRecord;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Id of shard `index` (1-based) of the split started at `timestamp`
pub fn sub_task_id(timestamp: i64, index: usize) -> String {
    format!("{}.{}", timestamp, index)
}

/// Split timestamp of a sub-task id
pub fn parse_sub_task_id(sub_task_id: &str) -> AccessResult<(i64, usize)> {
    let invalid = || AccessError::Internal(format!("invalid sub task id: {}", sub_task_id));
    let (timestamp, index) = sub_task_id.split_once('.').ok_or_else(invalid)?;
    Ok((
        timestamp.parse().map_err(|_| invalid())?,
        index.parse().map_err(|_| invalid())?,
    ))
}

/// Cut `points` into shards.
///
/// Nothing is split unless there are more than `threshold` points and
/// `threshold > 0`. Once more than `batch_size` points have been walked, every
/// change of timestamp closes a shard; a run of equal timestamps always stays
/// in one shard.
pub fn split_points(points: Vec<RawRecord>, threshold: usize, batch_size: usize) -> Vec<Vec<RawRecord>> {
    if threshold == 0 || points.len() <= threshold {
        return vec![points];
    }

    let times: Vec<Option<i64>> = points.iter().map(RawRecord::time).collect();
    let mut shards = Vec::new();
    let mut current = Vec::new();
    let last = points.len() - 1;
    for (index, point) in points.into_iter().enumerate() {
        current.push(point);
        let boundary = index < last && index + 1 > batch_size && times[index] != times[index + 1];
        if boundary {
            shards.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        shards.push(current);
    }
    shards
}

/// gzip + base64 of the JSON array of points
pub fn encode_shard(points: &[RawRecord]) -> AccessResult<String> {
    let json = serde_json::to_vec(points)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(STANDARD.encode(encoder.finish()?))
}

pub fn decode_shard(encoded: &str) -> AccessResult<Vec<RawRecord>> {
    let compressed = STANDARD
        .decode(encoded.trim())
        .map_err(|e| AccessError::Decode(format!("shard is not base64: {}", e)))?;
    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn points(times: &[i64]) -> Vec<RawRecord> {
        times
            .iter()
            .map(|t| serde_json::from_value(json!({"_time_": t, "_result_": 1.0})).unwrap())
            .collect()
    }

    fn shard_times(shards: &[Vec<RawRecord>]) -> Vec<Vec<i64>> {
        shards
            .iter()
            .map(|s| s.iter().filter_map(RawRecord::time).collect())
            .collect()
    }

    #[rstest]
    #[case::three_shards(&[10, 10, 20, 30, 40], 2, 2, vec![vec![10, 10, 20], vec![30], vec![40]])]
    #[case::exactly_threshold(&[10, 20], 2, 1, vec![vec![10, 20]])]
    #[case::single_bucket(&[10, 10, 10], 2, 1, vec![vec![10, 10, 10]])]
    #[case::disabled(&[10, 20, 30, 40], 0, 1, vec![vec![10, 20, 30, 40]])]
    #[case::bucket_spans_size(&[10, 20, 20, 20, 30], 1, 2, vec![vec![10, 20, 20, 20], vec![30]])]
    fn test_split_points(
        #[case] times: &[i64],
        #[case] threshold: usize,
        #[case] batch_size: usize,
        #[case] expected: Vec<Vec<i64>>,
    ) {
        let shards = split_points(points(times), threshold, batch_size);
        assert_eq!(shard_times(&shards), expected);
    }

    #[test]
    fn test_shard_codec() {
        let original = points(&[10, 20]);
        let encoded = encode_shard(&original).unwrap();
        assert_eq!(decode_shard(&encoded).unwrap(), original);
        assert!(matches!(decode_shard("%%%"), Err(AccessError::Decode(_))));
    }

    #[test]
    fn test_sub_task_id() {
        assert_eq!(sub_task_id(1700000000, 2), "1700000000.2");
        assert_eq!(parse_sub_task_id("1700000000.2").unwrap(), (1700000000, 2));
        assert!(parse_sub_task_id("nope").is_err());
    }
}
