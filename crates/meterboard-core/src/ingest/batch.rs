//! Wire shapes of a traffic push
//!
//! Nodes send either
//! - an array of `[subscriber_id, [upload, download]]` pairs, or
//! - an object mapping the stringified subscriber id to `[upload, download]`.
//!
//! Both normalize to the same `TrafficReport` sequence. Bad items are counted
//! and skipped. A scalar top level counts as one bad item.

use crate::models::{SubscriberId, TrafficReport};
use serde_json::{Map, Value};

/// A raw batch, classified by shape but not yet validated per item
#[derive(Debug, Clone, PartialEq)]
pub enum TrafficBatch {
    Array(Vec<Value>),
    Object(Map<String, Value>),
    /// Any other JSON value; normalizes to a single malformed item
    Scalar(Value),
}

/// Reports that parsed, plus a description of each item that didn't
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub reports: Vec<TrafficReport>,
    pub malformed: Vec<String>,
}

impl TrafficBatch {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(items) => TrafficBatch::Array(items),
            Value::Object(items) => TrafficBatch::Object(items),
            other => TrafficBatch::Scalar(other),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TrafficBatch::Array(items) => items.len(),
            TrafficBatch::Object(items) => items.len(),
            TrafficBatch::Scalar(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse every item; one bad item never discards the rest
    pub fn normalize(&self) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();

        match self {
            TrafficBatch::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    match parse_pair(item) {
                        Ok(report) => batch.reports.push(report),
                        Err(reason) => batch.malformed.push(format!("item {index}: {reason}")),
                    }
                }
            }
            TrafficBatch::Object(items) => {
                for (key, counters) in items {
                    let parsed = key
                        .trim()
                        .parse::<SubscriberId>()
                        .map_err(|_| "subscriber id is not an unsigned integer".to_string())
                        .and_then(|id| parse_counters(id, counters));
                    match parsed {
                        Ok(report) => batch.reports.push(report),
                        Err(reason) => batch.malformed.push(format!("key {key:?}: {reason}")),
                    }
                }
            }
            TrafficBatch::Scalar(value) => batch.malformed.push(format!(
                "payload: expected an array or an object, got {}",
                kind(value)
            )),
        }

        batch
    }
}

fn parse_pair(item: &Value) -> std::result::Result<TrafficReport, String> {
    let pair = match item.as_array() {
        Some(pair) if pair.len() == 2 => pair,
        Some(pair) => return Err(format!("expected 2 elements, got {}", pair.len())),
        None => return Err(format!("expected a pair, got {}", kind(item))),
    };

    let subscriber_id = pair[0]
        .as_u64()
        .or_else(|| {
            pair[0]
                .as_f64()
                .filter(|f| (0.0..=MAX_EXACT_FLOAT_ID).contains(f) && f.fract() == 0.0)
                .map(|f| f as u64)
        })
        .ok_or_else(|| "subscriber id is not an unsigned integer".to_string())?;

    parse_counters(subscriber_id, &pair[1])
}

fn parse_counters(
    subscriber_id: SubscriberId,
    counters: &Value,
) -> std::result::Result<TrafficReport, String> {
    match counters.as_array().map(Vec::as_slice) {
        Some([upload, download]) => Ok(TrafficReport {
            subscriber_id,
            upload: byte_count(upload).ok_or("upload is not a non-negative number")?,
            download: byte_count(download).ok_or("download is not a non-negative number")?,
        }),
        Some(other) => Err(format!("expected [upload, download], got {} values", other.len())),
        None => Err(format!("expected [upload, download], got {}", kind(counters))),
    }
}

/// Largest float that still names exactly one integer id (2^53 - 1)
const MAX_EXACT_FLOAT_ID: f64 = 9_007_199_254_740_991.0;

/// 2^64; floats at or above it would saturate
const U64_RANGE_END: f64 = 18_446_744_073_709_551_616.0;

/// Byte counters may arrive as floats; fractions are dropped
fn byte_count(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|f| *f >= 0.0 && *f < U64_RANGE_END)
            .map(|f| f.floor() as u64)
    })
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(subscriber_id: u64, upload: u64, download: u64) -> TrafficReport {
        TrafficReport {
            subscriber_id,
            upload,
            download,
        }
    }

    #[test]
    fn test_both_shapes_normalize_identically() {
        let array = TrafficBatch::from_value(json!([[1, [100, 200]], [2, [0, 5]]]));
        let object = TrafficBatch::from_value(json!({"1": [100, 200], "2": [0, 5]}));

        let mut from_array = array.normalize().reports;
        let mut from_object = object.normalize().reports;
        from_array.sort_by_key(|r| r.subscriber_id);
        from_object.sort_by_key(|r| r.subscriber_id);

        assert_eq!(from_array, vec![report(1, 100, 200), report(2, 0, 5)]);
        assert_eq!(from_array, from_object);
    }

    #[test]
    fn test_malformed_items_are_skipped_individually() {
        let batch = TrafficBatch::from_value(json!([
            [1, [10, 20]],
            [2, [10]],
            ["3", [1, 1]],
            [4, ["a", 1]],
            [5, [-1, 1]],
            7,
            [6, [1.9, 2.0]],
            [8, [1, 1], 9]
        ]));

        let normalized = batch.normalize();
        assert_eq!(normalized.reports, vec![report(1, 10, 20), report(6, 1, 2)]);
        assert_eq!(normalized.malformed.len(), 6);
        assert!(normalized.malformed[0].starts_with("item 1"));
    }

    #[test]
    fn test_object_form_rejects_bad_keys() {
        let batch = TrafficBatch::from_value(json!({"abc": [1, 1], "-4": [1, 1], "9": [3, 4]}));
        let normalized = batch.normalize();
        assert_eq!(normalized.reports, vec![report(9, 3, 4)]);
        assert_eq!(normalized.malformed.len(), 2);
    }

    #[test]
    fn test_out_of_range_floats_are_malformed() {
        let batch = TrafficBatch::from_value(json!([
            [1e20, [1, 1]],
            [9007199254740993.0, [1, 1]],
            [2, [1e30, 1]],
            [3.0, [2.5, 1]]
        ]));
        let normalized = batch.normalize();
        assert_eq!(normalized.reports, vec![report(3, 2, 1)]);
        assert_eq!(normalized.malformed.len(), 3);
    }

    #[test]
    fn test_scalar_top_level_is_one_malformed_item() {
        assert!(TrafficBatch::from_value(json!([])).is_empty());

        for value in [json!(42), json!("x"), json!(true), Value::Null] {
            let batch = TrafficBatch::from_value(value);
            assert_eq!(batch.len(), 1);
            let normalized = batch.normalize();
            assert!(normalized.reports.is_empty());
            assert_eq!(normalized.malformed.len(), 1);
            assert!(normalized.malformed[0].starts_with("payload: expected an array"));
        }
    }
}
