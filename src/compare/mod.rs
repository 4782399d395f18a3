//! Ignore-aware structural comparison of response headers and bodies.
//!
//! Both operations work on JSON values. Before looking at the payloads, every
//! ignore path is removed from both sides and, for headers, every object key
//! is lower-cased. Payloads are compared through their canonical form: keys
//! sorted and integral floats written as integers, so neither key order nor
//! `1.0` versus `1` matters.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use similar::{ChangeTag, TextDiff};

use crate::error::CompareError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkTag {
    Unchanged,
    Added,
    Removed,
}

/// A run of consecutive lines sharing the same tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffChunk {
    pub tag: ChunkTag,
    pub value: String,
}

impl DiffChunk {
    pub fn is_change(&self) -> bool {
        self.tag != ChunkTag::Unchanged
    }
}

/// `true` when both payloads are equal after ignore paths are removed.
///
/// Payloads of different kinds (object/array vs. scalar) never compare equal.
pub fn compare(
    left: &Value,
    right: &Value,
    ignore_paths: &[String],
    case_insensitive_keys: bool,
) -> bool {
    if ensure_same_kind(left, right).is_err() {
        return false;
    }

    let left = prepare(left, ignore_paths, case_insensitive_keys);
    let right = prepare(right, ignore_paths, case_insensitive_keys);
    canonicalize(&left) == canonicalize(&right)
}

/// Line diff of both payloads after the same preprocessing as [`compare`].
pub fn diff(
    left: &Value,
    right: &Value,
    ignore_paths: &[String],
    case_insensitive_keys: bool,
) -> Result<Vec<DiffChunk>, CompareError> {
    ensure_same_kind(left, right)?;

    let left = render(&prepare(left, ignore_paths, case_insensitive_keys));
    let right = render(&prepare(right, ignore_paths, case_insensitive_keys));
    Ok(line_chunks(&left, &right))
}

fn ensure_same_kind(left: &Value, right: &Value) -> Result<(), CompareError> {
    let (left_kind, right_kind) = (kind(left), kind(right));
    if left_kind != right_kind {
        return Err(CompareError::KindMismatch {
            left: left_kind,
            right: right_kind,
        });
    }
    Ok(())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Object(_) | Value::Array(_) => "object",
        _ => "scalar",
    }
}

fn prepare(value: &Value, ignore_paths: &[String], case_insensitive_keys: bool) -> Value {
    let mut value = if case_insensitive_keys {
        lowercase_keys(value)
    } else {
        value.clone()
    };

    for path in ignore_paths {
        let path = if case_insensitive_keys {
            path.to_lowercase()
        } else {
            path.clone()
        };
        remove_path(&mut value, &path);
    }

    value
}

/// Removes a dot-separated path. Numeric segments index into arrays on the
/// way down; the last segment only ever removes an object key. Missing paths
/// are ignored.
pub fn remove_path(value: &mut Value, path: &str) -> bool {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut current = value;
    for segment in parents {
        current = match current {
            Value::Object(map) => match map.get_mut(*segment) {
                Some(next) => next,
                None => return false,
            },
            Value::Array(items) => {
                match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                    Some(next) => next,
                    None => return false,
                }
            }
            _ => return false,
        };
    }

    match current {
        Value::Object(map) => map.remove(*last).is_some(),
        _ => false,
    }
}

/// Lower-cases every object key recursively. Values are left untouched.
pub fn lowercase_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.to_lowercase(), lowercase_keys(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(lowercase_keys).collect()),
        other => other.clone(),
    }
}

/// Recursively key-sorted copy of a value. Floats without a fractional part
/// become integers, so `1.0` and `1` share one canonical form.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key.clone(), canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(number) => Value::Number(integral(number).unwrap_or_else(|| number.clone())),
        other => other.clone(),
    }
}

fn integral(number: &Number) -> Option<Number> {
    let float = number.as_f64().filter(|_| number.is_f64())?;
    if !float.is_finite() || float.fract() != 0.0 {
        return None;
    }
    if float >= 0.0 && float < u64::MAX as f64 {
        Some(Number::from(float as u64))
    } else if float < 0.0 && float >= i64::MIN as f64 {
        Some(Number::from(float as i64))
    } else {
        None
    }
}

/// Compact canonical serialization, stable across runs.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Object(_) | Value::Array(_) => {
            let canonical = canonicalize(value);
            serde_json::to_string_pretty(&canonical).unwrap_or_else(|_| canonical.to_string())
        }
        other => canonicalize(other).to_string(),
    }
}

fn line_chunks(left: &str, right: &str) -> Vec<DiffChunk> {
    let text_diff = TextDiff::from_lines(left, right);
    let mut chunks: Vec<DiffChunk> = Vec::new();

    for change in text_diff.iter_all_changes() {
        let tag = match change.tag() {
            ChangeTag::Equal => ChunkTag::Unchanged,
            ChangeTag::Insert => ChunkTag::Added,
            ChangeTag::Delete => ChunkTag::Removed,
        };
        match chunks.last_mut() {
            Some(chunk) if chunk.tag == tag => chunk.value.push_str(change.value()),
            _ => chunks.push(DiffChunk {
                tag,
                value: change.value().to_string(),
            }),
        }
    }

    chunks
}
