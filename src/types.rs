//! Core data types for the downsample engine
//!
//! # Key Types
//!
//! - **`Tsid`**: Opaque, totally ordered series identifier that decodes to
//!   the series' dimension name/value pairs
//! - **`DimensionValue`**: A single dimension value carried inside a tsid
//! - **`FieldValue`**: A typed doc-values entry for a metric or label field
//! - **`DocId`**: Per-leaf document identifier handed out by the iterator
//! - **`ShardId`**: Source index name plus shard number

use serde::{Deserialize, Serialize};
use std::fmt;

/// Millisecond-precision epoch timestamp
pub type TimestampMs = i64;

/// Per-leaf document identifier
pub type DocId = u32;

/// Identifies one shard of the source index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardId {
    /// Source index name
    pub index: String,
    /// Shard number within the index
    pub shard: u32,
}

impl ShardId {
    /// Create a new shard id
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// A dimension value decoded from a tsid
///
/// Dimensions preserve their source type when written to the rollup
/// document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimensionValue {
    /// String-typed dimension
    Keyword(String),
    /// Integer-typed dimension
    Integer(i64),
    /// Boolean-typed dimension
    Boolean(bool),
}

impl DimensionValue {
    /// Convert to a JSON value for rollup document output
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DimensionValue::Keyword(s) => serde_json::Value::from(s.clone()),
            DimensionValue::Integer(v) => serde_json::Value::from(*v),
            DimensionValue::Boolean(b) => serde_json::Value::from(*b),
        }
    }
}

impl From<&str> for DimensionValue {
    fn from(s: &str) -> Self {
        DimensionValue::Keyword(s.to_string())
    }
}

impl From<i64> for DimensionValue {
    fn from(v: i64) -> Self {
        DimensionValue::Integer(v)
    }
}

impl From<bool> for DimensionValue {
    fn from(b: bool) -> Self {
        DimensionValue::Boolean(b)
    }
}

// Value type tags used in the tsid wire format.
const TAG_KEYWORD: u8 = 1;
const TAG_INTEGER: u8 = 2;
const TAG_BOOLEAN: u8 = 3;

/// Opaque time-series identifier
///
/// A tsid encodes all dimension name/value pairs of one series into a byte
/// sequence. Two tsids compare as unsigned bytes, which gives the total
/// order the iterator contract is built on. The encoded form is
/// self-describing and can be decoded back into dimensions when a rollup
/// document is serialized.
///
/// The engine always owns its copy of the bytes; iterators are free to
/// reuse their buffers between documents.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tsid(Vec<u8>);

impl Tsid {
    /// Build a tsid from dimension name/value pairs
    ///
    /// Pairs are sorted by name before encoding so that logically equal
    /// dimension sets always produce byte-equal tsids.
    pub fn from_dimensions<'a, I>(dimensions: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, DimensionValue)>,
    {
        let mut pairs: Vec<(&str, DimensionValue)> = dimensions.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));

        let mut buf = Vec::new();
        for (name, value) in pairs {
            write_slice(&mut buf, name.as_bytes());
            match value {
                DimensionValue::Keyword(s) => {
                    buf.push(TAG_KEYWORD);
                    write_slice(&mut buf, s.as_bytes());
                }
                DimensionValue::Integer(v) => {
                    buf.push(TAG_INTEGER);
                    buf.extend_from_slice(&v.to_be_bytes());
                }
                DimensionValue::Boolean(b) => {
                    buf.push(TAG_BOOLEAN);
                    buf.push(u8::from(b));
                }
            }
        }
        Self(buf)
    }

    /// Wrap raw tsid bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The encoded bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode the dimension name/value pairs carried by this tsid
    ///
    /// Returns pairs in encoded (name-sorted) order.
    pub fn decode_dimensions(&self) -> Result<Vec<(String, DimensionValue)>, String> {
        let mut pairs = Vec::new();
        let mut pos = 0;
        let bytes = &self.0;

        while pos < bytes.len() {
            let name = read_slice(bytes, &mut pos)?;
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| format!("dimension name at offset {pos} is not valid UTF-8"))?;

            let tag = *bytes
                .get(pos)
                .ok_or_else(|| format!("truncated value tag for dimension {name}"))?;
            pos += 1;

            let value = match tag {
                TAG_KEYWORD => {
                    let raw = read_slice(bytes, &mut pos)?;
                    let s = String::from_utf8(raw.to_vec())
                        .map_err(|_| format!("dimension {name} value is not valid UTF-8"))?;
                    DimensionValue::Keyword(s)
                }
                TAG_INTEGER => {
                    let raw = read_fixed::<8>(bytes, &mut pos)
                        .ok_or_else(|| format!("truncated integer value for dimension {name}"))?;
                    DimensionValue::Integer(i64::from_be_bytes(raw))
                }
                TAG_BOOLEAN => {
                    let raw = read_fixed::<1>(bytes, &mut pos)
                        .ok_or_else(|| format!("truncated boolean value for dimension {name}"))?;
                    DimensionValue::Boolean(raw[0] != 0)
                }
                other => return Err(format!("unknown value tag {other} for dimension {name}")),
            };
            pairs.push((name, value));
        }

        Ok(pairs)
    }
}

impl fmt::Debug for Tsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Tsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

fn write_slice(buf: &mut Vec<u8>, slice: &[u8]) {
    let len = slice.len().min(u16::MAX as usize) as u16;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&slice[..len as usize]);
}

fn read_slice<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<&'a [u8], String> {
    let len_raw =
        read_fixed::<2>(bytes, pos).ok_or_else(|| format!("truncated length at offset {pos}"))?;
    let len = u16::from_be_bytes(len_raw) as usize;
    if *pos + len > bytes.len() {
        return Err(format!("truncated slice of length {len} at offset {pos}"));
    }
    let slice = &bytes[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

fn read_fixed<const N: usize>(bytes: &[u8], pos: &mut usize) -> Option<[u8; N]> {
    let slice = bytes.get(*pos..*pos + N)?;
    *pos += N;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Some(out)
}

/// A typed doc-values entry for a metric or label field
///
/// Metric producers only consume numeric variants; label producers pass any
/// variant through unchanged, preserving the source type.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Floating-point value
    Double(f64),
    /// Integer value
    Integer(i64),
    /// String value
    Keyword(String),
    /// Boolean value
    Boolean(bool),
}

impl FieldValue {
    /// Numeric view of this value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Double(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Keyword(_) | FieldValue::Boolean(_) => None,
        }
    }

    /// Convert to a JSON value for rollup document output
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Double(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FieldValue::Integer(v) => serde_json::Value::from(*v),
            FieldValue::Keyword(s) => serde_json::Value::from(s.clone()),
            FieldValue::Boolean(b) => serde_json::Value::from(*b),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Double(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Keyword(s.to_string())
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Boolean(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tsid_roundtrip() {
        let tsid = Tsid::from_dimensions([
            ("host", DimensionValue::from("server1")),
            ("port", DimensionValue::from(9200i64)),
            ("prod", DimensionValue::from(true)),
        ]);

        let dims = tsid.decode_dimensions().unwrap();
        assert_eq!(
            dims,
            vec![
                ("host".to_string(), DimensionValue::from("server1")),
                ("port".to_string(), DimensionValue::from(9200i64)),
                ("prod".to_string(), DimensionValue::from(true)),
            ]
        );
    }

    #[test]
    fn test_tsid_dimension_order_is_canonical() {
        let a = Tsid::from_dimensions([
            ("b", DimensionValue::from("2")),
            ("a", DimensionValue::from("1")),
        ]);
        let b = Tsid::from_dimensions([
            ("a", DimensionValue::from("1")),
            ("b", DimensionValue::from("2")),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_tsid_ordering_is_byte_lexicographic() {
        let a = Tsid::from_bytes(vec![0x00, 0x01]);
        let b = Tsid::from_bytes(vec![0x00, 0x02]);
        let c = Tsid::from_bytes(vec![0xff]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_tsid_decode_rejects_garbage() {
        let tsid = Tsid::from_bytes(vec![0x00, 0x02, b'h']);
        assert!(tsid.decode_dimensions().is_err());
    }

    #[test]
    fn test_field_value_as_f64() {
        assert_eq!(FieldValue::from(1.5).as_f64(), Some(1.5));
        assert_eq!(FieldValue::from(3i64).as_f64(), Some(3.0));
        assert_eq!(FieldValue::from("x").as_f64(), None);
        assert_eq!(FieldValue::from(true).as_f64(), None);
    }

    #[test]
    fn test_shard_id_display() {
        let shard = ShardId::new("metrics-2024", 3);
        assert_eq!(shard.to_string(), "[metrics-2024][3]");
    }
}
