//! Open-bucket state and rollup document serialization
//!
//! The [`BucketBuilder`] holds the single open bucket of a shard run: the
//! owned series id, the bucket-start timestamp, the running doc count and
//! the field producers. At bucket boundaries the collector serializes the
//! builder into a self-describing [`RollupDocument`] and resets it.

use crate::error::{DownsampleError, Result};
use crate::producer::{write_composite, FieldProducer};
use crate::rounding::format_timestamp;
use crate::types::{FieldValue, Tsid};
use bytes::Bytes;
use crc::{Crc, CRC_64_ECMA_182};
use serde_json::{Map, Value};
use tracing::trace;

/// Name of the doc-count field in source and rollup documents
pub const DOC_COUNT_FIELD: &str = "_doc_count";

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// One serialized rollup document, ready for the bulk sink
#[derive(Debug, Clone)]
pub struct RollupDocument {
    /// Deterministic document id derived from `(tsid, bucket_start_ms)`
    ///
    /// Replays of the same bucket overwrite instead of duplicating.
    pub id: String,
    /// The self-describing document body
    pub source: Map<String, Value>,
    size_bytes: usize,
}

impl RollupDocument {
    /// Create a document, computing its estimated serialized size
    pub fn new(id: String, source: Map<String, Value>) -> Result<Self> {
        let size_bytes = serde_json::to_vec(&source)?.len();
        Ok(Self {
            id,
            source,
            size_bytes,
        })
    }

    /// Estimated serialized size, used for batch sizing and backpressure
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Encode the document body as JSON bytes
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.source)?))
    }
}

/// Deterministic rollup document id for a bucket key
pub fn rollup_doc_id(tsid: &Tsid, bucket_start_ms: i64) -> String {
    let mut digest = CRC64.digest();
    digest.update(tsid.as_bytes());
    digest.update(&bucket_start_ms.to_be_bytes());
    format!("{:016x}", digest.finalize())
}

struct ProducerGroup {
    name: String,
    members: Vec<usize>,
}

/// Mutable state of the currently accumulating bucket
pub struct BucketBuilder {
    timestamp_field: String,
    producers: Vec<FieldProducer>,
    groups: Vec<ProducerGroup>,
    tsid: Option<Tsid>,
    tsid_ord: Option<i64>,
    bucket_start_ms: i64,
    doc_count: u64,
    // Explicit open flag instead of a timestamp sentinel, so a bucket at
    // the epoch itself is still a valid bucket.
    open: bool,
}

impl BucketBuilder {
    /// Create a builder over the producer array
    ///
    /// Producers sharing an output name are grouped at construction;
    /// groups with more than one member serialize as a combined
    /// aggregate-metric object.
    pub fn new(timestamp_field: impl Into<String>, producers: Vec<FieldProducer>) -> Self {
        let mut groups: Vec<ProducerGroup> = Vec::new();
        for (index, producer) in producers.iter().enumerate() {
            match groups.iter_mut().find(|g| g.name == producer.name()) {
                Some(group) => group.members.push(index),
                None => groups.push(ProducerGroup {
                    name: producer.name().to_string(),
                    members: vec![index],
                }),
            }
        }
        Self {
            timestamp_field: timestamp_field.into(),
            producers,
            groups,
            tsid: None,
            tsid_ord: None,
            bucket_start_ms: 0,
            doc_count: 0,
            open: false,
        }
    }

    /// Begin a bucket for a new series
    ///
    /// Deep-copies the tsid bytes: the iterator reuses its buffer across
    /// documents.
    pub fn reset_series(&mut self, tsid: &[u8], tsid_ord: i64, bucket_start_ms: i64) {
        self.tsid = Some(Tsid::from_bytes(tsid.to_vec()));
        self.tsid_ord = Some(tsid_ord);
        self.reset_bucket(bucket_start_ms);
    }

    /// Begin a new bucket within the current series
    pub fn reset_bucket(&mut self, bucket_start_ms: i64) {
        self.bucket_start_ms = bucket_start_ms;
        self.doc_count = 0;
        self.open = true;
        for producer in &mut self.producers {
            producer.reset();
        }
        if let Some(tsid) = &self.tsid {
            trace!(%tsid, bucket_start_ms, "new rollup bucket");
        }
    }

    /// Add a document's `_doc_count` contribution
    pub fn collect_doc_count(&mut self, doc_count: u64) {
        self.doc_count += doc_count;
    }

    /// Feed one document's values for producer `index`
    pub fn collect_field(&mut self, index: usize, values: &[FieldValue]) {
        self.producers[index].collect(values);
    }

    /// Number of producers (and thus of per-document field lookups)
    pub fn num_producers(&self) -> usize {
        self.producers.len()
    }

    /// Whether there is nothing to emit
    pub fn is_empty(&self) -> bool {
        !self.open || self.doc_count == 0
    }

    /// The open bucket's series id
    pub fn current_tsid(&self) -> Option<&Tsid> {
        self.tsid.as_ref()
    }

    /// The open bucket's series ordinal
    pub fn current_tsid_ord(&self) -> Option<i64> {
        self.tsid_ord
    }

    /// The open bucket's start timestamp, if a bucket is open
    pub fn current_bucket_start_ms(&self) -> Option<i64> {
        self.open.then_some(self.bucket_start_ms)
    }

    /// Accumulated doc count of the open bucket
    pub fn doc_count(&self) -> u64 {
        self.doc_count
    }

    /// Serialize the open bucket into a rollup document
    ///
    /// Returns an empty document when the builder [`is_empty`]; the caller
    /// must not emit it.
    ///
    /// [`is_empty`]: BucketBuilder::is_empty
    pub fn serialize(&self) -> Result<RollupDocument> {
        let (Some(tsid), false) = (&self.tsid, self.is_empty()) else {
            return Ok(RollupDocument {
                id: String::new(),
                source: Map::new(),
                size_bytes: 0,
            });
        };

        let mut source = Map::new();
        source.insert(
            self.timestamp_field.clone(),
            Value::from(format_timestamp(self.bucket_start_ms)),
        );
        source.insert(DOC_COUNT_FIELD.to_string(), Value::from(self.doc_count));

        // Dimensions come out of the tsid itself; the source documents are
        // never consulted for them.
        let dimensions = tsid
            .decode_dimensions()
            .map_err(DownsampleError::TsidDecode)?;
        for (name, value) in dimensions {
            source.insert(name, value.to_json());
        }

        for group in &self.groups {
            if let [index] = group.members.as_slice() {
                self.producers[*index].write(&mut source);
            } else {
                let members: Vec<&FieldProducer> =
                    group.members.iter().map(|i| &self.producers[*i]).collect();
                write_composite(&group.name, &members, &mut source);
            }
        }

        let id = rollup_doc_id(tsid, self.bucket_start_ms);
        trace!(%tsid, bucket_start_ms = self.bucket_start_ms, doc_id = %id, "serialized rollup document");
        RollupDocument::new(id, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LabelFieldConfig, MetricFieldConfig};
    use crate::producer::build_producers;
    use crate::types::DimensionValue;

    fn test_builder() -> BucketBuilder {
        let producers = build_producers(
            &[MetricFieldConfig::gauge("cpu")],
            &[LabelFieldConfig::new("pod")],
        )
        .unwrap();
        BucketBuilder::new("@timestamp", producers)
    }

    fn test_tsid() -> Tsid {
        Tsid::from_dimensions([("host", DimensionValue::from("a"))])
    }

    #[test]
    fn test_new_builder_is_empty() {
        let builder = test_builder();
        assert!(builder.is_empty());
        assert!(builder.current_tsid().is_none());
        assert!(builder.current_bucket_start_ms().is_none());
    }

    #[test]
    fn test_open_bucket_without_docs_is_empty() {
        let mut builder = test_builder();
        builder.reset_series(test_tsid().as_bytes(), 0, 1000);
        assert!(builder.is_empty());
        assert!(builder.serialize().unwrap().source.is_empty());
    }

    #[test]
    fn test_bucket_at_epoch_is_not_empty() {
        let mut builder = test_builder();
        builder.reset_series(test_tsid().as_bytes(), 0, 0);
        builder.collect_doc_count(1);
        assert!(!builder.is_empty());
        let doc = builder.serialize().unwrap();
        assert_eq!(
            doc.source.get("@timestamp").unwrap().as_str(),
            Some("1970-01-01T00:00:00.000Z")
        );
    }

    #[test]
    fn test_serialize_contains_dimensions_and_fields() {
        let mut builder = test_builder();
        builder.reset_series(test_tsid().as_bytes(), 0, 3_600_000);
        builder.collect_doc_count(2);
        builder.collect_field(0, &[FieldValue::from(1.0)]);
        builder.collect_field(0, &[FieldValue::from(3.0)]);
        builder.collect_field(1, &[FieldValue::from("web-1")]);

        let doc = builder.serialize().unwrap();
        assert_eq!(
            doc.source.get("@timestamp").unwrap().as_str(),
            Some("1970-01-01T01:00:00.000Z")
        );
        assert_eq!(doc.source.get(DOC_COUNT_FIELD).unwrap().as_u64(), Some(2));
        assert_eq!(doc.source.get("host").unwrap().as_str(), Some("a"));
        assert_eq!(doc.source.get("pod").unwrap().as_str(), Some("web-1"));

        let cpu = doc.source.get("cpu").unwrap().as_object().unwrap();
        assert_eq!(cpu.get("sum").unwrap().as_f64(), Some(4.0));
        assert!(doc.size_bytes() > 0);
        assert!(!doc.id.is_empty());
    }

    #[test]
    fn test_doc_id_is_deterministic_per_bucket_key() {
        let tsid = test_tsid();
        let a = rollup_doc_id(&tsid, 3_600_000);
        let b = rollup_doc_id(&tsid, 3_600_000);
        let c = rollup_doc_id(&tsid, 7_200_000);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let other = Tsid::from_dimensions([("host", DimensionValue::from("b"))]);
        assert_ne!(a, rollup_doc_id(&other, 3_600_000));
    }

    #[test]
    fn test_reset_bucket_preserves_series() {
        let mut builder = test_builder();
        builder.reset_series(test_tsid().as_bytes(), 7, 1000);
        builder.collect_doc_count(1);
        builder.reset_bucket(2000);

        assert_eq!(builder.current_tsid(), Some(&test_tsid()));
        assert_eq!(builder.current_tsid_ord(), Some(7));
        assert_eq!(builder.current_bucket_start_ms(), Some(2000));
        assert_eq!(builder.doc_count(), 0);
    }

    #[test]
    fn test_composite_group_serialization() {
        use crate::config::GaugeAggregation;

        let producers = build_producers(
            &[
                MetricFieldConfig::gauge_component(
                    "load.min",
                    "load",
                    vec![GaugeAggregation::Min],
                ),
                MetricFieldConfig::gauge_component(
                    "load.max",
                    "load",
                    vec![GaugeAggregation::Max],
                ),
            ],
            &[],
        )
        .unwrap();
        let mut builder = BucketBuilder::new("@timestamp", producers);
        builder.reset_series(test_tsid().as_bytes(), 0, 0);
        builder.collect_doc_count(1);
        builder.collect_field(0, &[FieldValue::from(0.25)]);
        builder.collect_field(1, &[FieldValue::from(4.0)]);

        let doc = builder.serialize().unwrap();
        let load = doc.source.get("load").unwrap().as_object().unwrap();
        assert_eq!(load.get("min").unwrap().as_f64(), Some(0.25));
        assert_eq!(load.get("max").unwrap().as_f64(), Some(4.0));
    }
}
