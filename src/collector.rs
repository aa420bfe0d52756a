//! The per-document bucket state machine
//!
//! The collector pulls the globally ordered document stream, detects
//! series and bucket boundaries, folds each document into the open bucket
//! and pushes completed buckets into the bulk sink. It owns all mutable
//! collection state; the sink dispatcher is the only concurrent party, and
//! the two meet solely through the sink's counters and abort flag.
//!
//! Cancellation is cooperative: the collector polls the task's cancel flag
//! and the sink's abort flag before collection, after collection, on every
//! leaf change and at a bounded document interval.

use crate::bucket::BucketBuilder;
use crate::error::{DownsampleError, Result};
use crate::reader::OrderedDocIterator;
use crate::rounding::Rounding;
use crate::sink::{wall_clock_ms, BulkSink};
use crate::task::ShardTask;
use crate::types::Tsid;
use tracing::{info, trace, warn};

/// How many documents may pass between cancellation polls
const CANCELLATION_CHECK_INTERVAL_DOCS: u64 = 1024;

/// Drives the iterator and the bucket builder for one shard run
pub struct Collector<'a> {
    builder: BucketBuilder,
    sink: &'a mut BulkSink,
    rounding: &'a Rounding,
    task: &'a ShardTask,
    series_start_ms: i64,
    last_timestamp: i64,
    last_histo_timestamp: i64,
    docs_processed: u64,
    buckets_created: u64,
    current_leaf: Option<usize>,
}

impl<'a> Collector<'a> {
    /// Create a collector over a fresh bucket builder
    pub fn new(
        builder: BucketBuilder,
        sink: &'a mut BulkSink,
        rounding: &'a Rounding,
        task: &'a ShardTask,
        series_start_ms: i64,
    ) -> Self {
        Self {
            builder,
            sink,
            rounding,
            task,
            series_start_ms,
            last_timestamp: i64::MAX,
            last_histo_timestamp: i64::MAX,
            docs_processed: 0,
            buckets_created: 0,
            current_leaf: None,
        }
    }

    /// Consume the document stream, emitting one document per bucket
    pub async fn run(&mut self, iter: &mut dyn OrderedDocIterator) -> Result<()> {
        self.check_cancelled()?;

        loop {
            let Some(doc) = iter.next_doc()? else { break };
            self.task.add_num_received(1);

            let timestamp = doc.timestamp_ms;
            if self.current_leaf != Some(doc.leaf_ord) {
                self.current_leaf = Some(doc.leaf_ord);
                self.check_cancelled()?;
            }

            // Differing ordinals decide cheaply; equal ordinals may still
            // collide across leaves, so the tsid bytes confirm.
            let crossed_series = match (self.builder.current_tsid_ord(), self.builder.current_tsid())
            {
                (Some(ord), Some(tsid)) => {
                    ord != doc.tsid_ord || tsid.as_bytes() != doc.tsid
                }
                _ => true,
            };

            if crossed_series || timestamp < self.last_histo_timestamp {
                self.last_histo_timestamp = self
                    .rounding
                    .round_down(timestamp)
                    .max(self.series_start_ms);
            }
            self.task.set_last_source_timestamp(timestamp);
            self.task.set_last_target_timestamp(self.last_histo_timestamp);
            trace!(
                doc_id = doc.doc_id,
                timestamp_ms = timestamp,
                bucket_start_ms = self.last_histo_timestamp,
                "source doc mapped to rollup bucket"
            );

            // Sort-contract checks: tsid ascending, timestamp descending
            // within a series. A violation means the iterator is broken.
            if let Some(tsid) = self.builder.current_tsid() {
                if tsid.as_bytes() > doc.tsid {
                    return Err(DownsampleError::OrderingViolation(format!(
                        "series id not ascending: {} -> {}",
                        tsid,
                        Tsid::from_bytes(doc.tsid.to_vec())
                    )));
                }
                if tsid.as_bytes() == doc.tsid && self.last_timestamp < timestamp {
                    return Err(DownsampleError::OrderingViolation(format!(
                        "timestamp not descending within series {}: {} -> {}",
                        tsid, self.last_timestamp, timestamp
                    )));
                }
            }
            self.last_timestamp = timestamp;

            if crossed_series
                || self.builder.current_bucket_start_ms() != Some(self.last_histo_timestamp)
            {
                if !self.builder.is_empty() {
                    self.flush_bucket().await?;
                }
                if crossed_series {
                    self.builder
                        .reset_series(doc.tsid, doc.tsid_ord, self.last_histo_timestamp);
                } else {
                    self.builder.reset_bucket(self.last_histo_timestamp);
                }
                self.buckets_created += 1;
            }

            // End the borrow of the stream head before touching doc-values.
            drop(doc);

            self.builder.collect_doc_count(iter.doc_count());
            for field in 0..self.builder.num_producers() {
                if let Some(values) = iter.field_values(field)? {
                    self.builder.collect_field(field, &values);
                }
            }

            self.docs_processed += 1;
            self.task.set_docs_processed(self.docs_processed);
            if self.docs_processed % CANCELLATION_CHECK_INTERVAL_DOCS == 0 {
                self.check_cancelled()?;
            }
        }

        if !self.builder.is_empty() {
            self.flush_bucket().await?;
        }
        self.check_cancelled()?;

        info!(
            shard = %self.task.shard_id(),
            docs_processed = self.docs_processed,
            buckets_created = self.buckets_created,
            "shard collection finished"
        );
        Ok(())
    }

    /// Documents folded into buckets so far
    pub fn docs_processed(&self) -> u64 {
        self.docs_processed
    }

    /// Buckets opened so far
    pub fn buckets_created(&self) -> u64 {
        self.buckets_created
    }

    async fn flush_bucket(&mut self) -> Result<()> {
        let doc = self.builder.serialize()?;
        self.task.set_last_indexing_timestamp(wall_clock_ms());
        self.sink.enqueue(doc).await
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.task.is_cancelled() {
            warn!(
                shard = %self.task.shard_id(),
                sent = self.task.num_sent(),
                indexed = self.task.num_indexed(),
                failed = self.task.num_failed(),
                "shard downsample cancelled"
            );
            return Err(DownsampleError::Cancelled(format!(
                "shard {} downsample cancelled",
                self.task.shard_id()
            )));
        }
        if self.sink.is_aborted() {
            warn!(
                shard = %self.task.shard_id(),
                sent = self.task.num_sent(),
                indexed = self.task.num_indexed(),
                failed = self.task.num_failed(),
                "shard downsample aborted on bulk failure"
            );
            return Err(DownsampleError::BulkIndexing {
                message: "bulk indexing failure".to_string(),
                retryable: true,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketBuilder;
    use crate::config::{DownsampleConfig, DownsampleInterval};
    use crate::reader::SortedDoc;
    use crate::sink::{BulkSink, BulkSinkConfig};
    use crate::stubs::CollectingIndexWriter;
    use crate::types::{DimensionValue, FieldValue, ShardId};
    use std::sync::Arc;

    /// Hand-rolled iterator for exercising contract edge cases
    struct ScriptedIter {
        docs: Vec<(Tsid, i64, i64, usize)>, // tsid, ord, timestamp, leaf
        cursor: Option<usize>,
    }

    impl ScriptedIter {
        fn new(docs: Vec<(Tsid, i64, i64, usize)>) -> Self {
            Self { docs, cursor: None }
        }
    }

    impl OrderedDocIterator for ScriptedIter {
        fn next_doc(&mut self) -> Result<Option<SortedDoc<'_>>> {
            let next = self.cursor.map_or(0, |c| c + 1);
            if next >= self.docs.len() {
                return Ok(None);
            }
            self.cursor = Some(next);
            let (tsid, ord, ts, leaf) = &self.docs[next];
            Ok(Some(SortedDoc {
                tsid: tsid.as_bytes(),
                tsid_ord: *ord,
                timestamp_ms: *ts,
                doc_id: next as u32,
                leaf_ord: *leaf,
            }))
        }

        fn field_values(&self, _field: usize) -> Result<Option<Vec<FieldValue>>> {
            Ok(None)
        }

        fn doc_count(&self) -> u64 {
            1
        }
    }

    fn tsid(host: &str) -> Tsid {
        Tsid::from_dimensions([("host", DimensionValue::from(host))])
    }

    async fn run_collector(
        docs: Vec<(Tsid, i64, i64, usize)>,
    ) -> (Result<()>, Arc<CollectingIndexWriter>, Arc<ShardTask>) {
        let writer = Arc::new(CollectingIndexWriter::new());
        let task = Arc::new(ShardTask::new(ShardId::new("metrics", 0)));
        let mut sink = BulkSink::new(
            BulkSinkConfig::default(),
            "target",
            writer.clone(),
            task.clone(),
        );
        let config = DownsampleConfig::new(DownsampleInterval::hours(1));
        let rounding = Rounding::new(&config);

        let builder = BucketBuilder::new("@timestamp", Vec::new());
        let mut collector = Collector::new(builder, &mut sink, &rounding, &task, i64::MIN);
        let mut iter = ScriptedIter::new(docs);
        let result = collector.run(&mut iter).await;
        drop(collector);
        sink.close().await.unwrap();
        (result, writer, task)
    }

    #[tokio::test]
    async fn test_descending_tsid_is_an_ordering_violation() {
        let (result, _, _) = run_collector(vec![
            (tsid("b"), 1, 1000, 0),
            (tsid("a"), 0, 1000, 0),
        ])
        .await;
        assert!(matches!(
            result,
            Err(DownsampleError::OrderingViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_ascending_timestamp_within_series_is_an_ordering_violation() {
        let (result, _, _) = run_collector(vec![
            (tsid("a"), 0, 1000, 0),
            (tsid("a"), 0, 2000, 0),
        ])
        .await;
        assert!(matches!(
            result,
            Err(DownsampleError::OrderingViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_equal_ordinals_across_leaves_use_byte_compare() {
        // Two different series carry the same per-leaf ordinal; the byte
        // compare must split them into two buckets.
        let (result, writer, _) = run_collector(vec![
            (tsid("a"), 0, 1000, 0),
            (tsid("b"), 0, 1000, 1),
        ])
        .await;
        result.unwrap();

        let docs = writer.documents();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].source.get("host").unwrap().as_str(), Some("a"));
        assert_eq!(docs[1].source.get("host").unwrap().as_str(), Some("b"));
    }

    #[tokio::test]
    async fn test_same_series_across_leaves_stays_one_bucket() {
        let (result, writer, task) = run_collector(vec![
            (tsid("a"), 0, 2000, 0),
            (tsid("a"), 0, 1000, 1),
        ])
        .await;
        result.unwrap();

        let docs = writer.documents();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source.get("_doc_count").unwrap().as_u64(), Some(2));
        assert_eq!(task.num_received(), 2);
    }
}
