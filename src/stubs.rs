//! In-memory stub implementations of the external contracts
//!
//! These implementations are intended for:
//! - **Unit testing** the engine without a document store
//! - **Integration testing** full shard runs end to end
//! - **Development and prototyping** against the engine's seams
//!
//! # Available Stubs
//!
//! ## In-Memory Shard Searcher ([`InMemoryShardSearcher`])
//!
//! Holds source documents grouped into leaves, and serves them through a
//! globally sorted iterator exactly as the engine's contract requires
//! (tsid ascending, timestamp descending within a series, ordinals
//! assigned per distinct series).
//!
//! ## Collecting Index Writer ([`CollectingIndexWriter`])
//!
//! Records every acknowledged batch in memory. Failures are programmable:
//! transient or permanent transport errors for upcoming writes, and
//! item-level failures for a chosen batch execution id.
//!
//! ## Status Publishers ([`RecordingStatusPublisher`], [`NoopStatusPublisher`])
//!
//! Capture (or discard) the state records the driver publishes.
//!
//! # Warning
//!
//! **These stubs are NOT suitable for production use.** All state lives in
//! memory and disappears with the process.

use crate::bucket::RollupDocument;
use crate::error::{Result, TransportError};
use crate::reader::{OrderedDocIterator, ShardSearcher, SortedDoc};
use crate::sink::{BulkBatch, BulkWriteResponse, IndexWriter, ItemFailure};
use crate::task::{ShardTaskState, StatusPublisher};
use crate::types::{DocId, FieldValue, Tsid};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// =============================================================================
// In-Memory Shard Searcher
// =============================================================================

/// One source document held by the in-memory searcher
#[derive(Debug, Clone)]
pub struct SourceDoc {
    /// Series the document belongs to
    pub tsid: Tsid,
    /// Document timestamp
    pub timestamp_ms: i64,
    /// `_doc_count` contribution, defaulting to 1
    pub doc_count: u64,
    /// Doc-values per field name
    pub fields: HashMap<String, Vec<FieldValue>>,
}

impl SourceDoc {
    /// Create a document with no field values and a doc count of 1
    pub fn new(tsid: Tsid, timestamp_ms: i64) -> Self {
        Self {
            tsid,
            timestamp_ms,
            doc_count: 1,
            fields: HashMap::new(),
        }
    }

    /// Set a single-valued field
    pub fn with_value(self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.with_values(field, vec![value.into()])
    }

    /// Set a multi-valued field
    pub fn with_values(mut self, field: impl Into<String>, values: Vec<FieldValue>) -> Self {
        self.fields.insert(field.into(), values);
        self
    }

    /// Override the `_doc_count` contribution
    pub fn with_doc_count(mut self, doc_count: u64) -> Self {
        self.doc_count = doc_count;
        self
    }
}

struct PreparedDoc<'a> {
    leaf_ord: usize,
    doc_id: DocId,
    tsid_ord: i64,
    doc: &'a SourceDoc,
}

/// In-memory [`ShardSearcher`] over leaves of source documents
pub struct InMemoryShardSearcher {
    field_names: Vec<String>,
    leaves: Vec<Vec<SourceDoc>>,
}

impl InMemoryShardSearcher {
    /// Create a searcher exposing the given producer field order
    pub fn new(field_names: Vec<String>) -> Self {
        Self {
            field_names,
            leaves: Vec::new(),
        }
    }

    /// Add one leaf of documents
    pub fn add_leaf(&mut self, docs: Vec<SourceDoc>) -> &mut Self {
        self.leaves.push(docs);
        self
    }

    /// Convenience: a searcher with all documents in a single leaf
    pub fn single_leaf(field_names: Vec<String>, docs: Vec<SourceDoc>) -> Self {
        let mut searcher = Self::new(field_names);
        searcher.add_leaf(docs);
        searcher
    }
}

impl ShardSearcher for InMemoryShardSearcher {
    fn num_docs(&self) -> u64 {
        self.leaves.iter().map(|leaf| leaf.len() as u64).sum()
    }

    fn open_sorted(&self, resume_tsid: Option<&Tsid>) -> Result<Box<dyn OrderedDocIterator + '_>> {
        let mut entries: Vec<PreparedDoc<'_>> = Vec::new();
        for (leaf_ord, leaf) in self.leaves.iter().enumerate() {
            for (doc_id, doc) in leaf.iter().enumerate() {
                if let Some(resume) = resume_tsid {
                    if doc.tsid < *resume {
                        continue;
                    }
                }
                entries.push(PreparedDoc {
                    leaf_ord,
                    doc_id: doc_id as DocId,
                    tsid_ord: 0,
                    doc,
                });
            }
        }

        // The engine consumes one globally merged stream: tsid ascending,
        // timestamp descending within a series.
        entries.sort_by(|a, b| {
            a.doc
                .tsid
                .cmp(&b.doc.tsid)
                .then(b.doc.timestamp_ms.cmp(&a.doc.timestamp_ms))
        });

        let mut ord = -1i64;
        let mut previous: Option<&Tsid> = None;
        for entry in &mut entries {
            if previous != Some(&entry.doc.tsid) {
                ord += 1;
                previous = Some(&entry.doc.tsid);
            }
            entry.tsid_ord = ord;
        }

        Ok(Box::new(InMemoryDocIterator {
            field_names: &self.field_names,
            entries,
            cursor: None,
        }))
    }
}

struct InMemoryDocIterator<'a> {
    field_names: &'a [String],
    entries: Vec<PreparedDoc<'a>>,
    cursor: Option<usize>,
}

impl InMemoryDocIterator<'_> {
    fn current(&self) -> Option<&PreparedDoc<'_>> {
        self.cursor.and_then(|c| self.entries.get(c))
    }
}

impl OrderedDocIterator for InMemoryDocIterator<'_> {
    fn next_doc(&mut self) -> Result<Option<SortedDoc<'_>>> {
        let next = self.cursor.map_or(0, |c| c + 1);
        if next >= self.entries.len() {
            return Ok(None);
        }
        self.cursor = Some(next);
        let entry = &self.entries[next];
        Ok(Some(SortedDoc {
            tsid: entry.doc.tsid.as_bytes(),
            tsid_ord: entry.tsid_ord,
            timestamp_ms: entry.doc.timestamp_ms,
            doc_id: entry.doc_id,
            leaf_ord: entry.leaf_ord,
        }))
    }

    fn field_values(&self, field: usize) -> Result<Option<Vec<FieldValue>>> {
        let Some(entry) = self.current() else {
            return Ok(None);
        };
        let Some(name) = self.field_names.get(field) else {
            return Ok(None);
        };
        Ok(entry.doc.fields.get(name).cloned())
    }

    fn doc_count(&self) -> u64 {
        self.current().map_or(1, |entry| entry.doc.doc_count)
    }
}

// =============================================================================
// Collecting Index Writer
// =============================================================================

/// In-memory [`IndexWriter`] with programmable failures
pub struct CollectingIndexWriter {
    batches: Mutex<Vec<BulkBatch>>,
    transport_failures: Mutex<VecDeque<TransportError>>,
    fail_items_in: Mutex<Option<u64>>,
    write_attempts: AtomicU64,
}

impl CollectingIndexWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            transport_failures: Mutex::new(VecDeque::new()),
            fail_items_in: Mutex::new(None),
            write_attempts: AtomicU64::new(0),
        }
    }

    /// Queue a transport failure for the next write attempt
    pub fn push_transport_failure(&self, error: TransportError) {
        self.transport_failures.lock().push_back(error);
    }

    /// Make every item of the batch with this execution id fail
    pub fn fail_items_in_execution(&self, execution_id: u64) {
        *self.fail_items_in.lock() = Some(execution_id);
    }

    /// Acknowledged batches, in completion order
    pub fn batches(&self) -> Vec<BulkBatch> {
        self.batches.lock().clone()
    }

    /// All successfully stored documents, in emission order
    pub fn documents(&self) -> Vec<RollupDocument> {
        self.batches
            .lock()
            .iter()
            .flat_map(|batch| batch.documents.iter().cloned())
            .collect()
    }

    /// Total write attempts, including retried ones
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::Relaxed)
    }
}

impl Default for CollectingIndexWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexWriter for CollectingIndexWriter {
    async fn write_bulk(
        &self,
        batch: &BulkBatch,
    ) -> std::result::Result<BulkWriteResponse, TransportError> {
        self.write_attempts.fetch_add(1, Ordering::Relaxed);

        if let Some(error) = self.transport_failures.lock().pop_front() {
            return Err(error);
        }

        let item_failures: Vec<ItemFailure> =
            if *self.fail_items_in.lock() == Some(batch.execution_id) {
                batch
                    .documents
                    .iter()
                    .map(|doc| ItemFailure {
                        doc_id: doc.id.clone(),
                        message: "simulated item failure".to_string(),
                    })
                    .collect()
            } else {
                Vec::new()
            };

        if item_failures.is_empty() {
            self.batches.lock().push(batch.clone());
        }

        Ok(BulkWriteResponse {
            took: Duration::from_millis(1),
            item_failures,
        })
    }
}

// =============================================================================
// Status Publishers
// =============================================================================

/// Records every published state transition
#[derive(Default)]
pub struct RecordingStatusPublisher {
    states: Mutex<Vec<ShardTaskState>>,
}

impl RecordingStatusPublisher {
    /// Create an empty publisher
    pub fn new() -> Self {
        Self::default()
    }

    /// All published records, oldest first
    pub fn published(&self) -> Vec<ShardTaskState> {
        self.states.lock().clone()
    }
}

impl StatusPublisher for RecordingStatusPublisher {
    fn publish(&self, state: &ShardTaskState) {
        self.states.lock().push(state.clone());
    }
}

/// Discards every published state transition
pub struct NoopStatusPublisher;

impl StatusPublisher for NoopStatusPublisher {
    fn publish(&self, _state: &ShardTaskState) {}
}
