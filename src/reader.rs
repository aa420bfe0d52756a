//! External read-side contracts
//!
//! The engine does not know how the source shard stores documents; it only
//! requires a globally ordered stream. A [`ShardSearcher`] is a scoped
//! read lease on one shard: dropping it releases the lease, which happens
//! on every exit path of the driver. [`ShardSearcher::open_sorted`] yields
//! an [`OrderedDocIterator`] that the collector pulls from.

use crate::error::Result;
use crate::types::{DocId, FieldValue, Tsid};

/// The head of the current document in the sorted stream
///
/// The tsid bytes borrow the iterator's internal buffer and are only valid
/// until the next [`OrderedDocIterator::next_doc`] call; consumers that
/// keep a series id deep-copy it (see `BucketBuilder::reset_series`).
#[derive(Debug)]
pub struct SortedDoc<'a> {
    /// Series identifier bytes, ascending across the stream
    pub tsid: &'a [u8],
    /// Iterator-assigned series ordinal; equal ordinals within one leaf
    /// imply equal tsids, but ordinals are not comparable across leaves
    pub tsid_ord: i64,
    /// Source document timestamp, descending within a series
    pub timestamp_ms: i64,
    /// Per-leaf document id
    pub doc_id: DocId,
    /// Index of the leaf this document came from
    pub leaf_ord: usize,
}

/// A pull iterator over one shard's documents in time-series order
///
/// # Contract
///
/// - Documents are yielded sorted by tsid ascending (unsigned byte
///   compare), then timestamp descending within equal tsids. The engine
///   asserts this and fails the shard on violation.
/// - After `next_doc` returns a document, the accessor methods refer to
///   that document until the next call.
/// - When constructed with a resume tsid, only documents with
///   `tsid >= resume_tsid` (inclusive) are yielded.
pub trait OrderedDocIterator {
    /// Advance to the next document, or `None` at end of stream
    fn next_doc(&mut self) -> Result<Option<SortedDoc<'_>>>;

    /// Doc-values of the current document for producer `field`
    ///
    /// `None` when the document has no value for the field.
    fn field_values(&self, field: usize) -> Result<Option<Vec<FieldValue>>>;

    /// `_doc_count` of the current document, defaulting to 1
    fn doc_count(&self) -> u64;
}

/// A scoped read lease on one source shard
///
/// Implementations hold whatever lock or snapshot the store requires and
/// release it on drop.
pub trait ShardSearcher: Send {
    /// Number of live documents in the shard
    fn num_docs(&self) -> u64;

    /// Open the sorted document stream
    ///
    /// `resume_tsid` restricts the stream to `tsid >= resume_tsid`; `None`
    /// iterates everything. The field indices exposed through
    /// [`OrderedDocIterator::field_values`] follow the producer order the
    /// searcher was configured with.
    fn open_sorted(&self, resume_tsid: Option<&Tsid>) -> Result<Box<dyn OrderedDocIterator + '_>>;
}
