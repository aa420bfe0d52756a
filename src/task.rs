//! Shard task state and progress accounting
//!
//! A [`ShardTask`] is the in-memory handle the host holds for one shard
//! run: lock-free progress counters, the cooperative cancellation flag and
//! the current status. The persisted side is the small
//! [`ShardTaskState`] record, pushed through a [`StatusPublisher`] at every
//! transition; only its `last_completed_tsid` matters for resume.

use crate::sink::{AfterBulkInfo, BeforeBulkInfo, BulkListener};
use crate::types::{ShardId, Tsid};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Lifecycle states of a shard downsample task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardTaskStatus {
    /// Created but not yet collecting
    Initializing,
    /// Collection in progress
    Started,
    /// All buckets emitted and acknowledged
    Completed,
    /// Cancelled externally
    Cancelled,
    /// Aborted on bulk failure or contract violation
    Failed,
}

impl ShardTaskStatus {
    /// Whether this state ends the task
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShardTaskStatus::Completed | ShardTaskStatus::Cancelled | ShardTaskStatus::Failed
        )
    }
}

/// The persisted shard-level checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardTaskState {
    /// Task status at the time of publication
    pub status: ShardTaskStatus,
    /// Series id to resume from, when a prior run was interrupted
    pub last_completed_tsid: Option<Tsid>,
}

impl ShardTaskState {
    /// Create a state record
    pub fn new(status: ShardTaskStatus, last_completed_tsid: Option<Tsid>) -> Self {
        Self {
            status,
            last_completed_tsid,
        }
    }

    /// A fresh record with no resume point
    pub fn initializing() -> Self {
        Self::new(ShardTaskStatus::Initializing, None)
    }

    /// The resume tsid, if this record describes an interrupted run
    pub fn resume_point(&self) -> Option<&Tsid> {
        match self.status {
            ShardTaskStatus::Started => self.last_completed_tsid.as_ref(),
            _ => None,
        }
    }
}

/// Hook through which the engine persists status transitions
///
/// The engine's responsibility ends at calling `publish`; durability and
/// the surrounding task framework belong to the host.
pub trait StatusPublisher: Send + Sync {
    /// Persist one state record
    fn publish(&self, state: &ShardTaskState);
}

/// In-memory handle for one shard run
///
/// All counters are atomics: the collector thread and the sink dispatcher
/// update them concurrently, and the host may read them at any time.
pub struct ShardTask {
    shard_id: ShardId,
    cancelled: AtomicBool,
    status: RwLock<ShardTaskStatus>,
    total_shard_doc_count: AtomicU64,
    num_received: AtomicU64,
    num_sent: AtomicU64,
    num_indexed: AtomicU64,
    num_failed: AtomicU64,
    docs_processed: AtomicU64,
    last_source_ts: AtomicI64,
    last_target_ts: AtomicI64,
    last_index_ts: AtomicI64,
    before_bulk: RwLock<Option<BeforeBulkInfo>>,
    after_bulk: RwLock<Option<AfterBulkInfo>>,
}

impl ShardTask {
    /// Create a task handle for one shard
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            cancelled: AtomicBool::new(false),
            status: RwLock::new(ShardTaskStatus::Initializing),
            total_shard_doc_count: AtomicU64::new(0),
            num_received: AtomicU64::new(0),
            num_sent: AtomicU64::new(0),
            num_indexed: AtomicU64::new(0),
            num_failed: AtomicU64::new(0),
            docs_processed: AtomicU64::new(0),
            last_source_ts: AtomicI64::new(0),
            last_target_ts: AtomicI64::new(0),
            last_index_ts: AtomicI64::new(0),
            before_bulk: RwLock::new(None),
            after_bulk: RwLock::new(None),
        }
    }

    /// The shard this task covers
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Current in-memory status
    pub fn status(&self) -> ShardTaskStatus {
        *self.status.read()
    }

    /// Update the in-memory status
    pub fn set_status(&self, status: ShardTaskStatus) {
        *self.status.write() = status;
    }

    /// Record the shard's total live doc count at run start
    pub fn set_total_shard_doc_count(&self, count: u64) {
        self.total_shard_doc_count.store(count, Ordering::Relaxed);
    }

    /// Total live docs in the shard at run start
    pub fn total_shard_doc_count(&self) -> u64 {
        self.total_shard_doc_count.load(Ordering::Relaxed)
    }

    /// Count source documents handed to the collector
    pub fn add_num_received(&self, count: u64) {
        self.num_received.fetch_add(count, Ordering::Relaxed);
    }

    /// Source documents received so far
    pub fn num_received(&self) -> u64 {
        self.num_received.load(Ordering::Relaxed)
    }

    /// Rollup documents handed to the writer so far
    pub fn num_sent(&self) -> u64 {
        self.num_sent.load(Ordering::Relaxed)
    }

    /// Rollup documents acknowledged so far
    pub fn num_indexed(&self) -> u64 {
        self.num_indexed.load(Ordering::Relaxed)
    }

    /// Rollup documents that failed so far
    pub fn num_failed(&self) -> u64 {
        self.num_failed.load(Ordering::Relaxed)
    }

    /// Record collector progress
    pub fn set_docs_processed(&self, count: u64) {
        self.docs_processed.store(count, Ordering::Relaxed);
    }

    /// Source documents folded into buckets so far
    pub fn docs_processed(&self) -> u64 {
        self.docs_processed.load(Ordering::Relaxed)
    }

    /// Record the timestamp of the last source document seen
    pub fn set_last_source_timestamp(&self, ts_ms: i64) {
        self.last_source_ts.store(ts_ms, Ordering::Relaxed);
    }

    /// Timestamp of the last source document seen
    pub fn last_source_timestamp(&self) -> i64 {
        self.last_source_ts.load(Ordering::Relaxed)
    }

    /// Record the bucket timestamp of the last document seen
    pub fn set_last_target_timestamp(&self, ts_ms: i64) {
        self.last_target_ts.store(ts_ms, Ordering::Relaxed);
    }

    /// Bucket timestamp of the last document seen
    pub fn last_target_timestamp(&self) -> i64 {
        self.last_target_ts.load(Ordering::Relaxed)
    }

    /// Record the wall-clock time a document was handed to the sink
    pub fn set_last_indexing_timestamp(&self, ts_ms: i64) {
        self.last_index_ts.store(ts_ms, Ordering::Relaxed);
    }

    /// Wall-clock time the last document was handed to the sink
    pub fn last_indexing_timestamp(&self) -> i64 {
        self.last_index_ts.load(Ordering::Relaxed)
    }

    /// The most recent before-bulk record
    pub fn before_bulk_info(&self) -> Option<BeforeBulkInfo> {
        self.before_bulk.read().clone()
    }

    /// The most recent after-bulk record
    pub fn after_bulk_info(&self) -> Option<AfterBulkInfo> {
        self.after_bulk.read().clone()
    }
}

impl BulkListener for ShardTask {
    fn before_bulk(&self, info: &BeforeBulkInfo) {
        self.num_sent
            .fetch_add(info.actions as u64, Ordering::Relaxed);
        *self.before_bulk.write() = Some(info.clone());
    }

    fn after_bulk(&self, info: &AfterBulkInfo) {
        self.num_indexed
            .fetch_add(info.actions as u64, Ordering::Relaxed);
        if info.item_failures > 0 {
            self.num_failed
                .fetch_add(info.item_failures as u64, Ordering::Relaxed);
        }
        *self.after_bulk.write() = Some(info.clone());
    }

    fn after_bulk_failure(&self, _execution_id: u64, actions: usize) {
        self.num_failed.fetch_add(actions as u64, Ordering::Relaxed);
    }
}
