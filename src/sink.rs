//! Bulk emission pipeline
//!
//! The collector enqueues rollup documents into a [`BulkSink`]; the sink
//! groups them into batches and hands them to a dispatcher task that calls
//! the external [`IndexWriter`]. Flow control is byte-based: once the
//! serialized size of dispatched-but-unacknowledged batches would exceed
//! the in-flight cap, `enqueue` suspends until an acknowledgement frees
//! room or the sink aborts.
//!
//! Failure handling is deliberately coarse. Transient transport errors are
//! retried with exponential backoff; item-level failures or exhausted
//! retries set a sticky abort flag and stop the run. The engine never
//! rewrites individual documents — the orchestrator retries the shard from
//! the last completed series id instead.

use crate::bucket::RollupDocument;
use crate::error::{DownsampleError, Result, TransportError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Default maximum number of documents per batch
pub const DEFAULT_MAX_ACTIONS: usize = 10_000;
/// Default maximum estimated batch size before dispatch (1 MiB)
pub const DEFAULT_MAX_BATCH_BYTES: usize = 1024 * 1024;
/// Default cap on dispatched-but-unacknowledged bytes (50 MiB)
pub const DEFAULT_MAX_IN_FLIGHT_BYTES: usize = 50 * 1024 * 1024;
/// Default retry budget for transient transport failures
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Configuration for the bulk sink
#[derive(Debug, Clone)]
pub struct BulkSinkConfig {
    /// Dispatch a batch once it holds this many documents
    pub max_actions: usize,
    /// Dispatch a batch once its estimated size reaches this many bytes
    pub max_batch_bytes: usize,
    /// Block enqueue while in-flight bytes would exceed this cap
    pub max_in_flight_bytes: usize,
    /// How many times a transient transport failure is retried
    pub max_retries: usize,
    /// Base delay between retries; doubles on each attempt
    pub retry_backoff: Duration,
}

impl Default for BulkSinkConfig {
    fn default() -> Self {
        Self {
            max_actions: DEFAULT_MAX_ACTIONS,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_in_flight_bytes: DEFAULT_MAX_IN_FLIGHT_BYTES,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl BulkSinkConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_actions == 0 {
            return Err("max_actions must be > 0".to_string());
        }
        if self.max_batch_bytes == 0 {
            return Err("max_batch_bytes must be > 0".to_string());
        }
        if self.max_in_flight_bytes < self.max_batch_bytes {
            return Err(format!(
                "max_in_flight_bytes {} is smaller than max_batch_bytes {}",
                self.max_in_flight_bytes, self.max_batch_bytes
            ));
        }
        Ok(())
    }
}

/// One batch of rollup documents bound for the target index
#[derive(Debug, Clone)]
pub struct BulkBatch {
    /// Monotonically increasing id of this dispatch within the run
    pub execution_id: u64,
    /// Target index name
    pub target_index: String,
    /// The documents in submission order
    pub documents: Vec<RollupDocument>,
    /// Estimated serialized size of the batch
    pub bytes: usize,
}

/// One failed item inside an otherwise acknowledged batch
#[derive(Debug, Clone)]
pub struct ItemFailure {
    /// Rollup document id of the failed item
    pub doc_id: String,
    /// Failure message reported by the writer
    pub message: String,
}

/// Acknowledgement for one batch
#[derive(Debug, Clone, Default)]
pub struct BulkWriteResponse {
    /// Server-side processing time for the batch
    pub took: Duration,
    /// Item-level failures; empty on full success
    pub item_failures: Vec<ItemFailure>,
}

/// External writer for the target index
///
/// Implementations serialize and transmit one batch. Transient failures
/// (timeouts, connection resets) should be reported with
/// [`TransportError::transient`] so the sink can retry them.
#[async_trait]
pub trait IndexWriter: Send + Sync {
    /// Write one batch, returning its acknowledgement
    async fn write_bulk(
        &self,
        batch: &BulkBatch,
    ) -> std::result::Result<BulkWriteResponse, TransportError>;
}

/// Snapshot taken just before a batch is dispatched
#[derive(Debug, Clone, Default)]
pub struct BeforeBulkInfo {
    /// Wall-clock time of the dispatch, epoch milliseconds
    pub wall_time_ms: i64,
    /// Batch execution id
    pub execution_id: u64,
    /// Estimated batch size in bytes
    pub estimated_bytes: usize,
    /// Number of documents in the batch
    pub actions: usize,
}

/// Snapshot taken after a batch completes
#[derive(Debug, Clone, Default)]
pub struct AfterBulkInfo {
    /// Wall-clock time of the completion, epoch milliseconds
    pub wall_time_ms: i64,
    /// Batch execution id
    pub execution_id: u64,
    /// Number of documents in the batch
    pub actions: usize,
    /// Server-side processing time in milliseconds
    pub took_ms: u64,
    /// Whether the batch reported item-level failures
    pub has_failures: bool,
    /// Number of failed items
    pub item_failures: usize,
}

/// Progress hooks invoked around each batch
///
/// The shard task handle implements this to maintain its sent/indexed/
/// failed counters and the before/after bulk info records.
pub trait BulkListener: Send + Sync {
    /// Called before a batch is handed to the writer
    fn before_bulk(&self, info: &BeforeBulkInfo);
    /// Called after a batch is acknowledged (possibly with item failures)
    fn after_bulk(&self, info: &AfterBulkInfo);
    /// Called when a batch fails at the transport level after all retries
    fn after_bulk_failure(&self, execution_id: u64, actions: usize);
}

/// Buffers rollup documents and dispatches them in bulk
///
/// Owned by the collector side; the dispatcher runs as a separate tokio
/// task and communicates back through the in-flight byte counter, the ack
/// notifier and the sticky abort flag.
pub struct BulkSink {
    config: BulkSinkConfig,
    target_index: String,
    buffer: Vec<RollupDocument>,
    buffer_bytes: usize,
    next_execution_id: u64,
    in_flight_bytes: Arc<AtomicUsize>,
    ack: Arc<Notify>,
    abort: Arc<AtomicBool>,
    tx: mpsc::Sender<BulkBatch>,
    dispatcher: JoinHandle<()>,
}

impl BulkSink {
    /// Create a sink and spawn its dispatcher task
    pub fn new(
        config: BulkSinkConfig,
        target_index: impl Into<String>,
        writer: Arc<dyn IndexWriter>,
        listener: Arc<dyn BulkListener>,
    ) -> Self {
        let in_flight_bytes = Arc::new(AtomicUsize::new(0));
        let ack = Arc::new(Notify::new());
        let abort = Arc::new(AtomicBool::new(false));

        // A small channel: ordering comes from the single dispatcher, and
        // real flow control is the byte cap, not the channel depth.
        let (tx, rx) = mpsc::channel(16);
        let dispatcher = Dispatcher {
            writer,
            listener,
            config: config.clone(),
            in_flight_bytes: Arc::clone(&in_flight_bytes),
            ack: Arc::clone(&ack),
            abort: Arc::clone(&abort),
        };
        let handle = tokio::spawn(dispatcher.run(rx));

        Self {
            config,
            target_index: target_index.into(),
            buffer: Vec::new(),
            buffer_bytes: 0,
            next_execution_id: 0,
            in_flight_bytes,
            ack,
            abort,
            tx,
            dispatcher: handle,
        }
    }

    /// Buffer one document, dispatching a batch when thresholds are hit
    ///
    /// May suspend on the in-flight byte cap. Returns without dispatching
    /// once the abort flag is set; the caller is expected to observe the
    /// flag and stop.
    pub async fn enqueue(&mut self, doc: RollupDocument) -> Result<()> {
        self.buffer_bytes += doc.size_bytes();
        self.buffer.push(doc);

        if self.buffer.len() >= self.config.max_actions
            || self.buffer_bytes >= self.config.max_batch_bytes
        {
            self.flush().await?;
        }
        Ok(())
    }

    /// Dispatch whatever is buffered, if anything
    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.next_execution_id += 1;
        let batch = BulkBatch {
            execution_id: self.next_execution_id,
            target_index: self.target_index.clone(),
            documents: std::mem::take(&mut self.buffer),
            bytes: std::mem::take(&mut self.buffer_bytes),
        };
        self.dispatch(batch).await
    }

    async fn dispatch(&mut self, batch: BulkBatch) -> Result<()> {
        loop {
            if self.abort.load(Ordering::Acquire) {
                debug!(
                    execution_id = batch.execution_id,
                    "sink aborted, dropping batch"
                );
                return Ok(());
            }
            // Register for a wakeup before re-checking the counter, so an
            // acknowledgement between the check and the await is not lost.
            let notified = self.ack.notified();
            let in_flight = self.in_flight_bytes.load(Ordering::Acquire);
            if in_flight == 0 || in_flight + batch.bytes <= self.config.max_in_flight_bytes {
                break;
            }
            debug!(
                in_flight_bytes = in_flight,
                batch_bytes = batch.bytes,
                "waiting for in-flight bytes to drain"
            );
            notified.await;
        }

        self.in_flight_bytes
            .fetch_add(batch.bytes, Ordering::AcqRel);
        let bytes = batch.bytes;
        if self.tx.send(batch).await.is_err() {
            self.in_flight_bytes.fetch_sub(bytes, Ordering::AcqRel);
            return Err(DownsampleError::BulkIndexing {
                message: "bulk dispatcher terminated unexpectedly".to_string(),
                retryable: false,
            });
        }
        Ok(())
    }

    /// Whether a batch failure has put the sink into the aborted state
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Flush the remaining buffer and wait for all in-flight batches
    pub async fn close(mut self) -> Result<()> {
        self.flush().await?;
        drop(self.tx);
        if let Err(e) = self.dispatcher.await {
            error!("bulk dispatcher task panicked: {e}");
        }
        Ok(())
    }
}

/// The receive side of the sink: executes batches one at a time
struct Dispatcher {
    writer: Arc<dyn IndexWriter>,
    listener: Arc<dyn BulkListener>,
    config: BulkSinkConfig,
    in_flight_bytes: Arc<AtomicUsize>,
    ack: Arc<Notify>,
    abort: Arc<AtomicBool>,
}

impl Dispatcher {
    async fn run(self, mut rx: mpsc::Receiver<BulkBatch>) {
        while let Some(batch) = rx.recv().await {
            let bytes = batch.bytes;
            self.execute(batch).await;
            self.in_flight_bytes.fetch_sub(bytes, Ordering::AcqRel);
            self.ack.notify_waiters();
        }
    }

    async fn execute(&self, batch: BulkBatch) {
        let actions = batch.documents.len();
        self.listener.before_bulk(&BeforeBulkInfo {
            wall_time_ms: wall_clock_ms(),
            execution_id: batch.execution_id,
            estimated_bytes: batch.bytes,
            actions,
        });
        debug!(
            execution_id = batch.execution_id,
            actions,
            bytes = batch.bytes,
            "dispatching bulk batch"
        );

        let mut attempt = 0;
        let outcome = loop {
            match self.writer.write_bulk(&batch).await {
                Ok(response) => break Ok(response),
                Err(e) if e.retryable && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.retry_backoff * 2u32.saturating_pow(attempt as u32 - 1);
                    warn!(
                        execution_id = batch.execution_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient bulk failure, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(response) => {
                let failures = &response.item_failures;
                if !failures.is_empty() {
                    // One message per doc id; repeated failures for the
                    // same id collapse.
                    let mut by_id: BTreeMap<&str, &str> = BTreeMap::new();
                    for failure in failures {
                        by_id.entry(&failure.doc_id).or_insert(&failure.message);
                    }
                    error!(
                        execution_id = batch.execution_id,
                        failures = failures.len(),
                        "bulk batch reported item failures: {by_id:?}"
                    );
                    self.abort.store(true, Ordering::Release);
                }
                self.listener.after_bulk(&AfterBulkInfo {
                    wall_time_ms: wall_clock_ms(),
                    execution_id: batch.execution_id,
                    actions,
                    took_ms: response.took.as_millis() as u64,
                    has_failures: !failures.is_empty(),
                    item_failures: failures.len(),
                });
            }
            Err(e) => {
                error!(
                    execution_id = batch.execution_id,
                    actions, "bulk batch failed after {attempt} retries: {e}"
                );
                self.listener.after_bulk_failure(batch.execution_id, actions);
                self.abort.store(true, Ordering::Release);
            }
        }
    }
}

pub(crate) fn wall_clock_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
