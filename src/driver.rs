//! Top-level shard run orchestration
//!
//! The [`ShardDriver`] owns the lifecycle of one shard downsample run:
//! resolve the resume point from the persisted task state, open the sorted
//! stream, wire the collector to the bulk sink, publish status
//! transitions, and produce the final [`ShardReport`]. All error-to-status
//! mapping lives here; the collector only raises.

use crate::bucket::BucketBuilder;
use crate::collector::Collector;
use crate::config::{DownsampleConfig, LabelFieldConfig, MetricFieldConfig, ShardTaskParams};
use crate::error::{DownsampleError, Result};
use crate::producer::build_producers;
use crate::reader::ShardSearcher;
use crate::rounding::Rounding;
use crate::sink::{BulkSink, BulkSinkConfig, IndexWriter};
use crate::task::{ShardTask, ShardTaskState, ShardTaskStatus, StatusPublisher};
use crate::types::ShardId;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Final report of one shard run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardReport {
    /// The shard that was downsampled
    pub shard_id: ShardId,
    /// Number of rollup documents acknowledged by the target index
    pub indexed: u64,
}

/// Orchestrates one shard downsample run
pub struct ShardDriver {
    config: DownsampleConfig,
    params: ShardTaskParams,
    metrics: Vec<MetricFieldConfig>,
    labels: Vec<LabelFieldConfig>,
    sink_config: BulkSinkConfig,
}

impl ShardDriver {
    /// Create a driver, validating all configuration up front
    pub fn new(
        config: DownsampleConfig,
        params: ShardTaskParams,
        metrics: Vec<MetricFieldConfig>,
        labels: Vec<LabelFieldConfig>,
    ) -> Result<Self> {
        config.validate().map_err(DownsampleError::Configuration)?;
        params.validate().map_err(DownsampleError::Configuration)?;
        Ok(Self {
            config,
            params,
            metrics,
            labels,
            sink_config: BulkSinkConfig::default(),
        })
    }

    /// Override the bulk sink configuration
    pub fn with_sink_config(mut self, sink_config: BulkSinkConfig) -> Result<Self> {
        sink_config
            .validate()
            .map_err(DownsampleError::Configuration)?;
        self.sink_config = sink_config;
        Ok(self)
    }

    /// Execute the shard run
    ///
    /// The searcher is a scoped read lease; it is dropped (and the lease
    /// released) on every exit path. The sink is likewise closed on every
    /// path, so in-flight batches settle before the final accounting.
    pub async fn run(
        &self,
        searcher: Box<dyn ShardSearcher>,
        writer: Arc<dyn IndexWriter>,
        task: Arc<ShardTask>,
        publisher: Arc<dyn StatusPublisher>,
        prior_state: &ShardTaskState,
    ) -> Result<ShardReport> {
        // Producer construction happens while the task is still
        // Initializing; a bad field list never reaches Started.
        let producers = build_producers(&self.metrics, &self.labels)?;

        let start = Instant::now();
        let shard_id = self.params.shard_id.clone();
        task.set_total_shard_doc_count(searcher.num_docs());

        if searcher.num_docs() == 0 {
            info!(shard = %shard_id, "shard has no documents, nothing to downsample");
            transition(&task, publisher.as_ref(), ShardTaskStatus::Completed);
            return Ok(ShardReport {
                shard_id,
                indexed: task.num_indexed(),
            });
        }

        let resume = prior_state.resume_point();
        transition(&task, publisher.as_ref(), ShardTaskStatus::Started);
        info!(
            shard = %shard_id,
            resume_tsid = ?resume.map(|t| t.to_string()),
            "shard downsample started"
        );

        let rounding = Rounding::new(&self.config);
        let mut sink = BulkSink::new(
            self.sink_config.clone(),
            self.params.target_index.clone(),
            writer,
            task.clone(),
        );

        let collect_result = {
            let builder = BucketBuilder::new(self.config.timestamp_field.clone(), producers);
            let mut collector = Collector::new(
                builder,
                &mut sink,
                &rounding,
                &task,
                self.params.series_start_ms,
            );
            match searcher.open_sorted(resume) {
                Ok(mut iter) => collector.run(iter.as_mut()).await,
                Err(e) => Err(e),
            }
        };

        let close_result = sink.close().await;
        drop(searcher);

        if let Err(e) = collect_result.and(close_result) {
            let status = match &e {
                DownsampleError::Cancelled(_) => ShardTaskStatus::Cancelled,
                _ => ShardTaskStatus::Failed,
            };
            transition(&task, publisher.as_ref(), status);
            info!(shard = %shard_id, status = ?status, "shard downsample aborted: {e}");
            return Err(e);
        }

        info!(
            shard = %shard_id,
            received = task.num_received(),
            sent = task.num_sent(),
            indexed = task.num_indexed(),
            failed = task.num_failed(),
            took_ms = start.elapsed().as_millis() as u64,
            "shard downsample finished collecting"
        );

        if task.num_indexed() != task.num_sent() {
            transition(&task, publisher.as_ref(), ShardTaskStatus::Failed);
            let message = format!(
                "shard {} indexed [{}] of sent [{}] rollup documents",
                shard_id,
                task.num_indexed(),
                task.num_sent()
            );
            error!("{message}");
            return Err(DownsampleError::BulkIndexing {
                message,
                retryable: false,
            });
        }

        if task.num_failed() > 0 {
            transition(&task, publisher.as_ref(), ShardTaskStatus::Failed);
            let message = format!(
                "shard {} failed indexing [{}] rollup documents",
                shard_id,
                task.num_failed()
            );
            error!("{message}");
            return Err(DownsampleError::BulkIndexing {
                message,
                retryable: false,
            });
        }

        transition(&task, publisher.as_ref(), ShardTaskStatus::Completed);
        info!(shard = %shard_id, indexed = task.num_indexed(), "shard downsample completed");
        Ok(ShardReport {
            shard_id,
            indexed: task.num_indexed(),
        })
    }
}

fn transition(task: &ShardTask, publisher: &dyn StatusPublisher, status: ShardTaskStatus) {
    task.set_status(status);
    publisher.publish(&ShardTaskState::new(status, None));
}
