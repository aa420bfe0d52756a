//! Error types for the downsample engine

use thiserror::Error;

/// Main error type for a shard downsample run
#[derive(Error, Debug)]
pub enum DownsampleError {
    /// The surrounding task was cancelled externally
    #[error("Downsample task cancelled: {0}")]
    Cancelled(String),

    /// Bulk indexing into the target index failed
    ///
    /// Raised when a batch reports item-level failures, when a transport
    /// failure survives all retries, or when the final sent/indexed
    /// accounting does not line up. `retryable` tells the orchestrator
    /// whether re-running the shard from the last completed series id is
    /// worthwhile.
    #[error("Bulk indexing failure: {message} (retryable: {retryable})")]
    BulkIndexing {
        /// Human-readable failure description
        message: String,
        /// Whether the shard may be retried from the resume point
        retryable: bool,
    },

    /// The document stream violated the sort contract
    ///
    /// The iterator must yield documents sorted by series id ascending and
    /// timestamp descending within a series. A violation is a programmer
    /// error in the iterator; the shard is failed without retry.
    #[error("Ordering violation: {0}")]
    OrderingViolation(String),

    /// Field producer construction failed
    #[error("Field setup error: {0}")]
    FieldSetup(#[from] FieldSetupError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Series id bytes could not be decoded into dimensions
    #[error("Corrupted series id: {0}")]
    TsidDecode(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Rollup document serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while constructing field producers
///
/// These surface before collection begins, while the task is still in the
/// `Initializing` state.
#[derive(Error, Debug)]
pub enum FieldSetupError {
    /// A configured field name is missing or empty
    #[error("Missing field: {0}")]
    MissingField(String),

    /// A field's configuration contradicts its metric type
    #[error("Mapping mismatch for field {field}: {message}")]
    MappingMismatch {
        /// The offending field name
        field: String,
        /// Description of the mismatch
        message: String,
    },
}

/// A transport-level failure reported by the index writer
///
/// Retryable errors are retried inside the bulk sink with exponential
/// backoff; they only surface as [`DownsampleError::BulkIndexing`] once the
/// retry budget is exhausted.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct TransportError {
    /// Human-readable failure description
    pub message: String,
    /// Whether a retry of the same batch may succeed
    pub retryable: bool,
}

impl TransportError {
    /// A transient failure worth retrying (timeouts, connection resets)
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure (malformed request, missing target index)
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, DownsampleError>;
