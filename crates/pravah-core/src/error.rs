//! Error taxonomy for engine runs.
//!
//! Every failure a run can surface is one of these kinds. Errors are not
//! swallowed inside operators or codecs; they bubble to the executor, which
//! aborts the output upload and stores the error on the job run.

use serde::Serialize;

pub type Result<T> = std::result::Result<T, EngineError>;

/// The complete failure surface of the engine.
///
/// `StorageTransient` only exists between retry attempts inside the store
/// client; by the time an error reaches a job run, exhausted retries have
/// been converted to `StoragePermanent`.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
pub enum EngineError {
    /// Retryable storage failure (network, 5xx). Internal to the store client.
    #[error("transient storage error during {op}: {message}")]
    StorageTransient { op: &'static str, message: String },

    /// Non-retryable storage failure: not found, unauthorized, or retries exhausted.
    #[error("storage error during {op}: {message}")]
    StoragePermanent { op: &'static str, message: String },

    /// Malformed input bytes. `row_offset` is the first offending row.
    #[error("decode error at row {row_offset}: {reason}")]
    Decode { row_offset: u64, reason: String },

    /// Pipeline spec failed validation; reported before any data is read.
    #[error("invalid pipeline at step {step_index}: {reason}")]
    Pipeline { step_index: usize, reason: String },

    /// An operator failed on a concrete row: strict-mode cast, accumulator overflow.
    #[error("operator error at step {step_index}, row {row_offset}: {reason}")]
    Operator {
        step_index: usize,
        row_offset: u64,
        reason: String,
    },

    /// The run would exceed its memory budget.
    #[error("resource exhausted: {reason}")]
    ResourceExhausted { reason: String },

    /// Cooperative cancellation observed. Terminal, but not an error in the
    /// run-accounting sense: no partial output is ever published.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation inside the engine.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl EngineError {
    pub fn internal(reason: impl Into<String>) -> Self {
        EngineError::Internal {
            reason: reason.into(),
        }
    }

    /// Short machine-readable kind, stable across messages.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::StorageTransient { .. } => "storage_transient",
            EngineError::StoragePermanent { .. } => "storage_permanent",
            EngineError::Decode { .. } => "decode",
            EngineError::Pipeline { .. } => "pipeline",
            EngineError::Operator { .. } => "operator",
            EngineError::ResourceExhausted { .. } => "resource_exhausted",
            EngineError::Cancelled => "cancelled",
            EngineError::Internal { .. } => "internal",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

impl From<arrow_schema::ArrowError> for EngineError {
    fn from(e: arrow_schema::ArrowError) -> Self {
        EngineError::Internal {
            reason: format!("arrow: {e}"),
        }
    }
}
