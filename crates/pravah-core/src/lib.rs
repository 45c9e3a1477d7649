//! # Pravah Core - Engine Types and Contracts
//!
//! This crate provides the foundational types for the Pravah streaming
//! data-processing engine: the columnar batch vocabulary, the declarative
//! pipeline and job specifications, the engine error taxonomy, and the
//! job fingerprint used as the result-cache key.
//!
//! ## Key Components
//!
//! - **Batch helpers**: row/column selection and sizing over Arrow record batches
//! - **Pipeline spec**: JSON wire format for filter/project/rename/cast/aggregate steps
//! - **Job model**: job specs, run states, progress counters, cache entries
//! - **Fingerprinting**: canonical-JSON SHA-256 identity for job deduplication
//!
//! The engine itself lives in `pravah-engine`; codecs and the object-store
//! client live in `pravah-io`; operators and the compiler in `pravah-tx`.

pub mod batch;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod spec;
pub mod types;

pub use batch::{batch_byte_size, select_columns, select_rows, Batch, DEFAULT_BATCH_ROWS};
pub use config::EngineOptions;
pub use error::{EngineError, Result};
pub use fingerprint::{canonical_json, Fingerprint};
pub use spec::{AggFn, AggSpec, CmpOp, DataFormat, FormatOptions, PipelineSpec, Step};
pub use types::{
    CacheEntry, InputSpec, JobOptions, JobRun, JobSpec, JobState, OutputSpec, Progress, RunId,
    ValueType,
};

/// Version tag baked into every job fingerprint. Bumping the crate version
/// invalidates cached results, which is intended: output bytes may change
/// between engine releases.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
