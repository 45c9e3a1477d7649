//! Job model: specs, run states, progress, cache entries.

use std::fmt;

use arrow_schema::{DataType, TimeUnit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::fingerprint::Fingerprint;
use crate::spec::{DataFormat, PipelineSpec};

/// The closed value-type vocabulary of the pipeline DSL.
///
/// Every column the engine processes has one of these types; codecs
/// normalize wider physical types (e.g. Parquet `INT32`) on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int64,
    Float64,
    Bool,
    String,
    Timestamp,
}

impl ValueType {
    pub fn to_arrow(self) -> DataType {
        match self {
            ValueType::Int64 => DataType::Int64,
            ValueType::Float64 => DataType::Float64,
            ValueType::Bool => DataType::Boolean,
            ValueType::String => DataType::Utf8,
            ValueType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        }
    }

    pub fn from_arrow(dt: &DataType) -> Option<Self> {
        match dt {
            DataType::Int64 => Some(ValueType::Int64),
            DataType::Float64 => Some(ValueType::Float64),
            DataType::Boolean => Some(ValueType::Bool),
            DataType::Utf8 => Some(ValueType::String),
            DataType::Timestamp(TimeUnit::Microsecond, _) => Some(ValueType::Timestamp),
            _ => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ValueType::Int64 | ValueType::Float64)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::Int64 => "int64",
            ValueType::Float64 => "float64",
            ValueType::Bool => "bool",
            ValueType::String => "string",
            ValueType::Timestamp => "timestamp",
        };
        f.write_str(s)
    }
}

/// Identifier of a single run inside one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{:06}", self.0)
    }
}

/// Input object to process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    pub bucket: String,
    pub key: String,
    /// Object size in bytes, if the caller already knows it. Otherwise the
    /// engine issues a `head` before starting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Input format; detected from the first bytes when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<DataFormat>,
}

/// Where the output object is published. The final key is
/// `{key_prefix}/{fingerprint}.{ext}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    pub bucket: String,
    pub key_prefix: String,
}

/// Per-job overrides of the engine defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_detection_bytes: Option<usize>,
}

/// A complete unit of work: one input object, one pipeline, one output prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub input: InputSpec,
    pub output: OutputSpec,
    pub pipeline: PipelineSpec,
    #[serde(default)]
    pub options: JobOptions,
}

/// Run lifecycle. Transitions are monotonic; the three right-most states
/// are terminal and final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Monotonic non-decreasing run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub bytes_in: u64,
    pub rows_in: u64,
    pub rows_out: u64,
    pub bytes_out: u64,
}

/// Observable state of one run.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub id: RunId,
    pub fingerprint: Fingerprint,
    pub state: JobState,
    pub progress: Progress,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
}

/// Persisted record of a successful run, keyed by fingerprint.
///
/// The engine emits entries after the output object is published and
/// consumes lookups on `start`; it never deletes entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub output_location: String,
    pub row_count: u64,
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
    pub engine_version: String,
}
