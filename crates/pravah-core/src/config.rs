//! Engine-wide defaults, overridable per job and via environment.

use std::time::Duration;

use crate::batch::DEFAULT_BATCH_ROWS;

const DEFAULT_MAX_MEMORY_BYTES: u64 = 1 << 30; // 1 GiB
const DEFAULT_PART_SIZE_BYTES: usize = 8 << 20; // 8 MiB
const DEFAULT_FORMAT_DETECTION_BYTES: usize = 64 << 10; // 64 KiB
const MAX_DEFAULT_PARALLELISM: usize = 8;

/// Defaults applied to every job unless its [`crate::types::JobOptions`]
/// override them.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Per-job memory ceiling, partitioned between read-ahead, in-flight
    /// batches, the writer buffer, and aggregate state.
    pub max_memory_bytes: u64,
    /// Worker count for intra-batch parallelism.
    pub parallelism: usize,
    /// Multipart upload part size.
    pub part_size_bytes: usize,
    /// Upper bound on rows per batch.
    pub batch_rows: usize,
    /// Bytes sniffed from the input head when no format is declared.
    pub format_detection_bytes: usize,
    /// Minimum interval between progress publications.
    pub progress_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            parallelism: cores.min(MAX_DEFAULT_PARALLELISM),
            part_size_bytes: DEFAULT_PART_SIZE_BYTES,
            batch_rows: DEFAULT_BATCH_ROWS,
            format_detection_bytes: DEFAULT_FORMAT_DETECTION_BYTES,
            progress_interval: Duration::from_millis(500),
        }
    }
}

impl EngineOptions {
    /// Defaults with `ENGINE_*` environment overrides applied. Unparseable
    /// values are ignored with a warning rather than failing startup.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(v) = env_parse::<u64>("ENGINE_MAX_MEMORY_BYTES") {
            opts.max_memory_bytes = v;
        }
        if let Some(v) = env_parse::<usize>("ENGINE_PARALLELISM") {
            opts.parallelism = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("ENGINE_PART_SIZE_BYTES") {
            opts.part_size_bytes = v;
        }
        if let Some(v) = env_parse::<usize>("ENGINE_BATCH_ROWS") {
            opts.batch_rows = v.max(1);
        }
        opts
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(%name, %raw, "ignoring unparseable environment override");
            None
        }
    }
}
