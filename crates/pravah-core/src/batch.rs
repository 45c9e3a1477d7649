//! Columnar batch helpers.
//!
//! A batch is an Arrow [`RecordBatch`]: a schema plus one contiguous typed
//! array and null bitmap per column. Batches move through the pipeline by
//! ownership; an operator consumes its input and produces a new owner.

use arrow_array::{Array, BooleanArray, RecordBatch};
use arrow_select::filter::{filter_record_batch, prep_null_mask_filter};

use crate::error::{EngineError, Result};

/// A batch of columnar data in Apache Arrow format.
pub type Batch = RecordBatch;

/// Default upper bound on rows per batch. The executor tunes this downward
/// when batches come out larger than the per-slot memory share.
pub const DEFAULT_BATCH_ROWS: usize = 65_536;

/// Rows where the mask bit is set, in order. A null mask bit never selects.
pub fn select_rows(batch: &RecordBatch, mask: &BooleanArray) -> Result<RecordBatch> {
    let mask = if mask.null_count() > 0 {
        prep_null_mask_filter(mask)
    } else {
        mask.clone()
    };
    Ok(filter_record_batch(batch, &mask)?)
}

/// A narrower batch with the named columns, in the given order. Column
/// buffers are reference-shared, not copied.
pub fn select_columns(batch: &RecordBatch, names: &[String]) -> Result<RecordBatch> {
    let schema = batch.schema();
    let indices = names
        .iter()
        .map(|name| {
            schema.index_of(name).map_err(|_| EngineError::Internal {
                reason: format!("column {name:?} missing from batch schema"),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(batch.project(&indices)?)
}

/// Byte-size estimate of a batch, including null bitmaps and offsets.
pub fn batch_byte_size(batch: &RecordBatch) -> usize {
    batch.get_array_memory_size()
}
