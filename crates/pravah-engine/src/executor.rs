//! Pipeline execution.
//!
//! Topology: one reader task feeds a bounded channel; a pool of workers
//! runs the row-scoped chain per batch; a single consumer reassembles
//! worker output in reader order through a sequence-numbered reorder
//! buffer and either writes directly (streaming) or absorbs into the
//! aggregate stage, which emits on end-of-stream.
//!
//! Cancellation is cooperative and batch-granular: every stage observes
//! the token between batches, channels drain, and the multipart upload is
//! aborted, so no partial object ever becomes visible.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pravah_core::{batch_byte_size, Batch, EngineError, Result};
use pravah_io::{BatchReader, BatchWriter, WriteSummary};
use pravah_tx::{apply_chain, Aggregator, CompiledPipeline, RowOperator};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::progress::ProgressCounters;

/// Per-run execution knobs, resolved from engine and job options.
pub struct ExecutorConfig {
    pub parallelism: usize,
    pub max_memory_bytes: u64,
    /// Live row cap shared with the reader; lowered when batches exceed the
    /// per-slot memory share.
    pub batch_rows: Arc<AtomicUsize>,
}

fn record(first_error: &Mutex<Option<EngineError>>, token: &CancellationToken, e: EngineError) {
    let mut slot = first_error.lock().expect("error slot poisoned");
    if slot.is_none() {
        *slot = Some(e);
    }
    drop(slot);
    token.cancel();
}

fn has_failed(first_error: &Mutex<Option<EngineError>>) -> bool {
    first_error.lock().expect("error slot poisoned").is_some()
}

/// Shift a batch-relative row offset to the batch's base in the input.
fn offset_rows(e: EngineError, base: u64) -> EngineError {
    match e {
        EngineError::Operator {
            step_index,
            row_offset,
            reason,
        } => EngineError::Operator {
            step_index,
            row_offset: row_offset + base,
            reason,
        },
        other => other,
    }
}

/// Slice oversized batches down to the per-slot share, and lower the shared
/// row cap so later reads arrive pre-sized. Slices share buffers, so the
/// per-row estimate comes from the parent batch, not the slices.
fn split_for_budget(
    batch: Batch,
    per_slot_budget: usize,
    batch_rows: &AtomicUsize,
) -> Vec<Batch> {
    let size = batch_byte_size(&batch);
    let rows = batch.num_rows();
    if size <= per_slot_budget || rows <= 1 {
        return vec![batch];
    }
    let per_row = (size / rows).max(1);
    let target_rows = (per_slot_budget / per_row).max(1);
    batch_rows.fetch_min(target_rows, Ordering::Relaxed);
    debug!(rows, target_rows, "splitting oversized batch");
    let mut out = Vec::with_capacity(rows.div_ceil(target_rows));
    let mut start = 0;
    while start < rows {
        let len = target_rows.min(rows - start);
        out.push(batch.slice(start, len));
        start += len;
    }
    out
}

/// Run one compiled pipeline: reader -> workers -> (aggregate)? -> writer.
///
/// On success the writer has completed its upload and the summary points at
/// the published object. On any failure or cancellation the upload is
/// aborted before returning.
pub async fn execute(
    reader: Box<dyn BatchReader>,
    pipeline: &CompiledPipeline,
    writer: Box<dyn BatchWriter>,
    progress: Arc<ProgressCounters>,
    cancel: CancellationToken,
    config: ExecutorConfig,
) -> Result<WriteSummary> {
    let parallelism = config.parallelism.max(1);
    let per_slot_budget = (config.max_memory_bytes / (4 * parallelism as u64)).max(1) as usize;
    let aggregate_budget = config.max_memory_bytes / 2;
    let batch_rows = config.batch_rows;

    let token = cancel.child_token();
    let first_error = Arc::new(Mutex::new(None));
    let operators: Arc<Vec<Arc<dyn RowOperator>>> = Arc::new(pipeline.operators.clone());
    let aggregate_spec = pipeline.aggregate.clone();

    let (in_tx, in_rx) = mpsc::channel::<(u64, u64, Batch)>(parallelism);
    let (out_tx, mut out_rx) = mpsc::channel::<(u64, u64, Option<Batch>)>(parallelism);
    let in_rx = Arc::new(tokio::sync::Mutex::new(in_rx));

    info!(
        parallelism,
        streaming = pipeline.is_streaming,
        "executor starting"
    );

    let reader_task = {
        let token = token.clone();
        let first_error = first_error.clone();
        let progress = progress.clone();
        let batch_rows = batch_rows.clone();
        tokio::spawn(async move {
            let mut reader = reader;
            let mut seq = 0u64;
            let mut base = 0u64;
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = reader.next_batch() => next,
                };
                match next {
                    Ok(Some(batch)) => {
                        progress.add_rows_in(batch.num_rows() as u64);
                        progress.maybe_publish();
                        for piece in split_for_budget(batch, per_slot_budget, &batch_rows) {
                            let rows = piece.num_rows() as u64;
                            let sent = tokio::select! {
                                _ = token.cancelled() => return,
                                sent = in_tx.send((seq, base, piece)) => sent,
                            };
                            if sent.is_err() {
                                return;
                            }
                            seq += 1;
                            base += rows;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        record(&first_error, &token, e);
                        break;
                    }
                }
            }
        })
    };

    let mut worker_tasks = Vec::with_capacity(parallelism);
    for worker in 0..parallelism {
        let token = token.clone();
        let first_error = first_error.clone();
        let operators = operators.clone();
        let in_rx = in_rx.clone();
        let out_tx = out_tx.clone();
        worker_tasks.push(tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = token.cancelled() => break,
                    item = async { in_rx.lock().await.recv().await } => item,
                };
                let Some((seq, base, batch)) = item else { break };
                match apply_chain(&operators, batch) {
                    Ok(result) => {
                        let sent = tokio::select! {
                            _ = token.cancelled() => break,
                            sent = out_tx.send((seq, base, result)) => sent,
                        };
                        if sent.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(worker, "operator chain failed");
                        record(&first_error, &token, offset_rows(e, base));
                        break;
                    }
                }
            }
        }));
    }
    drop(out_tx);
    drop(in_rx);

    let consumer_task = {
        let token = token.clone();
        let first_error = first_error.clone();
        let progress = progress.clone();
        let batch_rows = batch_rows.clone();
        tokio::spawn(async move {
            let mut writer = writer;
            let mut aggregator = aggregate_spec.map(Aggregator::new);
            let mut reorder: BTreeMap<u64, (u64, Option<Batch>)> = BTreeMap::new();
            let mut next_seq = 0u64;

            'recv: loop {
                let item = tokio::select! {
                    _ = token.cancelled() => break,
                    item = out_rx.recv() => item,
                };
                let Some((seq, base, result)) = item else { break };
                reorder.insert(seq, (base, result));
                // Release the contiguous prefix in reader order.
                while let Some((_, result)) = reorder.remove(&next_seq) {
                    next_seq += 1;
                    let Some(batch) = result else { continue };
                    match &mut aggregator {
                        Some(agg) => {
                            if let Err(e) = agg.absorb(&batch) {
                                record(&first_error, &token, e);
                                break 'recv;
                            }
                            if agg.state_bytes() as u64 > aggregate_budget {
                                record(
                                    &first_error,
                                    &token,
                                    EngineError::ResourceExhausted {
                                        reason: format!(
                                            "aggregate state ({} bytes) exceeds half the memory budget",
                                            agg.state_bytes()
                                        ),
                                    },
                                );
                                break 'recv;
                            }
                        }
                        None => {
                            if let Err(e) = writer.write(&batch).await {
                                record(&first_error, &token, e);
                                break 'recv;
                            }
                            progress.add_rows_out(batch.num_rows() as u64);
                            progress.record_bytes_out(writer.bytes_flushed());
                            progress.maybe_publish();
                        }
                    }
                }
            }

            if !token.is_cancelled() && !has_failed(&first_error) {
                if let Some(agg) = aggregator.take() {
                    let rows = batch_rows.load(Ordering::Relaxed).max(1);
                    match agg.finalize(rows) {
                        Ok(batches) => {
                            for batch in batches {
                                if token.is_cancelled() {
                                    break;
                                }
                                if let Err(e) = writer.write(&batch).await {
                                    record(&first_error, &token, e);
                                    break;
                                }
                                progress.add_rows_out(batch.num_rows() as u64);
                                progress.record_bytes_out(writer.bytes_flushed());
                                progress.maybe_publish();
                            }
                        }
                        Err(e) => record(&first_error, &token, e),
                    }
                }
            }
            writer
        })
    };

    if let Err(e) = reader_task.await {
        record(
            &first_error,
            &token,
            EngineError::internal(format!("reader task failed: {e}")),
        );
    }
    for task in worker_tasks {
        if let Err(e) = task.await {
            record(
                &first_error,
                &token,
                EngineError::internal(format!("worker task failed: {e}")),
            );
        }
    }
    let mut writer = consumer_task
        .await
        .map_err(|e| EngineError::internal(format!("writer task failed: {e}")))?;

    progress.force_publish();
    if cancel.is_cancelled() {
        let _ = writer.abort().await;
        return Err(EngineError::Cancelled);
    }
    let first_error_taken = first_error.lock().expect("error slot poisoned").take();
    if let Some(e) = first_error_taken {
        let _ = writer.abort().await;
        return Err(e);
    }

    let summary = match writer.finish().await {
        Ok(summary) => summary,
        Err(e) => {
            let _ = writer.abort().await;
            return Err(e);
        }
    };
    progress.record_bytes_out(summary.bytes_written);
    progress.force_publish();
    info!(rows = summary.rows_written, bytes = summary.bytes_written, "executor finished");
    Ok(summary)
}
