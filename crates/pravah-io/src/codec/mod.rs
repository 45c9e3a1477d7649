//! Streaming format codecs.
//!
//! A reader turns an object's byte stream into a finite sequence of Arrow
//! batches whose union equals the source rows; a writer turns batches back
//! into encoded parts on a multipart upload. Readers are not restartable.

use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type, TimestampMicrosecondType};
use arrow_array::{Array, ArrayRef};
use arrow_schema::{DataType, SchemaRef, TimeUnit};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat};
use pravah_core::{Batch, DataFormat, EngineError, Result, ValueType};

use crate::store::{PartUpload, StoreClient};

mod bridge;
mod column;
mod csv;
mod infer;
mod jsonl;
mod parquet;

pub use self::csv::{CsvReader, CsvWriter};
pub use self::jsonl::{JsonlReader, JsonlWriter};
pub use self::parquet::{ParquetReader, ParquetWriter};

/// Default number of rows sampled for schema inference.
pub const DEFAULT_SAMPLE_ROWS: usize = 8_192;

/// Produces schema-stable batches from one input object.
#[async_trait]
pub trait BatchReader: Send {
    /// Schema of every batch this reader yields, fixed at open time.
    fn schema(&self) -> SchemaRef;

    /// Next batch, or `None` at end of stream.
    async fn next_batch(&mut self) -> Result<Option<Batch>>;
}

/// Consumes batches into an object published atomically on `finish`.
#[async_trait]
pub trait BatchWriter: Send {
    async fn write(&mut self, batch: &Batch) -> Result<()>;

    /// Flush, complete the multipart upload, and report what was published.
    async fn finish(&mut self) -> Result<WriteSummary>;

    /// Abandon the upload; nothing becomes visible. Idempotent.
    async fn abort(&mut self) -> Result<()>;

    /// Bytes shipped to the store so far; grows as parts flush.
    fn bytes_flushed(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct WriteSummary {
    pub location: String,
    pub rows_written: u64,
    pub bytes_written: u64,
}

/// Reader-side knobs shared by all codecs.
#[derive(Clone)]
pub struct ReaderOptions {
    /// Live row cap per batch; the executor lowers it when batches come out
    /// larger than the per-slot memory share.
    pub batch_rows: Arc<AtomicUsize>,
    /// Rows scanned for header detection and type inference.
    pub sample_rows: usize,
    /// Fail the run on values that do not parse as the inferred type.
    pub strict: bool,
    /// CSV field delimiter.
    pub delimiter: u8,
    /// CSV quote character.
    pub quote: u8,
    /// Counter of raw input bytes consumed, fed into run progress.
    pub bytes_in: Arc<AtomicU64>,
}

impl ReaderOptions {
    pub fn new(batch_rows: usize) -> Self {
        Self {
            batch_rows: Arc::new(AtomicUsize::new(batch_rows)),
            sample_rows: DEFAULT_SAMPLE_ROWS,
            strict: false,
            delimiter: b',',
            quote: b'"',
            bytes_in: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Writer-side knobs shared by all codecs.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Part boundary threshold for the multipart upload.
    pub part_size: usize,
    /// CSV field delimiter.
    pub delimiter: u8,
    /// CSV quote character.
    pub quote: u8,
    /// Text written for null CSV fields; `None` leaves the field empty.
    pub null_literal: Option<String>,
    /// Parquet row-group size; matched to the executor's batch rows.
    pub row_group_rows: usize,
}

impl WriterOptions {
    pub fn new(part_size: usize, row_group_rows: usize) -> Self {
        Self {
            part_size,
            delimiter: b',',
            quote: b'"',
            null_literal: None,
            row_group_rows,
        }
    }
}

/// Open a reader for `key` in the given format.
pub async fn open_reader(
    client: &StoreClient,
    key: &str,
    format: DataFormat,
    opts: ReaderOptions,
) -> Result<Box<dyn BatchReader>> {
    match format {
        DataFormat::Csv => Ok(Box::new(CsvReader::open(client, key, opts).await?)),
        DataFormat::Jsonl => Ok(Box::new(JsonlReader::open(client, key, opts).await?)),
        DataFormat::Parquet => Ok(Box::new(ParquetReader::open(client, key, opts).await?)),
    }
}

/// Open a writer publishing to `key` in the given format.
pub async fn open_writer(
    client: &StoreClient,
    key: &str,
    format: DataFormat,
    schema: SchemaRef,
    opts: WriterOptions,
) -> Result<Box<dyn BatchWriter>> {
    let upload = client.start_multipart(key).await?;
    match format {
        DataFormat::Csv => Ok(Box::new(CsvWriter::new(upload, schema, opts))),
        DataFormat::Jsonl => Ok(Box::new(JsonlWriter::new(upload, schema, opts))),
        DataFormat::Parquet => Ok(Box::new(ParquetWriter::new(upload, schema, opts)?)),
    }
}

/// Byte accumulator over a multipart upload: encoded output collects here
/// and ships as parts once the threshold is crossed.
pub(crate) struct PartBuffer {
    upload: PartUpload,
    buf: Vec<u8>,
    part_size: usize,
}

impl PartBuffer {
    pub(crate) fn new(upload: PartUpload, part_size: usize) -> Self {
        Self {
            upload,
            buf: Vec::with_capacity(part_size.min(1 << 20)),
            part_size: part_size.max(1),
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) async fn flush_full_parts(&mut self) -> Result<()> {
        while self.buf.len() >= self.part_size {
            let rest = self.buf.split_off(self.part_size);
            let part = std::mem::replace(&mut self.buf, rest);
            self.upload.append_part(Bytes::from(part)).await?;
        }
        Ok(())
    }

    pub(crate) async fn finish(&mut self) -> Result<(String, u64)> {
        if !self.buf.is_empty() {
            let part = std::mem::take(&mut self.buf);
            self.upload.append_part(Bytes::from(part)).await?;
        }
        let location = self.upload.complete().await?;
        Ok((location, self.upload.bytes_sent()))
    }

    pub(crate) async fn abort(&mut self) -> Result<()> {
        self.buf.clear();
        self.upload.abort().await
    }

    pub(crate) fn bytes_flushed(&self) -> u64 {
        self.upload.bytes_sent()
    }
}

pub(crate) fn timestamp_to_rfc3339(micros: i64) -> String {
    DateTime::from_timestamp_micros(micros)
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Micros, true))
        .unwrap_or_else(|| micros.to_string())
}

/// Render one cell as text, `None` for null. Shared by the CSV writer.
pub(crate) fn render_cell(column: &ArrayRef, row: usize) -> Result<Option<String>> {
    if column.is_null(row) {
        return Ok(None);
    }
    let rendered = match column.data_type() {
        DataType::Int64 => column.as_primitive::<Int64Type>().value(row).to_string(),
        // Debug form keeps a trailing `.0` on integral floats so the value
        // round-trips as a float.
        DataType::Float64 => format!("{:?}", column.as_primitive::<Float64Type>().value(row)),
        DataType::Boolean => column.as_boolean().value(row).to_string(),
        DataType::Utf8 => column.as_string::<i32>().value(row).to_string(),
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            timestamp_to_rfc3339(column.as_primitive::<TimestampMicrosecondType>().value(row))
        }
        other => {
            return Err(EngineError::internal(format!(
                "unrenderable column type {other}"
            )))
        }
    };
    Ok(Some(rendered))
}

/// Cast a batch read from a wider on-disk schema into the engine's value
/// vocabulary. Unrepresentable columns fail decoding.
pub(crate) fn normalize_batch(batch: Batch) -> Result<Batch> {
    use arrow_schema::{Field, Schema};

    let mut changed = false;
    let mut fields = Vec::with_capacity(batch.num_columns());
    let mut columns = Vec::with_capacity(batch.num_columns());
    for (field, column) in batch.schema().fields().iter().zip(batch.columns()) {
        let target = engine_type_for(field.data_type()).ok_or_else(|| EngineError::Decode {
            row_offset: 0,
            reason: format!(
                "column {:?} has unsupported type {}",
                field.name(),
                field.data_type()
            ),
        })?;
        if &target == field.data_type() {
            fields.push(field.as_ref().clone());
            columns.push(column.clone());
        } else {
            changed = true;
            let cast = arrow_cast::cast(column, &target)?;
            fields.push(Field::new(field.name(), target, true));
            columns.push(cast);
        }
    }
    if !changed {
        return Ok(batch);
    }
    Ok(Batch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

/// Schema the batches of [`normalize_batch`] will carry.
pub(crate) fn normalize_schema(schema: &SchemaRef) -> Result<SchemaRef> {
    use arrow_schema::{Field, Schema};

    let fields = schema
        .fields()
        .iter()
        .map(|field| {
            let target = engine_type_for(field.data_type()).ok_or_else(|| EngineError::Decode {
                row_offset: 0,
                reason: format!(
                    "column {:?} has unsupported type {}",
                    field.name(),
                    field.data_type()
                ),
            })?;
            Ok(if &target == field.data_type() {
                field.as_ref().clone()
            } else {
                Field::new(field.name(), target, true)
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(Schema::new(fields)))
}

fn engine_type_for(dt: &DataType) -> Option<DataType> {
    if let Some(vt) = ValueType::from_arrow(dt) {
        // Timestamps are pinned to UTC regardless of source zone.
        return Some(match vt {
            ValueType::Timestamp => ValueType::Timestamp.to_arrow(),
            _ => dt.clone(),
        });
    }
    match dt {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => Some(DataType::Int64),
        DataType::Float16 | DataType::Float32 => Some(DataType::Float64),
        DataType::LargeUtf8 | DataType::Utf8View => Some(DataType::Utf8),
        DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => {
            Some(ValueType::Timestamp.to_arrow())
        }
        _ => None,
    }
}
