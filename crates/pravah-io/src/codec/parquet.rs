//! Parquet reader and writer.
//!
//! Reads row-group-at-a-time through the async Arrow reader, driving its
//! own ranged gets against the object store. The writer emits the footer
//! only on `finish`; a partial Parquet object is invalid by construction,
//! which is why publication goes through multipart `complete`.

use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use arrow_schema::SchemaRef;
use async_trait::async_trait;
use futures::StreamExt;
use object_store::path::Path as ObjPath;
use parquet::arrow::async_reader::{ParquetObjectReader, ParquetRecordBatchStream};
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::arrow::ParquetRecordBatchStreamBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use pravah_core::{batch_byte_size, Batch, EngineError, Result};

use super::{normalize_batch, normalize_schema, BatchReader, BatchWriter, PartBuffer, ReaderOptions, WriteSummary, WriterOptions};
use crate::store::{PartUpload, StoreClient};

fn pq_err(e: parquet::errors::ParquetError) -> EngineError {
    EngineError::Decode {
        row_offset: 0,
        reason: format!("parquet: {e}"),
    }
}

pub struct ParquetReader {
    schema: SchemaRef,
    stream: ParquetRecordBatchStream<ParquetObjectReader>,
    opts: ReaderOptions,
}

impl ParquetReader {
    pub async fn open(client: &StoreClient, key: &str, opts: ReaderOptions) -> Result<Self> {
        let head = client.head(key).await?;
        let reader = ParquetObjectReader::new(client.raw(), ObjPath::from(key))
            .with_file_size(head.size);
        let builder = ParquetRecordBatchStreamBuilder::new(reader)
            .await
            .map_err(pq_err)?;
        let stream = builder
            .with_batch_size(opts.batch_rows.load(Ordering::Relaxed).max(1))
            .build()
            .map_err(pq_err)?;
        let schema = normalize_schema(stream.schema())?;
        Ok(Self {
            schema,
            stream,
            opts,
        })
    }
}

#[async_trait]
impl BatchReader for ParquetReader {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    async fn next_batch(&mut self) -> Result<Option<Batch>> {
        match self.stream.next().await {
            Some(Ok(batch)) => {
                // Decompressed size stands in for wire bytes; the async
                // reader does not expose per-fetch counts.
                self.opts
                    .bytes_in
                    .fetch_add(batch_byte_size(&batch) as u64, Ordering::Relaxed);
                Ok(Some(normalize_batch(batch)?))
            }
            Some(Err(e)) => Err(pq_err(e)),
            None => Ok(None),
        }
    }
}

/// `io::Write` destination the Arrow writer encodes into; drained into
/// multipart parts after every batch.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock().expect("parquet buffer poisoned"))
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .expect("parquet buffer poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct ParquetWriter {
    buffer: SharedBuffer,
    writer: Option<ArrowWriter<SharedBuffer>>,
    parts: PartBuffer,
    rows: u64,
}

impl ParquetWriter {
    pub fn new(upload: PartUpload, schema: SchemaRef, opts: WriterOptions) -> Result<Self> {
        let buffer = SharedBuffer::default();
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_max_row_group_size(opts.row_group_rows.max(1))
            .build();
        let writer = ArrowWriter::try_new(buffer.clone(), schema, Some(props))
            .map_err(|e| EngineError::internal(format!("parquet writer: {e}")))?;
        Ok(Self {
            buffer,
            writer: Some(writer),
            parts: PartBuffer::new(upload, opts.part_size),
            rows: 0,
        })
    }

    fn writer_mut(&mut self) -> Result<&mut ArrowWriter<SharedBuffer>> {
        self.writer
            .as_mut()
            .ok_or_else(|| EngineError::internal("write after finish or abort"))
    }
}

#[async_trait]
impl BatchWriter for ParquetWriter {
    async fn write(&mut self, batch: &Batch) -> Result<()> {
        self.writer_mut()?
            .write(batch)
            .map_err(|e| EngineError::internal(format!("parquet encode: {e}")))?;
        self.rows += batch.num_rows() as u64;
        let encoded = self.buffer.drain();
        self.parts.push(&encoded);
        self.parts.flush_full_parts().await
    }

    async fn finish(&mut self) -> Result<WriteSummary> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| EngineError::internal("finish after finish or abort"))?;
        writer
            .close()
            .map_err(|e| EngineError::internal(format!("parquet close: {e}")))?;
        let encoded = self.buffer.drain();
        self.parts.push(&encoded);
        let (location, bytes_written) = self.parts.finish().await?;
        Ok(WriteSummary {
            location,
            rows_written: self.rows,
            bytes_written,
        })
    }

    async fn abort(&mut self) -> Result<()> {
        // Dropping the writer discards the unflushed row group and footer.
        self.writer = None;
        self.parts.abort().await
    }

    fn bytes_flushed(&self) -> u64 {
        self.parts.bytes_flushed()
    }
}
