//! CSV reader and writer.
//!
//! The reader detects a header row, infers column types from a bounded
//! sample, and decodes the remainder of the stream against that schema.
//! Values that fail to parse as the inferred type become null, unless the
//! reader is strict, in which case the run fails at the offending row.
//! The writer always emits a header and quotes per RFC 4180.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use arrow_schema::{Field, Schema, SchemaRef};
use async_trait::async_trait;
use csv::StringRecord;
use pravah_core::{Batch, EngineError, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::bridge::{spawn_byte_bridge, ByteChannelReader};
use super::column::ColumnBuilder;
use super::infer::{classify_text, combine, to_value_type, Lattice};
use super::{BatchReader, BatchWriter, PartBuffer, ReaderOptions, WriteSummary, WriterOptions};
use crate::store::{PartUpload, StoreClient};

const BATCH_CHANNEL_CAPACITY: usize = 2;

pub struct CsvReader {
    schema: SchemaRef,
    rx: mpsc::Receiver<Result<Batch>>,
}

impl CsvReader {
    pub async fn open(client: &StoreClient, key: &str, opts: ReaderOptions) -> Result<Self> {
        let (_, stream) = client.get_stream(key).await?;
        let (byte_reader, error_slot) = spawn_byte_bridge(stream, opts.bytes_in.clone());
        let (schema_tx, schema_rx) = oneshot::channel();
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            decode_loop(byte_reader, error_slot, opts, schema_tx, batch_tx)
        });
        let schema = schema_rx
            .await
            .map_err(|_| EngineError::internal("csv decoder exited before producing a schema"))??;
        Ok(Self {
            schema,
            rx: batch_rx,
        })
    }
}

#[async_trait]
impl BatchReader for CsvReader {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    async fn next_batch(&mut self) -> Result<Option<Batch>> {
        self.rx.recv().await.transpose()
    }
}

/// Header heuristic: every field non-empty, non-numeric, and unique.
fn looks_like_header(record: &StringRecord) -> bool {
    let mut seen = HashSet::new();
    record.len() > 0
        && record.iter().all(|field| {
            let trimmed = field.trim();
            !trimmed.is_empty() && trimmed.parse::<f64>().is_err() && seen.insert(trimmed)
        })
}

fn decode_loop(
    byte_reader: ByteChannelReader,
    error_slot: Arc<Mutex<Option<EngineError>>>,
    opts: ReaderOptions,
    schema_tx: oneshot::Sender<Result<SchemaRef>>,
    batch_tx: mpsc::Sender<Result<Batch>>,
) {
    let mut records = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(opts.delimiter)
        .quote(opts.quote)
        .flexible(true)
        .from_reader(byte_reader)
        .into_records();

    // Sample for header detection and type inference. One extra record so a
    // header row does not eat into the sample.
    let mut sample = Vec::new();
    let mut pending_err = None;
    while sample.len() <= opts.sample_rows {
        match records.next() {
            Some(Ok(record)) => sample.push(record),
            Some(Err(e)) => {
                pending_err = Some(decode_error(&error_slot, sample.len() as u64, e));
                break;
            }
            None => break,
        }
    }
    if sample.is_empty() {
        let outcome = match pending_err {
            Some(e) => Err(e),
            None => Ok(Arc::new(Schema::empty())),
        };
        let _ = schema_tx.send(outcome);
        return;
    }

    let has_header = looks_like_header(&sample[0]);
    let width = sample[0].len();
    let names: Vec<String> = if has_header {
        sample[0].iter().map(|f| f.trim().to_string()).collect()
    } else {
        (0..width).map(|i| format!("col_{i}")).collect()
    };

    let mut lattice = vec![Lattice::Unknown; width];
    for record in sample.iter().skip(has_header as usize) {
        for (i, slot) in lattice.iter_mut().enumerate() {
            *slot = combine(*slot, classify_text(record.get(i).unwrap_or("")));
        }
    }
    let types: Vec<_> = lattice.into_iter().map(to_value_type).collect();
    let schema: SchemaRef = Arc::new(Schema::new(
        names
            .iter()
            .zip(&types)
            .map(|(name, vt)| Field::new(name, vt.to_arrow(), true))
            .collect::<Vec<_>>(),
    ));
    debug!(columns = width, has_header, "inferred csv schema");
    if schema_tx.send(Ok(schema.clone())).is_err() {
        return;
    }

    let mut builders: Vec<_> = types.iter().map(|vt| ColumnBuilder::new(*vt)).collect();
    let mut rows_pending = 0usize;
    let mut row_offset = 0u64;

    let emit = |builders: &mut Vec<ColumnBuilder>, rows_pending: &mut usize| -> bool {
        let columns = builders.iter_mut().map(|b| b.finish()).collect();
        *rows_pending = 0;
        match Batch::try_new(schema.clone(), columns) {
            Ok(batch) => batch_tx.blocking_send(Ok(batch)).is_ok(),
            Err(e) => {
                let _ = batch_tx.blocking_send(Err(e.into()));
                false
            }
        }
    };

    let append_record = |record: &StringRecord,
                         builders: &mut Vec<ColumnBuilder>,
                         row_offset: u64|
     -> Result<()> {
        if opts.strict && record.len() > width {
            return Err(EngineError::Decode {
                row_offset,
                reason: format!("row has {} fields, schema has {width}", record.len()),
            });
        }
        for (i, builder) in builders.iter_mut().enumerate() {
            let cell = record.get(i).unwrap_or("");
            if cell.is_empty() {
                builder.append_null();
            } else if !builder.append_text(cell) {
                if opts.strict {
                    return Err(EngineError::Decode {
                        row_offset,
                        reason: format!("value {cell:?} does not parse as {}", types[i]),
                    });
                }
                builder.append_null();
            }
        }
        Ok(())
    };

    // Sampled rows first, then the rest of the stream. A decode failure
    // captured during sampling surfaces right after the rows preceding it.
    for record in sample.iter().skip(has_header as usize) {
        if let Err(e) = append_record(record, &mut builders, row_offset) {
            let _ = batch_tx.blocking_send(Err(e));
            return;
        }
        rows_pending += 1;
        row_offset += 1;
        if rows_pending >= opts.batch_rows.load(Ordering::Relaxed).max(1)
            && !emit(&mut builders, &mut rows_pending)
        {
            return;
        }
    }
    if let Some(e) = pending_err {
        let _ = batch_tx.blocking_send(Err(e));
        return;
    }
    drop(sample);

    loop {
        let record = match records.next() {
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                pending_err = Some(decode_error(&error_slot, row_offset, e));
                break;
            }
            None => break,
        };
        if let Err(e) = append_record(&record, &mut builders, row_offset) {
            pending_err = Some(e);
            break;
        }
        rows_pending += 1;
        row_offset += 1;
        if rows_pending >= opts.batch_rows.load(Ordering::Relaxed).max(1)
            && !emit(&mut builders, &mut rows_pending)
        {
            return;
        }
    }

    if let Some(e) = pending_err {
        let _ = batch_tx.blocking_send(Err(e));
        return;
    }
    if rows_pending > 0 {
        emit(&mut builders, &mut rows_pending);
    }
}

/// Prefer the storage error captured by the byte bridge over the csv
/// crate's rendering of the resulting io failure.
fn decode_error(
    error_slot: &Arc<Mutex<Option<EngineError>>>,
    row_offset: u64,
    e: csv::Error,
) -> EngineError {
    if let Some(storage) = error_slot.lock().expect("bridge error slot poisoned").take() {
        return storage;
    }
    EngineError::Decode {
        row_offset,
        reason: e.to_string(),
    }
}

pub struct CsvWriter {
    buffer: PartBuffer,
    schema: SchemaRef,
    delimiter: u8,
    quote: u8,
    null_literal: Option<String>,
    wrote_header: bool,
    rows: u64,
}

impl CsvWriter {
    pub fn new(upload: PartUpload, schema: SchemaRef, opts: WriterOptions) -> Self {
        Self {
            buffer: PartBuffer::new(upload, opts.part_size),
            schema,
            delimiter: opts.delimiter,
            quote: opts.quote,
            null_literal: opts.null_literal,
            wrote_header: false,
            rows: 0,
        }
    }

    fn encode_header(&self, out: &mut Vec<u8>) {
        for (i, field) in self.schema.fields().iter().enumerate() {
            if i > 0 {
                out.push(self.delimiter);
            }
            escape_field(field.name(), self.delimiter, self.quote, out);
        }
        out.push(b'\n');
    }
}

#[async_trait]
impl BatchWriter for CsvWriter {
    async fn write(&mut self, batch: &Batch) -> Result<()> {
        let mut out = Vec::with_capacity(batch.num_rows() * 16);
        if !self.wrote_header {
            self.encode_header(&mut out);
            self.wrote_header = true;
        }
        for row in 0..batch.num_rows() {
            for (i, column) in batch.columns().iter().enumerate() {
                if i > 0 {
                    out.push(self.delimiter);
                }
                match super::render_cell(column, row)? {
                    Some(cell) => escape_field(&cell, self.delimiter, self.quote, &mut out),
                    // Null renders as an empty field unless a literal is configured.
                    None => {
                        if let Some(literal) = &self.null_literal {
                            escape_field(literal, self.delimiter, self.quote, &mut out);
                        }
                    }
                }
            }
            out.push(b'\n');
        }
        self.rows += batch.num_rows() as u64;
        self.buffer.push(&out);
        self.buffer.flush_full_parts().await
    }

    async fn finish(&mut self) -> Result<WriteSummary> {
        if !self.wrote_header {
            let mut out = Vec::new();
            self.encode_header(&mut out);
            self.buffer.push(&out);
            self.wrote_header = true;
        }
        let (location, bytes_written) = self.buffer.finish().await?;
        Ok(WriteSummary {
            location,
            rows_written: self.rows,
            bytes_written,
        })
    }

    async fn abort(&mut self) -> Result<()> {
        self.buffer.abort().await
    }

    fn bytes_flushed(&self) -> u64 {
        self.buffer.bytes_flushed()
    }
}

fn escape_field(field: &str, delimiter: u8, quote: u8, out: &mut Vec<u8>) {
    let needs_quote = field
        .bytes()
        .any(|b| b == delimiter || b == quote || b == b'\n' || b == b'\r');
    if !needs_quote {
        out.extend_from_slice(field.as_bytes());
        return;
    }
    out.push(quote);
    for b in field.bytes() {
        if b == quote {
            out.push(quote);
        }
        out.push(b);
    }
    out.push(quote);
}

#[cfg(test)]
mod tests {
    use arrow_array::cast::AsArray;
    use arrow_array::types::Int64Type;
    use arrow_array::Array;
    use arrow_schema::DataType;
    use bytes::Bytes;
    use futures::StreamExt;
    use object_store::path::Path as ObjPath;
    use object_store::ObjectStore;
    use pravah_core::ValueType;

    use super::*;
    use crate::store::MemoryStores;
    use crate::store::StoreClient;
    use crate::store::StoreProvider;

    async fn client_with(key: &str, body: &str) -> StoreClient {
        let stores = MemoryStores::new();
        let store = stores.bucket("in").unwrap();
        store
            .put(&ObjPath::from(key), Bytes::from(body.to_string()).into())
            .await
            .unwrap();
        StoreClient::new(store)
    }

    async fn read_all(reader: &mut CsvReader) -> Vec<Batch> {
        let mut out = Vec::new();
        while let Some(batch) = reader.next_batch().await.unwrap() {
            out.push(batch);
        }
        out
    }

    #[test]
    fn header_heuristic() {
        assert!(looks_like_header(&StringRecord::from(vec![
            "name", "country", "age"
        ])));
        // Numeric field disqualifies.
        assert!(!looks_like_header(&StringRecord::from(vec!["name", "30"])));
        // Duplicate disqualifies.
        assert!(!looks_like_header(&StringRecord::from(vec!["a", "a"])));
    }

    #[test]
    fn escaping_per_rfc4180() {
        let mut out = Vec::new();
        escape_field("plain", b',', b'"', &mut out);
        out.push(b',');
        escape_field("with,comma", b',', b'"', &mut out);
        out.push(b',');
        escape_field("say \"hi\"", b',', b'"', &mut out);
        assert_eq!(out, b"plain,\"with,comma\",\"say \"\"hi\"\"\"".to_vec());

        // A configured quote character escapes by doubling, same as `"`.
        let mut out = Vec::new();
        escape_field("it's,here", b',', b'\'', &mut out);
        assert_eq!(out, b"'it''s,here'".to_vec());
    }

    #[tokio::test]
    async fn reads_typed_batches_with_header() {
        let client = client_with(
            "people.csv",
            "name,country,age\nAlice,USA,30\nBob,India,24\n",
        )
        .await;
        let mut reader = CsvReader::open(&client, "people.csv", ReaderOptions::new(1024))
            .await
            .unwrap();
        let schema = reader.schema();
        assert_eq!(schema.field(0).data_type(), &DataType::Utf8);
        assert_eq!(schema.field(2).name(), "age");
        assert_eq!(schema.field(2).data_type(), &DataType::Int64);

        let batches = read_all(&mut reader).await;
        assert_eq!(batches.len(), 1);
        let ages = batches[0].column(2).as_primitive::<Int64Type>();
        assert_eq!(ages.value(0), 30);
        assert_eq!(ages.value(1), 24);
    }

    #[tokio::test]
    async fn headerless_input_gets_positional_names() {
        let client = client_with("data.csv", "1,x\n2,y\n").await;
        let reader = CsvReader::open(&client, "data.csv", ReaderOptions::new(1024))
            .await
            .unwrap();
        assert_eq!(reader.schema().field(0).name(), "col_0");
        assert_eq!(reader.schema().field(0).data_type(), &DataType::Int64);
    }

    #[tokio::test]
    async fn unparseable_value_becomes_null_unless_strict() {
        let body = "age\n30\n24\nunknown\n";
        let client = client_with("a.csv", body).await;
        let mut opts = ReaderOptions::new(1024);
        // Keep the bad row out of the inference sample so the column stays int64.
        opts.sample_rows = 2;
        let mut reader = CsvReader::open(&client, "a.csv", opts).await.unwrap();
        let batches = read_all(&mut reader).await;
        let ages = batches[0].column(0).as_primitive::<Int64Type>();
        assert!(ages.is_null(2));

        let client = client_with("b.csv", body).await;
        let mut opts = ReaderOptions::new(1024);
        opts.sample_rows = 2;
        opts.strict = true;
        let mut reader = CsvReader::open(&client, "b.csv", opts).await.unwrap();
        let err = async {
            loop {
                if reader.next_batch().await?.is_none() {
                    return Ok::<_, EngineError>(());
                }
            }
        }
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Decode { row_offset: 2, .. }));
    }

    #[tokio::test]
    async fn respects_batch_row_cap() {
        let mut body = String::from("n\n");
        for i in 0..10 {
            body.push_str(&format!("{i}\n"));
        }
        let client = client_with("n.csv", &body).await;
        let mut opts = ReaderOptions::new(4);
        opts.sample_rows = 3;
        let mut reader = CsvReader::open(&client, "n.csv", opts).await.unwrap();
        let batches = read_all(&mut reader).await;
        let sizes: Vec<_> = batches.iter().map(|b| b.num_rows()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 10);
        assert!(sizes.iter().all(|&n| n <= 4));
    }

    #[tokio::test]
    async fn timestamp_column_inference() {
        let client = client_with(
            "t.csv",
            "seen_at\n2024-03-01T08:00:00Z\n2024-03-01T09:30:00Z\n",
        )
        .await;
        let reader = CsvReader::open(&client, "t.csv", ReaderOptions::new(1024))
            .await
            .unwrap();
        assert_eq!(
            ValueType::from_arrow(reader.schema().field(0).data_type()),
            Some(ValueType::Timestamp)
        );
    }

    #[tokio::test]
    async fn writer_emits_header_quotes_and_nulls() {
        let stores = MemoryStores::new();
        let store = stores.bucket("out").unwrap();
        let client = StoreClient::new(store.clone());

        let schema: SchemaRef = Arc::new(Schema::new(vec![
            Field::new("name", DataType::Utf8, true),
            Field::new("age", DataType::Int64, true),
        ]));
        let batch = Batch::try_new(
            schema.clone(),
            vec![
                Arc::new(arrow_array::StringArray::from(vec![
                    Some("with,comma"),
                    None,
                ])),
                Arc::new(arrow_array::Int64Array::from(vec![Some(30), None])),
            ],
        )
        .unwrap();

        let upload = client.start_multipart("out.csv").await.unwrap();
        let mut writer = CsvWriter::new(upload, schema, WriterOptions::new(8 << 20, 1024));
        writer.write(&batch).await.unwrap();
        let summary = writer.finish().await.unwrap();
        assert_eq!(summary.rows_written, 2);

        let bytes = store
            .get(&ObjPath::from("out.csv"))
            .await
            .unwrap()
            .into_stream()
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flat_map(|c| c.unwrap())
            .collect::<Vec<u8>>();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "name,age\n\"with,comma\",30\n,\n"
        );
    }

    #[tokio::test]
    async fn writer_honors_delimiter_quote_and_null_literal() {
        let stores = MemoryStores::new();
        let store = stores.bucket("out").unwrap();
        let client = StoreClient::new(store.clone());

        let schema: SchemaRef = Arc::new(Schema::new(vec![
            Field::new("name", DataType::Utf8, true),
            Field::new("age", DataType::Int64, true),
        ]));
        let batch = Batch::try_new(
            schema.clone(),
            vec![
                Arc::new(arrow_array::StringArray::from(vec![
                    Some("semi;colon"),
                    None,
                ])),
                Arc::new(arrow_array::Int64Array::from(vec![Some(30), None])),
            ],
        )
        .unwrap();

        let mut opts = WriterOptions::new(8 << 20, 1024);
        opts.delimiter = b';';
        opts.quote = b'\'';
        opts.null_literal = Some("NULL".into());
        let upload = client.start_multipart("out.csv").await.unwrap();
        let mut writer = CsvWriter::new(upload, schema, opts);
        writer.write(&batch).await.unwrap();
        writer.finish().await.unwrap();

        let bytes = store
            .get(&ObjPath::from("out.csv"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8(bytes.to_vec()).unwrap(),
            "name;age\n'semi;colon';30\nNULL;NULL\n"
        );
    }
}
