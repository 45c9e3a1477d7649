//! JSON-lines reader and writer.
//!
//! One JSON object per line. The schema is the union of fields seen in the
//! sample, in first-seen order; after the sample the schema is locked.
//! Missing fields read as null; type violations null out or fail the run
//! per the strict flag; a line that is not a JSON object always fails.

use std::io::{BufRead, BufReader};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use arrow_schema::{Field, Schema, SchemaRef};
use async_trait::async_trait;
use pravah_core::{Batch, EngineError, Result, ValueType};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::bridge::{spawn_byte_bridge, ByteChannelReader};
use super::column::ColumnBuilder;
use super::{BatchReader, BatchWriter, PartBuffer, ReaderOptions, WriteSummary, WriterOptions};
use crate::store::{PartUpload, StoreClient};

const BATCH_CHANNEL_CAPACITY: usize = 2;

pub struct JsonlReader {
    schema: SchemaRef,
    rx: mpsc::Receiver<Result<Batch>>,
}

impl JsonlReader {
    pub async fn open(client: &StoreClient, key: &str, opts: ReaderOptions) -> Result<Self> {
        let (_, stream) = client.get_stream(key).await?;
        let (byte_reader, error_slot) = spawn_byte_bridge(stream, opts.bytes_in.clone());
        let (schema_tx, schema_rx) = oneshot::channel();
        let (batch_tx, batch_rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            decode_loop(byte_reader, error_slot, opts, schema_tx, batch_tx)
        });
        let schema = schema_rx.await.map_err(|_| {
            EngineError::internal("jsonl decoder exited before producing a schema")
        })??;
        Ok(Self {
            schema,
            rx: batch_rx,
        })
    }
}

#[async_trait]
impl BatchReader for JsonlReader {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    async fn next_batch(&mut self) -> Result<Option<Batch>> {
        self.rx.recv().await.transpose()
    }
}

fn value_type_of(value: &Value) -> Option<ValueType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(ValueType::Bool),
        Value::Number(n) if n.is_i64() => Some(ValueType::Int64),
        Value::Number(_) => Some(ValueType::Float64),
        // Nested values are carried as their JSON text.
        Value::String(_) | Value::Array(_) | Value::Object(_) => Some(ValueType::String),
    }
}

fn widen(current: Option<ValueType>, observed: ValueType) -> ValueType {
    match current {
        None => observed,
        Some(cur) if cur == observed => cur,
        Some(ValueType::Int64) if observed == ValueType::Float64 => ValueType::Float64,
        Some(ValueType::Float64) if observed == ValueType::Int64 => ValueType::Float64,
        Some(_) => ValueType::String,
    }
}

fn parse_line(line: &str, row_offset: u64) -> Result<serde_json::Map<String, Value>> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(EngineError::Decode {
            row_offset,
            reason: format!("line is a JSON {} rather than an object", kind_of(&other)),
        }),
        Err(e) => Err(EngineError::Decode {
            row_offset,
            reason: format!("invalid JSON: {e}"),
        }),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn decode_loop(
    byte_reader: ByteChannelReader,
    error_slot: Arc<Mutex<Option<EngineError>>>,
    opts: ReaderOptions,
    schema_tx: oneshot::Sender<Result<SchemaRef>>,
    batch_tx: mpsc::Sender<Result<Batch>>,
) {
    let mut lines = BufReader::new(byte_reader).lines();
    let io_err = |error_slot: &Arc<Mutex<Option<EngineError>>>, e: std::io::Error| {
        error_slot
            .lock()
            .expect("bridge error slot poisoned")
            .take()
            .unwrap_or_else(|| EngineError::internal(format!("jsonl read: {e}")))
    };

    // Sample rows: schema fields accumulate in first-seen order and the
    // schema locks once the sample is exhausted.
    let mut names: Vec<String> = Vec::new();
    let mut types: Vec<Option<ValueType>> = Vec::new();
    let mut sample: Vec<serde_json::Map<String, Value>> = Vec::new();
    let mut pending_err = None;
    while sample.len() < opts.sample_rows {
        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                pending_err = Some(io_err(&error_slot, e));
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let map = match parse_line(&line, sample.len() as u64) {
            Ok(map) => map,
            Err(e) => {
                pending_err = Some(e);
                break;
            }
        };
        for (key, value) in &map {
            match names.iter().position(|n| n == key) {
                Some(i) => {
                    if let Some(observed) = value_type_of(value) {
                        types[i] = Some(widen(types[i], observed));
                    }
                }
                None => {
                    names.push(key.clone());
                    types.push(value_type_of(value));
                }
            }
        }
        sample.push(map);
    }
    if sample.is_empty() {
        let outcome = match pending_err {
            Some(e) => Err(e),
            None => Ok(Arc::new(Schema::empty())),
        };
        let _ = schema_tx.send(outcome);
        return;
    }

    let types: Vec<ValueType> = types
        .into_iter()
        .map(|t| t.unwrap_or(ValueType::String))
        .collect();
    let schema: SchemaRef = Arc::new(Schema::new(
        names
            .iter()
            .zip(&types)
            .map(|(name, vt)| Field::new(name, vt.to_arrow(), true))
            .collect::<Vec<_>>(),
    ));
    debug!(columns = names.len(), "inferred jsonl schema");
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

    let append_row = |map: &serde_json::Map<String, Value>,
                      builders: &mut Vec<ColumnBuilder>,
                      row_offset: u64|
     -> Result<()> {
        for (i, builder) in builders.iter_mut().enumerate() {
            match map.get(&names[i]) {
                None | Some(Value::Null) => builder.append_null(),
                Some(value) => {
                    if !builder.append_json(value) {
                        if opts.strict {
                            return Err(EngineError::Decode {
                                row_offset,
                                reason: format!(
                                    "field {:?} does not fit column type {}",
                                    names[i], types[i]
                                ),
                            });
                        }
                        builder.append_null();
                    }
                }
            }
        }
        Ok(())
    };

    for map in &sample {
        if let Err(e) = append_row(map, &mut builders, row_offset) {
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
    // A decode failure captured during sampling surfaces right after the
    // rows preceding it.
    if let Some(e) = pending_err {
        let _ = batch_tx.blocking_send(Err(e));
        return;
    }
    drop(sample);

    loop {
        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                pending_err = Some(io_err(&error_slot, e));
                break;
            }
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let map = match parse_line(&line, row_offset) {
            Ok(map) => map,
            Err(e) => {
                pending_err = Some(e);
                break;
            }
        };
        if let Err(e) = append_row(&map, &mut builders, row_offset) {
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

pub struct JsonlWriter {
    buffer: PartBuffer,
    schema: SchemaRef,
    rows: u64,
}

impl JsonlWriter {
    pub fn new(upload: PartUpload, schema: SchemaRef, opts: WriterOptions) -> Self {
        Self {
            buffer: PartBuffer::new(upload, opts.part_size),
            schema,
            rows: 0,
        }
    }
}

#[async_trait]
impl BatchWriter for JsonlWriter {
    async fn write(&mut self, batch: &Batch) -> Result<()> {
        use arrow_array::cast::AsArray;
        use arrow_array::types::{Float64Type, Int64Type, TimestampMicrosecondType};
        use arrow_schema::{DataType, TimeUnit};

        let mut out = Vec::with_capacity(batch.num_rows() * 32);
        for row in 0..batch.num_rows() {
            let mut object = serde_json::Map::with_capacity(batch.num_columns());
            for (field, column) in self.schema.fields().iter().zip(batch.columns()) {
                let value = if column.is_null(row) {
                    Value::Null
                } else {
                    match column.data_type() {
                        DataType::Int64 => {
                            Value::from(column.as_primitive::<Int64Type>().value(row))
                        }
                        DataType::Float64 => {
                            Value::from(column.as_primitive::<Float64Type>().value(row))
                        }
                        DataType::Boolean => Value::from(column.as_boolean().value(row)),
                        DataType::Utf8 => Value::from(column.as_string::<i32>().value(row)),
                        DataType::Timestamp(TimeUnit::Microsecond, _) => {
                            Value::from(super::timestamp_to_rfc3339(
                                column.as_primitive::<TimestampMicrosecondType>().value(row),
                            ))
                        }
                        other => {
                            return Err(EngineError::internal(format!(
                                "unrenderable column type {other}"
                            )))
                        }
                    }
                };
                object.insert(field.name().clone(), value);
            }
            serde_json::to_writer(&mut out, &Value::Object(object))
                .map_err(|e| EngineError::internal(format!("jsonl encode: {e}")))?;
            out.push(b'\n');
        }
        self.rows += batch.num_rows() as u64;
        self.buffer.push(&out);
        self.buffer.flush_full_parts().await
    }

    async fn finish(&mut self) -> Result<WriteSummary> {
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

#[cfg(test)]
mod tests {
    use arrow_array::cast::AsArray;
    use arrow_array::types::Int64Type;
    use arrow_array::Array;
    use arrow_schema::DataType;
    use bytes::Bytes;
    use object_store::path::Path as ObjPath;
    use object_store::ObjectStore;

    use super::*;
    use crate::store::{MemoryStores, StoreClient, StoreProvider};

    async fn client_with(key: &str, body: &str) -> StoreClient {
        let stores = MemoryStores::new();
        let store = stores.bucket("in").unwrap();
        store
            .put(&ObjPath::from(key), Bytes::from(body.to_string()).into())
            .await
            .unwrap();
        StoreClient::new(store)
    }

    async fn read_all(reader: &mut JsonlReader) -> Vec<Batch> {
        let mut out = Vec::new();
        while let Some(batch) = reader.next_batch().await.unwrap() {
            out.push(batch);
        }
        out
    }

    #[tokio::test]
    async fn unions_fields_and_nulls_missing_ones() {
        let client = client_with(
            "e.jsonl",
            "{\"a\": 1, \"b\": \"x\"}\n{\"a\": 2, \"c\": true}\n",
        )
        .await;
        let mut reader = JsonlReader::open(&client, "e.jsonl", ReaderOptions::new(1024))
            .await
            .unwrap();
        let schema = reader.schema();
        let names: Vec<_> = schema.fields().iter().map(|f| f.name().clone()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        let batches = read_all(&mut reader).await;
        let b = batches[0].column(1).as_string::<i32>();
        assert_eq!(b.value(0), "x");
        assert!(b.is_null(1));
        let c = batches[0].column(2).as_boolean();
        assert!(c.is_null(0));
        assert!(c.value(1));
    }

    #[tokio::test]
    async fn extra_fields_after_lock_are_dropped() {
        let client = client_with("l.jsonl", "{\"a\": 1}\n{\"a\": 2, \"late\": 9}\n").await;
        let mut opts = ReaderOptions::new(1024);
        opts.sample_rows = 1;
        let mut reader = JsonlReader::open(&client, "l.jsonl", opts).await.unwrap();
        assert_eq!(reader.schema().fields().len(), 1);
        let batches = read_all(&mut reader).await;
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn int_widens_to_float_in_sample() {
        let client = client_with("w.jsonl", "{\"v\": 1}\n{\"v\": 2.5}\n").await;
        let reader = JsonlReader::open(&client, "w.jsonl", ReaderOptions::new(1024))
            .await
            .unwrap();
        assert_eq!(reader.schema().field(0).data_type(), &DataType::Float64);
    }

    #[tokio::test]
    async fn malformed_line_fails_with_row_offset() {
        let client = client_with("m.jsonl", "{\"a\": 1}\nnot json\n").await;
        let mut opts = ReaderOptions::new(1024);
        opts.sample_rows = 1;
        let mut reader = JsonlReader::open(&client, "m.jsonl", opts).await.unwrap();
        let err = async {
            loop {
                if reader.next_batch().await?.is_none() {
                    return Ok::<_, EngineError>(());
                }
            }
        }
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Decode { row_offset: 1, .. }));
    }

    #[tokio::test]
    async fn type_violation_nulls_or_fails() {
        let body = "{\"v\": 1}\n{\"v\": \"oops\"}\n";
        let client = client_with("t.jsonl", body).await;
        let mut opts = ReaderOptions::new(1024);
        opts.sample_rows = 1;
        let mut reader = JsonlReader::open(&client, "t.jsonl", opts.clone()).await.unwrap();
        let batches = read_all(&mut reader).await;
        let v: Vec<_> = batches
            .iter()
            .flat_map(|b| {
                let col = b.column(0).as_primitive::<Int64Type>();
                (0..b.num_rows())
                    .map(|i| col.is_null(i))
                    .collect::<Vec<_>>()
            })
            .collect();
        assert_eq!(v, [false, true]);

        let client = client_with("t2.jsonl", body).await;
        opts.strict = true;
        let mut reader = JsonlReader::open(&client, "t2.jsonl", opts).await.unwrap();
        let err = async {
            loop {
                if reader.next_batch().await?.is_none() {
                    return Ok::<_, EngineError>(());
                }
            }
        }
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Decode { row_offset: 1, .. }));
    }

    #[tokio::test]
    async fn writer_round_trips_nulls() {
        let stores = MemoryStores::new();
        let store = stores.bucket("out").unwrap();
        let client = StoreClient::new(store.clone());

        let schema: SchemaRef = Arc::new(Schema::new(vec![Field::new(
            "v",
            DataType::Int64,
            true,
        )]));
        let batch = Batch::try_new(
            schema.clone(),
            vec![Arc::new(arrow_array::Int64Array::from(vec![
                Some(7),
                None,
            ]))],
        )
        .unwrap();

        let upload = client.start_multipart("out.jsonl").await.unwrap();
        let mut writer = JsonlWriter::new(upload, schema, WriterOptions::new(8 << 20, 1024));
        writer.write(&batch).await.unwrap();
        writer.finish().await.unwrap();

        let bytes = store
            .get(&ObjPath::from("out.jsonl"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"{\"v\":7}\n{\"v\":null}\n");
    }
}
