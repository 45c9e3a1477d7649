//! Async-to-blocking byte bridge for the text codecs.
//!
//! CSV and JSON-lines decoding is synchronous, CPU-bound work; the object
//! store is async. The bridge pumps the store's chunk stream into a bounded
//! channel, and a `Read` adapter drains it from inside `spawn_blocking`.

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::StreamExt;
use pravah_core::EngineError;
use tokio::sync::mpsc;

use crate::store::ByteStream;

const CHUNK_CHANNEL_CAPACITY: usize = 8;

/// Spawns the pump task and returns the blocking-side reader. The second
/// return value carries the original engine error when the stream fails;
/// the `Read` side only sees an opaque `io::Error`.
pub(crate) fn spawn_byte_bridge(
    mut stream: ByteStream,
    bytes_in: Arc<AtomicU64>,
) -> (ByteChannelReader, Arc<Mutex<Option<EngineError>>>) {
    let (tx, rx) = mpsc::channel::<Result<Bytes, EngineError>>(CHUNK_CHANNEL_CAPACITY);
    let error_slot = Arc::new(Mutex::new(None));
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let failed = item.is_err();
            if !failed {
                if let Ok(chunk) = &item {
                    bytes_in.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
            }
            // Receiver dropped means the parse side stopped (cancel or error).
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });
    (
        ByteChannelReader {
            rx,
            current: Bytes::new(),
            error_slot: error_slot.clone(),
            done: false,
        },
        error_slot,
    )
}

/// `std::io::Read` over the bridge channel. Must only be used from a
/// blocking context (`spawn_blocking`): it parks the thread between chunks.
pub(crate) struct ByteChannelReader {
    rx: mpsc::Receiver<Result<Bytes, EngineError>>,
    current: Bytes,
    error_slot: Arc<Mutex<Option<EngineError>>>,
    done: bool,
}

impl Read for ByteChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.current.is_empty() {
                let n = self.current.len().min(buf.len());
                buf[..n].copy_from_slice(&self.current[..n]);
                self.current = self.current.slice(n..);
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            match self.rx.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => {
                    self.done = true;
                    let message = e.to_string();
                    *self.error_slot.lock().expect("bridge error slot poisoned") = Some(e);
                    return Err(io::Error::other(message));
                }
                None => self.done = true,
            }
        }
    }
}
