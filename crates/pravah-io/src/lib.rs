//! # Pravah I/O - Object Storage and Format Codecs
//!
//! This crate owns everything that crosses the byte boundary:
//!
//! - **Store client**: ranged reads, multipart uploads, head, with retry and
//!   transient/permanent error classification over any `object_store` backend
//! - **Codecs**: streaming CSV, JSON-lines, and Parquet readers and writers
//!   that exchange Arrow record batches with the executor
//! - **Format detection**: sniffing the input head when no format is declared
//!
//! Readers surface schemas inferred from a bounded sample of the input;
//! writers buffer encoded bytes into multipart parts and publish atomically
//! on `finish`, so a failed or cancelled run never leaves a visible object.

pub mod codec;
pub mod detect;
pub mod store;

pub use codec::{open_reader, open_writer, BatchReader, BatchWriter, ReaderOptions, WriterOptions, WriteSummary};
pub use detect::resolve_format;
pub use store::{
    HeadInfo, LocalStores, MemoryStores, PartUpload, RetryPolicy, S3Stores, StoreClient,
    StoreProvider,
};
