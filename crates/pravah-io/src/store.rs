//! Object-store client: ranged reads, multipart uploads, retry.
//!
//! Wraps any [`object_store::ObjectStore`] backend with the engine's error
//! taxonomy and a finite retry budget. Reads are retried transparently,
//! including mid-stream resume from the last delivered offset; writes retry
//! only inside an unfinished part (delegated to the backend), and the
//! multipart `complete` call is the single atomic publication point.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjPath;
use object_store::{GetOptions, GetRange, ObjectStore};
use tracing::warn;

use pravah_core::{EngineError, Result};

/// Finite retry budget for transient storage failures. Exhaustion surfaces
/// as `StoragePermanent`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: `base * 2^attempt`, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

fn is_transient(err: &object_store::Error) -> bool {
    matches!(err, object_store::Error::Generic { .. })
}

fn permanent(op: &'static str, err: object_store::Error) -> EngineError {
    EngineError::StoragePermanent {
        op,
        message: err.to_string(),
    }
}

/// Result of a `head` call.
#[derive(Debug, Clone)]
pub struct HeadInfo {
    pub size: u64,
    pub etag: Option<String>,
}

/// Streaming chunks from a ranged read.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Retrying client over one bucket's object store.
///
/// The client never holds more than one part of write buffer in flight per
/// upload; read-side buffering is bounded by the consumer's channel.
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl StoreClient {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The underlying store, for codecs that drive their own ranged reads.
    pub fn raw(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    pub async fn head(&self, key: &str) -> Result<HeadInfo> {
        let path = ObjPath::from(key);
        let mut attempt = 0;
        loop {
            match self.store.head(&path).await {
                Ok(meta) => {
                    return Ok(HeadInfo {
                        size: meta.size,
                        etag: meta.e_tag,
                    })
                }
                Err(e) if is_transient(&e) && attempt + 1 < self.retry.max_attempts => {
                    warn!(%key, attempt, error = %e, "retrying head");
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(permanent("head", e)),
            }
        }
    }

    /// One bounded range. `offset >= size` yields empty bytes; a range past
    /// EOF is clamped to a short final read.
    pub async fn get_range(&self, key: &str, offset: u64, length: usize) -> Result<Bytes> {
        let size = self.head(key).await?.size;
        if offset >= size {
            return Ok(Bytes::new());
        }
        let end = size.min(offset + length as u64);
        let path = ObjPath::from(key);
        let mut attempt = 0;
        loop {
            match self.store.get_range(&path, offset..end).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if is_transient(&e) && attempt + 1 < self.retry.max_attempts => {
                    warn!(%key, attempt, error = %e, "retrying ranged get");
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(permanent("get_range", e)),
            }
        }
    }

    /// Full-object chunk stream. Transient failures re-open the connection
    /// from the last delivered offset; the retry budget resets on progress.
    pub async fn get_stream(&self, key: &str) -> Result<(HeadInfo, ByteStream)> {
        struct State {
            store: Arc<dyn ObjectStore>,
            path: ObjPath,
            retry: RetryPolicy,
            offset: u64,
            size: u64,
            attempt: u32,
            inner: Option<BoxStream<'static, object_store::Result<Bytes>>>,
            done: bool,
        }

        let head = self.head(key).await?;
        let state = State {
            store: self.store.clone(),
            path: ObjPath::from(key),
            retry: self.retry.clone(),
            offset: 0,
            size: head.size,
            attempt: 0,
            inner: None,
            done: false,
        };

        let stream = stream::unfold(state, |mut st| async move {
            loop {
                if st.done || st.offset >= st.size {
                    return None;
                }
                if st.inner.is_none() {
                    let opts = GetOptions {
                        range: Some(GetRange::Bounded(st.offset..st.size)),
                        ..Default::default()
                    };
                    match st.store.get_opts(&st.path, opts).await {
                        Ok(result) => st.inner = Some(result.into_stream()),
                        Err(e) if is_transient(&e) && st.attempt + 1 < st.retry.max_attempts => {
                            warn!(key = %st.path, attempt = st.attempt, error = %e, "retrying get");
                            tokio::time::sleep(st.retry.delay(st.attempt)).await;
                            st.attempt += 1;
                            continue;
                        }
                        Err(e) => {
                            st.done = true;
                            return Some((Err(permanent("get", e)), st));
                        }
                    }
                }
                match st.inner.as_mut().expect("stream just opened").next().await {
                    Some(Ok(chunk)) => {
                        st.offset += chunk.len() as u64;
                        st.attempt = 0;
                        return Some((Ok(chunk), st));
                    }
                    Some(Err(e)) if is_transient(&e) && st.attempt + 1 < st.retry.max_attempts => {
                        warn!(key = %st.path, attempt = st.attempt, error = %e, "resuming get");
                        st.inner = None;
                        tokio::time::sleep(st.retry.delay(st.attempt)).await;
                        st.attempt += 1;
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((Err(permanent("get", e)), st));
                    }
                    // Short stream end before the requested range: reopen.
                    None => st.inner = None,
                }
            }
        })
        .boxed();

        Ok((head, stream))
    }

    /// Begin a multipart upload. Nothing becomes visible at `key` until
    /// [`PartUpload::complete`] returns.
    pub async fn start_multipart(&self, key: &str) -> Result<PartUpload> {
        let path = ObjPath::from(key);
        let inner = self
            .store
            .put_multipart(&path)
            .await
            .map_err(|e| permanent("multipart_start", e))?;
        Ok(PartUpload {
            path,
            inner: Some(inner),
            bytes_sent: 0,
        })
    }
}

/// An in-progress multipart upload. Parts are appended sequentially; the
/// upload publishes atomically on `complete` and `abort` is idempotent.
pub struct PartUpload {
    path: ObjPath,
    inner: Option<Box<dyn object_store::MultipartUpload>>,
    bytes_sent: u64,
}

impl PartUpload {
    pub async fn append_part(&mut self, data: Bytes) -> Result<()> {
        let upload = self
            .inner
            .as_mut()
            .ok_or_else(|| EngineError::internal("append_part after complete or abort"))?;
        let len = data.len() as u64;
        upload
            .put_part(data.into())
            .await
            .map_err(|e| permanent("multipart_put", e))?;
        self.bytes_sent += len;
        Ok(())
    }

    /// Atomic publication point. Consumes the upload; after this returns,
    /// readers observe the complete object.
    pub async fn complete(&mut self) -> Result<String> {
        let mut upload = self
            .inner
            .take()
            .ok_or_else(|| EngineError::internal("complete after complete or abort"))?;
        upload
            .complete()
            .await
            .map_err(|e| permanent("multipart_complete", e))?;
        Ok(self.path.to_string())
    }

    /// Abandon the upload. Safe to call repeatedly or after `complete`.
    pub async fn abort(&mut self) -> Result<()> {
        match self.inner.take() {
            Some(mut upload) => upload
                .abort()
                .await
                .map_err(|e| permanent("multipart_abort", e)),
            None => Ok(()),
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn key(&self) -> String {
        self.path.to_string()
    }
}

/// Maps bucket names to object stores. The engine resolves input and output
/// buckets through this at run start; credentials stay opaque to it.
pub trait StoreProvider: Send + Sync {
    fn bucket(&self, name: &str) -> Result<Arc<dyn ObjectStore>>;
}

/// In-memory buckets, created on first use. The test and embedding fixture.
#[derive(Default)]
pub struct MemoryStores {
    buckets: Mutex<HashMap<String, Arc<InMemory>>>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreProvider for MemoryStores {
    fn bucket(&self, name: &str) -> Result<Arc<dyn ObjectStore>> {
        let mut buckets = self.buckets.lock().expect("bucket registry poisoned");
        let store = buckets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemory::new()));
        Ok(store.clone() as Arc<dyn ObjectStore>)
    }
}

/// Filesystem-backed buckets under a root directory, one subdirectory per
/// bucket. Used by the CLI for local runs.
pub struct LocalStores {
    root: PathBuf,
}

impl LocalStores {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StoreProvider for LocalStores {
    fn bucket(&self, name: &str) -> Result<Arc<dyn ObjectStore>> {
        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir).map_err(|e| EngineError::StoragePermanent {
            op: "bucket_open",
            message: format!("create {}: {e}", dir.display()),
        })?;
        let store = LocalFileSystem::new_with_prefix(&dir).map_err(|e| permanent("bucket_open", e))?;
        Ok(Arc::new(store))
    }
}

/// S3 buckets with credentials and region from the environment.
#[derive(Default)]
pub struct S3Stores;

impl StoreProvider for S3Stores {
    fn bucket(&self, name: &str) -> Result<Arc<dyn ObjectStore>> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(name)
            .build()
            .map_err(|e| permanent("bucket_open", e))?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay(0), Duration::from_millis(100));
        assert_eq!(retry.delay(1), Duration::from_millis(200));
        assert_eq!(retry.delay(3), Duration::from_millis(800));
        assert_eq!(retry.delay(10), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn head_and_ranged_get_clamp_at_eof() {
        let stores = MemoryStores::new();
        let client = StoreClient::new(stores.bucket("in").unwrap()).with_retry(RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        });
        let store = stores.bucket("in").unwrap();
        store
            .put(&ObjPath::from("data.csv"), Bytes::from_static(b"hello").into())
            .await
            .unwrap();

        let head = client.head("data.csv").await.unwrap();
        assert_eq!(head.size, 5);

        let tail = client.get_range("data.csv", 3, 100).await.unwrap();
        assert_eq!(&tail[..], b"lo");
        let past = client.get_range("data.csv", 5, 10).await.unwrap();
        assert!(past.is_empty());
    }

    #[tokio::test]
    async fn multipart_publishes_only_on_complete() {
        let stores = MemoryStores::new();
        let client = StoreClient::new(stores.bucket("out").unwrap());
        let store = stores.bucket("out").unwrap();

        let mut upload = client.start_multipart("result.csv").await.unwrap();
        upload
            .append_part(Bytes::from_static(b"a,b\n1,2\n"))
            .await
            .unwrap();
        assert!(store.head(&ObjPath::from("result.csv")).await.is_err());

        upload.complete().await.unwrap();
        let meta = store.head(&ObjPath::from("result.csv")).await.unwrap();
        assert_eq!(meta.size, 8);
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_leaves_nothing() {
        let stores = MemoryStores::new();
        let client = StoreClient::new(stores.bucket("out").unwrap());
        let store = stores.bucket("out").unwrap();

        let mut upload = client.start_multipart("result.csv").await.unwrap();
        upload.append_part(Bytes::from_static(b"xx")).await.unwrap();
        upload.abort().await.unwrap();
        upload.abort().await.unwrap();
        assert!(store.head(&ObjPath::from("result.csv")).await.is_err());
    }

    #[tokio::test]
    async fn get_stream_covers_whole_object() {
        let stores = MemoryStores::new();
        let client = StoreClient::new(stores.bucket("in").unwrap());
        let store = stores.bucket("in").unwrap();
        let body: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        store
            .put(&ObjPath::from("blob"), Bytes::from(body.clone()).into())
            .await
            .unwrap();

        let (head, mut stream) = client.get_stream("blob").await.unwrap();
        assert_eq!(head.size, body.len() as u64);
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, body);
    }
}
