//! Job driver: the embedding API of the engine.
//!
//! `start` computes the job fingerprint, consults the result cache, and
//! guarantees at most one concurrent execution per fingerprint through a
//! mutex-guarded in-flight map: the sentinel is inserted before the
//! executor spawns and removed on terminal transition. Identical
//! submissions while a run is live attach to it and share its outcome;
//! cancelling a shared run only reaches the execution once the last
//! attached consumer has cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use pravah_core::{
    CacheEntry, EngineError, EngineOptions, Fingerprint, JobRun, JobSpec, JobState, Result, RunId,
    ENGINE_VERSION,
};
use pravah_io::codec::{open_reader, open_writer, ReaderOptions, WriterOptions};
use pravah_io::{resolve_format, StoreClient, StoreProvider};
use pravah_tx::{compile, validate_structure};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::ResultCache;
use crate::executor::{execute, ExecutorConfig};
use crate::progress::ProgressCounters;

/// Outcome of a `start` call.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// A fresh run was spawned.
    Started(RunId),
    /// A previous identical job already published this output.
    CacheHit {
        run: RunId,
        output_location: String,
    },
    /// An identical run is in flight; this caller attached to it.
    Attached(RunId),
}

impl StartOutcome {
    pub fn run_id(&self) -> RunId {
        match self {
            StartOutcome::Started(id) | StartOutcome::Attached(id) => *id,
            StartOutcome::CacheHit { run, .. } => *run,
        }
    }
}

#[derive(Clone)]
struct RunStatus {
    state: JobState,
    ended_at: Option<DateTime<Utc>>,
    output_location: Option<String>,
    error: Option<EngineError>,
}

struct RunHandle {
    id: RunId,
    fingerprint: Fingerprint,
    started_at: DateTime<Utc>,
    progress: Arc<ProgressCounters>,
    cancel: CancellationToken,
    /// Consumers sharing this run; the cancel signal reaches the execution
    /// only when the count drains to zero.
    attachments: AtomicUsize,
    status: tokio::sync::watch::Sender<RunStatus>,
}

impl RunHandle {
    fn snapshot(&self) -> JobRun {
        let status = self.status.borrow().clone();
        JobRun {
            id: self.id,
            fingerprint: self.fingerprint,
            state: status.state,
            progress: self.progress.snapshot(),
            started_at: self.started_at,
            ended_at: status.ended_at,
            output_location: status.output_location,
            error: status.error,
        }
    }

    fn transition(&self, state: JobState, output_location: Option<String>, error: Option<EngineError>) {
        self.progress.force_publish();
        self.status.send_replace(RunStatus {
            state,
            ended_at: state.is_terminal().then(Utc::now),
            output_location,
            error,
        });
    }
}

struct DriverState {
    next_id: u64,
    inflight: HashMap<Fingerprint, RunId>,
    runs: HashMap<RunId, Arc<RunHandle>>,
}

/// The engine facade embedded by orchestrators.
pub struct Engine {
    stores: Arc<dyn StoreProvider>,
    cache: Arc<dyn ResultCache>,
    options: EngineOptions,
    state: Mutex<DriverState>,
}

impl Engine {
    pub fn new(
        stores: Arc<dyn StoreProvider>,
        cache: Arc<dyn ResultCache>,
        options: EngineOptions,
    ) -> Self {
        Self {
            stores,
            cache,
            options,
            state: Mutex::new(DriverState {
                next_id: 1,
                inflight: HashMap::new(),
                runs: HashMap::new(),
            }),
        }
    }

    fn new_handle(&self, fingerprint: Fingerprint, status: RunStatus) -> Arc<RunHandle> {
        let (progress, _) = ProgressCounters::new(self.options.progress_interval);
        let (status_tx, _) = tokio::sync::watch::channel(status);
        let mut state = self.state.lock().expect("driver state poisoned");
        let id = RunId(state.next_id);
        state.next_id += 1;
        let handle = Arc::new(RunHandle {
            id,
            fingerprint,
            started_at: Utc::now(),
            progress,
            cancel: CancellationToken::new(),
            attachments: AtomicUsize::new(1),
            status: status_tx,
        });
        state.runs.insert(id, handle.clone());
        handle
    }

    /// Start a job, or resolve it from the cache or an in-flight identical run.
    ///
    /// Structural pipeline validation happens here, before any data I/O;
    /// only the input `head` call (needed for the fingerprint) touches
    /// storage on this path.
    pub async fn start(self: &Arc<Self>, spec: JobSpec) -> Result<StartOutcome> {
        validate_structure(&spec.pipeline)?;

        let input_client = StoreClient::new(self.stores.bucket(&spec.input.bucket)?);
        let head = input_client.head(&spec.input.key).await?;
        let identity = head
            .etag
            .clone()
            .unwrap_or_else(|| format!("size:{}", head.size));
        let fingerprint = Fingerprint::compute(&identity, &spec.pipeline, ENGINE_VERSION);

        if let Some(entry) = self.cache.lookup(&fingerprint) {
            info!(%fingerprint, location = %entry.output_location, "cache hit");
            let handle = self.new_handle(
                fingerprint,
                RunStatus {
                    state: JobState::Succeeded,
                    ended_at: Some(Utc::now()),
                    output_location: Some(entry.output_location.clone()),
                    error: None,
                },
            );
            return Ok(StartOutcome::CacheHit {
                run: handle.id,
                output_location: entry.output_location,
            });
        }

        // Sentinel check and insert under one lock: this is what makes
        // concurrent identical submissions collapse onto one execution.
        {
            let state = self.state.lock().expect("driver state poisoned");
            if let Some(&existing) = state.inflight.get(&fingerprint) {
                if let Some(handle) = state.runs.get(&existing) {
                    handle.attachments.fetch_add(1, Ordering::SeqCst);
                    info!(%fingerprint, run = %existing, "attached to in-flight run");
                    return Ok(StartOutcome::Attached(existing));
                }
            }
        }

        let handle = self.new_handle(
            fingerprint,
            RunStatus {
                state: JobState::Queued,
                ended_at: None,
                output_location: None,
                error: None,
            },
        );
        {
            let mut state = self.state.lock().expect("driver state poisoned");
            if let Some(&existing) = state.inflight.get(&fingerprint) {
                // Lost the race between the two lock scopes; attach instead.
                state.runs.remove(&handle.id);
                if let Some(existing_handle) = state.runs.get(&existing) {
                    existing_handle.attachments.fetch_add(1, Ordering::SeqCst);
                }
                return Ok(StartOutcome::Attached(existing));
            }
            state.inflight.insert(fingerprint, handle.id);
        }

        let engine = self.clone();
        let run_handle = handle.clone();
        tokio::spawn(async move {
            engine.run_job(spec, input_client, run_handle).await;
        });
        info!(%fingerprint, run = %handle.id, "run started");
        Ok(StartOutcome::Started(handle.id))
    }

    async fn run_job(self: Arc<Self>, spec: JobSpec, input_client: StoreClient, handle: Arc<RunHandle>) {
        handle.transition(JobState::Running, None, None);
        let outcome = self.execute_job(&spec, input_client, &handle).await;
        {
            let mut state = self.state.lock().expect("driver state poisoned");
            state.inflight.remove(&handle.fingerprint);
        }
        match outcome {
            Ok(location) => {
                info!(run = %handle.id, %location, "run succeeded");
                handle.transition(JobState::Succeeded, Some(location), None);
            }
            Err(EngineError::Cancelled) => {
                info!(run = %handle.id, "run cancelled");
                handle.transition(JobState::Cancelled, None, Some(EngineError::Cancelled));
            }
            Err(e) => {
                error!(run = %handle.id, error = %e, "run failed");
                handle.transition(JobState::Failed, None, Some(e));
            }
        }
    }

    async fn execute_job(
        &self,
        spec: &JobSpec,
        input_client: StoreClient,
        handle: &RunHandle,
    ) -> Result<String> {
        let detection_bytes = spec
            .options
            .format_detection_bytes
            .unwrap_or(self.options.format_detection_bytes);
        let input_format =
            resolve_format(&input_client, &spec.input.key, spec.input.format, detection_bytes)
                .await?;

        let batch_rows = Arc::new(AtomicUsize::new(self.options.batch_rows));
        let mut reader_opts = ReaderOptions::new(self.options.batch_rows);
        reader_opts.batch_rows = batch_rows.clone();
        reader_opts.bytes_in = handle.progress.bytes_in_counter();
        let reader = open_reader(&input_client, &spec.input.key, input_format, reader_opts).await?;

        let pipeline = compile(&spec.pipeline, reader.schema())?;
        let output_format = pipeline.output_format.unwrap_or(input_format);

        let output_client = StoreClient::new(self.stores.bucket(&spec.output.bucket)?);
        let output_key = format!(
            "{}/{}.{}",
            spec.output.key_prefix.trim_end_matches('/'),
            handle.fingerprint.to_hex(),
            output_format.ext()
        );
        let mut writer_opts =
            WriterOptions::new(self.options.part_size_bytes, self.options.batch_rows);
        if let Some(delimiter) = pipeline.format_options.delimiter {
            writer_opts.delimiter = delimiter as u8;
        }
        if let Some(quote) = pipeline.format_options.quote {
            writer_opts.quote = quote as u8;
        }
        writer_opts.null_literal = pipeline.format_options.null_literal.clone();
        let writer = open_writer(
            &output_client,
            &output_key,
            output_format,
            pipeline.output_schema.clone(),
            writer_opts,
        )
        .await?;

        let config = ExecutorConfig {
            parallelism: spec
                .options
                .parallelism
                .unwrap_or(self.options.parallelism)
                .max(1),
            max_memory_bytes: spec
                .options
                .max_memory_bytes
                .unwrap_or(self.options.max_memory_bytes),
            batch_rows,
        };
        let summary = execute(
            reader,
            &pipeline,
            writer,
            handle.progress.clone(),
            handle.cancel.clone(),
            config,
        )
        .await?;

        let location = format!("{}/{}", spec.output.bucket, summary.location);
        // The upload completed above; publishing the cache entry afterwards
        // keeps cache readers from ever observing an incomplete object.
        self.cache.insert(CacheEntry {
            fingerprint: handle.fingerprint,
            output_location: location.clone(),
            row_count: summary.rows_written,
            byte_size: summary.bytes_written,
            created_at: Utc::now(),
            engine_version: ENGINE_VERSION.to_string(),
        });
        Ok(location)
    }

    fn handle(&self, id: RunId) -> Result<Arc<RunHandle>> {
        self.state
            .lock()
            .expect("driver state poisoned")
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::internal(format!("unknown run {id}")))
    }

    /// Non-blocking snapshot of a run.
    pub fn progress(&self, id: RunId) -> Result<JobRun> {
        Ok(self.handle(id)?.snapshot())
    }

    /// Request cancellation. The run reaches `Cancelled` within one batch
    /// interval. For shared runs, only the last attached consumer's cancel
    /// reaches the execution; earlier calls merely detach.
    pub fn cancel(&self, id: RunId) -> Result<()> {
        let handle = self.handle(id)?;
        let remaining = handle
            .attachments
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if remaining <= 1 {
            info!(run = %id, "cancelling run");
            handle.cancel.cancel();
        } else {
            warn!(run = %id, attached = remaining - 1, "detached one consumer; run continues");
        }
        Ok(())
    }

    /// Block until the run is terminal and return its final state.
    pub async fn await_run(&self, id: RunId) -> Result<JobRun> {
        let handle = self.handle(id)?;
        let mut status_rx = handle.status.subscribe();
        loop {
            if status_rx.borrow().state.is_terminal() {
                return Ok(handle.snapshot());
            }
            if status_rx.changed().await.is_err() {
                return Ok(handle.snapshot());
            }
        }
    }

    /// Snapshot every run this engine instance has seen.
    pub fn list_runs(&self) -> Vec<JobRun> {
        let state = self.state.lock().expect("driver state poisoned");
        let mut runs: Vec<JobRun> = state.runs.values().map(|h| h.snapshot()).collect();
        runs.sort_by_key(|r| r.id);
        runs
    }
}
