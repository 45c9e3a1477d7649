//! # Pravah Engine - Executor and Job Driver
//!
//! The executor runs one compiled pipeline against a reader and a writer
//! with bounded memory, parallel per-batch workers, order-preserving
//! reassembly, and cooperative batch-granular cancellation.
//!
//! The driver wraps the executor in the embedding API: fingerprint
//! computation, result-cache lookup, at-most-one concurrent execution per
//! fingerprint, progress snapshots, cancel, and await.
//!
//! ## Embedding
//!
//! ```no_run
//! use std::sync::Arc;
//! use pravah_engine::{Engine, MemoryCache, StartOutcome};
//! use pravah_io::MemoryStores;
//! use pravah_core::EngineOptions;
//!
//! # async fn example(spec: pravah_core::JobSpec) -> pravah_core::Result<()> {
//! let engine = Arc::new(Engine::new(
//!     Arc::new(MemoryStores::new()),
//!     Arc::new(MemoryCache::new()),
//!     EngineOptions::from_env(),
//! ));
//! match engine.start(spec).await? {
//!     StartOutcome::Started(id) | StartOutcome::Attached(id) => {
//!         let run = engine.await_run(id).await?;
//!         println!("{:?} -> {:?}", run.state, run.output_location);
//!     }
//!     StartOutcome::CacheHit { output_location, .. } => {
//!         println!("cached at {output_location}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod driver;
pub mod executor;
pub mod progress;

pub use cache::{MemoryCache, ResultCache};
pub use driver::{Engine, StartOutcome};
pub use progress::ProgressCounters;
