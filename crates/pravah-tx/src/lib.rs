//! # Pravah Transformations - Operators and Pipeline Compiler
//!
//! The operator set is the closed DSL of the engine: filter, project,
//! rename, cast, and aggregate over Arrow record batches. The compiler
//! validates a user-supplied pipeline spec against an input schema and
//! produces a typed operator chain plus the output schema.
//!
//! Row-scoped operators are pure `Batch -> Option<Batch>` functions and
//! carry no mutable state, so the executor shares one chain across all of
//! its workers. Aggregation is the one blocking stage: it accumulates
//! group state across batches and emits on end-of-stream.

pub mod aggregate;
pub mod compile;
mod literal;
pub mod ops;

pub use aggregate::{AggInit, Aggregator, AggregatorSpec};
pub use compile::{compile, validate_structure, CompiledPipeline};
pub use ops::{apply_chain, RowOperator};
