//! Streaming cross-categorization inference engine
//!
//! This crate implements the inference core of a cross-categorization
//! mixture engine: a streaming Gibbs sampler that simultaneously assigns
//! data rows to clusters within multiple independent mixtures ("kinds") and
//! reassigns feature columns across kinds, yielding a posterior over a
//! non-parametric latent block structure (rows × features → (kind, group)).
//!
//! ## Invariants (crate-wide)
//!
//! - **Streaming discipline.** Rows flow from a cyclically read file through
//!   a bounded in-memory window: the annealing schedule interleaves adds and
//!   removes so the working set exceeds neither memory nor the schedule's
//!   pass budget. The row file is never rewritten.
//!
//! - **Log-space scoring.** Group scores stay in log space until the final
//!   draw; normalization uses log-sum-exp with max subtraction and sampling
//!   uses Gumbel-max, so additive shifts never change a decision and raw
//!   sums are never exponentiated.
//!
//! - **Exact inverses.** Removing a row is the exact inverse of adding it:
//!   sufficient statistics use integer or raw-sum forms, so an add/remove
//!   pair restores every mixture bit for bit.
//!
//! - **Barrier-protected concurrency.** Per-kind mixtures are touched by at
//!   most one consumer at a time; the kind set, feature index, and worker
//!   pool are mutated only while `producer_wait` holds and nothing is in
//!   flight.
//!
//! The engine takes its logging capability by injection (a
//! [`metrics::MetricsSink`]) and never installs a global logger.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Assignment store: rowids plus per-kind global group id columns.
pub mod assignments;
/// Kind set: ordered kinds, feature index, priors, persistence.
pub mod cross_cat;
/// Top-level inference loops and query services.
pub mod engine;
/// Kind-structure sampler (feature-to-kind Gibbs with ephemeral kinds).
pub mod kernel;
/// Iteration metrics and the injected logging capability.
pub mod metrics;
/// Per-kind product mixtures with packed/global group id tracking.
pub mod mixture;
/// Clustering priors, conjugate feature models, log-space sampling.
pub mod models;
/// Bounded multi-consumer worker pool with pooled envelopes.
pub mod pool;
/// Length-delimited record streams and the cyclic row interval.
pub mod rows;
/// Annealing schedule emitting add / remove / process-batch actions.
pub mod schedule;
/// Product values and the fixed feature schema.
pub mod schema;
/// Value splitter/joiner over the feature partition.
pub mod split;

pub use crate::cross_cat::{CrossCat, ModelDump};
pub use crate::engine::{ConfigError, Engine, EngineError, InferConfig};
pub use crate::metrics::{MetricsSink, NullSink, TracingSink};
pub use crate::rows::{
    PredictQuery, PredictResult, RowIoError, RowRecord, ScoreQuery, ScoreResult,
};
pub use crate::schema::{Observed, ProductValue, Sparsity, ValueSchema};
