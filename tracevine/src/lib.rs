//! Implements the tracing core of an in-process APM agent.
//!
//! # Overview
//!
//! Tracevine observes units of work inside a running process, links them into
//! a causal tree per logical request (a *transaction*), and exports that tree
//! as timed, named spans. It is an automatic, retrofit tracer: per-library
//! instrumentation modules declare, via an [`OperationSpec`], how each
//! intercepted operation should be named, timed, and tracked through its
//! continuation, while the hard parts (context propagation across suspension
//! points, tree construction, naming, export) live here once.
//!
//! ## What does this crate contain?
//!
//! - **Context carrier** ([`Context`]): an execution-scoped value that holds
//!   the currently active [`SegmentHandle`] for the logical flow of control.
//!   Continuations that run later, on any thread, re-establish the right
//!   context through [`Context::bind`], [`Context::bind_once`], or the
//!   [`FutureContextExt`]/[`StreamContextExt`] wrappers.
//! - **Segment tree**: per-transaction timed nodes with parent/children
//!   links and tracing flags (`opaque`, `internal`, `ignore`).
//! - **[`Transaction`]**: owns one segment tree, aggregates naming decisions
//!   through a middleware path stack, accumulates at most one noticed error,
//!   and finalizes exactly once.
//! - **[`Recorder`]**: the engine that turns an [`OperationSpec`] plus a live
//!   call into a correctly-parented timed segment, across synchronous,
//!   callback, future, stream, and row-collapsed completion shapes. With no
//!   active transaction every recording operation degrades to an exact
//!   pass-through.
//! - **Span export** ([`export`]): the wire-record mapping plus the
//!   [`export::SpanExporter`] seam and an in-memory exporter for tests.
//!
//! # Getting Started
//!
//! ```
//! use tracevine::export::InMemorySpanExporter;
//! use tracevine::{Agent, Call, OperationSpec, TransactionKind};
//!
//! let exporter = InMemorySpanExporter::default();
//! let agent = Agent::builder()
//!     .with_exporter(exporter.clone())
//!     .build();
//! let recorder = agent.recorder();
//!
//! let txn = agent.start_transaction(TransactionKind::Background, "index-rebuild");
//! let spec = OperationSpec::new("cache.refresh");
//! txn.root().in_scope(|| {
//!     recorder.record(&spec, &Call::new(), || {
//!         // the operation being traced
//!     })
//! });
//! txn.finish();
//!
//! for record in exporter.get_finished_records().unwrap() {
//!     println!("{:?}", record);
//! }
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![allow(clippy::needless_doctest_main)]
#![cfg_attr(
    docsrs,
    feature(doc_cfg, doc_auto_cfg),
    deny(rustdoc::broken_intra_doc_links)
)]

mod agent;
mod common;
mod config;
mod context;
mod error;
pub mod export;
mod ids;
mod internal_logging;
mod naming;
mod operation;
mod record;
mod sampler;
mod segment;
mod transaction;

pub use agent::{Agent, AgentBuilder};
pub use common::{Key, KeyValue, StringValue, Value};
pub use config::Config;
pub use context::{Context, ContextGuard, FutureContextExt, StreamContextExt, WithContext};
pub use error::{TraceError, TraceResult};
#[cfg(any(feature = "testing", test))]
pub use ids::IncrementIdGenerator;
pub use ids::{IdGenerator, RandomIdGenerator, SegmentId, TraceId};
pub use operation::{AfterCall, Call, Category, MiddlewareKind, MiddlewareSpec, OperationSpec};
pub use record::{BoundCallback, Next, Recorded, Recorder, RowCallback};
pub use sampler::Sampler;
pub use segment::SegmentHandle;
pub use transaction::{NoticedError, Transaction, TransactionKind};

#[cfg(feature = "internal-logs")]
#[doc(hidden)]
pub mod _private {
    pub use tracing::{debug, error, info, warn};
}

pub mod time {
    //! Wall-clock helpers used for segment timestamps.
    use std::time::SystemTime;

    /// Returns the current time.
    pub fn now() -> SystemTime {
        SystemTime::now()
    }
}
