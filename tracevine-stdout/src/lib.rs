//! Export span records to stdout.
//!
//! Useful while wiring up instrumentation: every sampled transaction prints
//! its records in a readable block format the moment it finishes.
//!
//! # Examples
//!
//! ```no_run
//! use tracevine::{Agent, TransactionKind};
//!
//! fn init_agent() -> Agent {
//!     let exporter = tracevine_stdout::SpanExporter::default();
//!     Agent::builder().with_exporter(exporter).build()
//! }
//!
//! let agent = init_agent();
//! let txn = agent.start_transaction(TransactionKind::Background, "demo");
//! txn.finish();
//!
//! // the finished transaction is now printed:
//! //
//! // Span #0
//! //     Name: "demo"
//! //     TraceId: "7675e267b994f8f8d9b2f9143ea94f4c"
//! // ...
//! ```
#![warn(missing_debug_implementations, missing_docs)]

mod exporter;

pub use exporter::SpanExporter;
