//! Span export.
//!
//! At transaction finalize the segment tree is mapped to flat, typed wire
//! records ([`SpanRecord`]) and handed to every configured [`SpanExporter`].
//! Protocol-specific exporters are expected to be simple encoders and
//! transmitters; everything shape-related happens before they see the batch.

use std::fmt::Debug;

use futures_util::future::BoxFuture;

use crate::error::{TraceError, TraceResult};

pub(crate) mod wire;

pub use wire::{SpanRecord, WireValue};

/// Describes the result of an export.
pub type ExportResult = Result<(), TraceError>;

/// `SpanExporter` defines the interface that protocol-specific exporters must
/// implement so that they can be plugged into the agent and support sending
/// of telemetry data.
///
/// The goal of the interface is to minimize burden of implementation for
/// protocol-dependent telemetry exporters. The protocol exporter is expected
/// to be primarily a simple telemetry data encoder and transmitter.
pub trait SpanExporter: Send + Sync + Debug {
    /// Exports a batch of span records. Protocol exporters that implement
    /// this function are typically expected to serialize and transmit the
    /// data to the destination.
    ///
    /// This function will never be called concurrently for the same exporter
    /// instance. It can be called again only after the current call returns.
    ///
    /// Any retry logic that is required by the exporter is the responsibility
    /// of the exporter.
    fn export(&mut self, batch: Vec<SpanRecord>) -> BoxFuture<'static, ExportResult>;

    /// Shuts down the exporter. Called when the agent is shut down. This is
    /// an opportunity for the exporter to do any cleanup required.
    ///
    /// This function should be called only once for each `SpanExporter`
    /// instance. After the call to `shutdown`, subsequent calls to `export`
    /// are not allowed and should return an error.
    fn shutdown(&mut self) {}

    /// This is a hint to ensure that the export of any records the exporter
    /// has received prior to the call to this function SHOULD be completed
    /// as soon as possible, preferably before returning from this method.
    fn force_flush(&mut self) -> BoxFuture<'static, ExportResult> {
        Box::pin(async { Ok(()) })
    }
}

/// An in-memory span exporter that stores records in memory.
///
/// This exporter is useful for testing and debugging purposes. The finished
/// records can be retrieved using the `get_finished_records` method.
/// # Example
/// ```
/// use tracevine::export::InMemorySpanExporter;
/// use tracevine::{Agent, TransactionKind};
///
/// let exporter = InMemorySpanExporter::default();
/// let agent = Agent::builder().with_exporter(exporter.clone()).build();
///
/// let txn = agent.start_transaction(TransactionKind::Background, "say-hello");
/// txn.finish();
///
/// let records = exporter.get_finished_records().unwrap();
/// for record in records {
///     println!("{:?}", record)
/// }
/// ```
#[derive(Clone, Debug)]
pub struct InMemorySpanExporter {
    records: std::sync::Arc<std::sync::Mutex<Vec<SpanRecord>>>,
}

impl Default for InMemorySpanExporter {
    fn default() -> Self {
        InMemorySpanExporterBuilder::new().build()
    }
}

/// Builder for [`InMemorySpanExporter`].
/// # Example
/// ```
/// use tracevine::export::InMemorySpanExporterBuilder;
///
/// let exporter = InMemorySpanExporterBuilder::new().build();
/// ```
#[derive(Clone, Debug)]
pub struct InMemorySpanExporterBuilder {}

impl Default for InMemorySpanExporterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySpanExporterBuilder {
    /// Creates a new instance of the `InMemorySpanExporterBuilder`.
    pub fn new() -> Self {
        Self {}
    }

    /// Creates a new instance of the `InMemorySpanExporter`.
    pub fn build(&self) -> InMemorySpanExporter {
        InMemorySpanExporter {
            records: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

impl InMemorySpanExporter {
    /// Returns the finished records as a vector of `SpanRecord`.
    ///
    /// # Errors
    ///
    /// Returns a `TraceError` if the internal lock cannot be acquired.
    pub fn get_finished_records(&self) -> TraceResult<Vec<SpanRecord>> {
        self.records
            .lock()
            .map(|records_guard| records_guard.iter().cloned().collect())
            .map_err(TraceError::from)
    }

    /// Clears the internal storage of finished records.
    pub fn reset(&self) {
        let _ = self
            .records
            .lock()
            .map(|mut records_guard| records_guard.clear());
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&mut self, batch: Vec<SpanRecord>) -> BoxFuture<'static, ExportResult> {
        let result = self
            .records
            .lock()
            .map(|mut records_guard| records_guard.extend(batch))
            .map_err(|err| TraceError::ExportFailed(format!("Failed to lock records: {:?}", err)));
        Box::pin(std::future::ready(result))
    }

    fn shutdown(&mut self) {
        self.reset();
    }
}
