//! # Agent
//!
//! The agent ties the pieces together: it owns the configuration, the id
//! generator, the sampler and the exporters, starts transactions, and hands
//! out [`Recorder`]s for instrumentation modules. Creating an agent has no
//! process-global effect; independent agents can coexist, which keeps tests
//! hermetic.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::error::{TraceError, TraceResult};
use crate::export::{SpanExporter, SpanRecord};
use crate::ids::IdGenerator;
use crate::record::Recorder;
use crate::sampler::Sampler;
use crate::transaction::{Transaction, TransactionInner, TransactionKind};
use crate::vine_debug;

#[derive(Debug)]
pub(crate) struct AgentInner {
    sampler: Sampler,
    ids: Arc<dyn IdGenerator>,
    max_segments: usize,
    capture_attributes: bool,
    exporters: Mutex<Vec<Box<dyn SpanExporter>>>,
    is_shutdown: AtomicBool,
}

impl AgentInner {
    pub(crate) fn max_segments(&self) -> usize {
        self.max_segments
    }

    pub(crate) fn capture_attributes(&self) -> bool {
        self.capture_attributes
    }

    pub(crate) fn id_generator(&self) -> Arc<dyn IdGenerator> {
        self.ids.clone()
    }

    /// Hands a finalized transaction's records to every exporter.
    pub(crate) fn export(&self, records: Vec<SpanRecord>) {
        if records.is_empty() || self.is_shutdown.load(Ordering::Relaxed) {
            return;
        }
        let result = self
            .exporters
            .lock()
            .map_err(|_| TraceError::Other("Agent exporter mutex poison".into()))
            .map(|mut exporters| {
                for exporter in exporters.iter_mut() {
                    if let Err(err) = futures_executor::block_on(exporter.export(records.clone()))
                    {
                        vine_debug!(
                            name: "Agent.Export.Error",
                            reason = format!("{:?}", err)
                        );
                    }
                }
            });
        if let Err(err) = result {
            vine_debug!(
                name: "Agent.Export.Error",
                reason = format!("{:?}", err)
            );
        }
    }

    fn shutdown(&self) -> TraceResult<()> {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return Err(TraceError::AlreadyShutdown);
        }
        if let Ok(mut exporters) = self.exporters.lock() {
            for exporter in exporters.iter_mut() {
                exporter.shutdown();
            }
            Ok(())
        } else {
            Err(TraceError::Other("Agent exporter mutex poison at shutdown".into()))
        }
    }
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        if !self.is_shutdown.load(Ordering::Relaxed) {
            if let Ok(mut exporters) = self.exporters.lock() {
                for exporter in exporters.iter_mut() {
                    exporter.shutdown();
                }
            }
        }
    }
}

/// The tracing agent.
///
/// Cheap to clone; all clones share the same configuration and exporters.
///
/// # Examples
///
/// ```
/// use tracevine::export::InMemorySpanExporter;
/// use tracevine::{Agent, TransactionKind};
///
/// let exporter = InMemorySpanExporter::default();
/// let agent = Agent::builder().with_exporter(exporter.clone()).build();
///
/// let txn = agent.start_transaction(TransactionKind::Background, "nightly-cleanup");
/// txn.finish();
///
/// assert_eq!(exporter.get_finished_records().unwrap().len(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Returns a builder for configuring an agent.
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    /// Returns a recorder backed by this agent.
    pub fn recorder(&self) -> Recorder {
        Recorder::new(self.clone())
    }

    /// Starts a transaction of the given kind.
    ///
    /// The name becomes the root segment's name; web transactions are
    /// typically renamed by the middleware path before they finish. The
    /// sampling decision is drawn here and never changes. After
    /// [`shutdown`], new transactions still run but are never sampled.
    ///
    /// [`shutdown`]: Agent::shutdown
    pub fn start_transaction(
        &self,
        kind: TransactionKind,
        name: impl Into<Cow<'static, str>>,
    ) -> Transaction {
        let trace_id = self.inner.ids.new_trace_id();
        let id = self.inner.ids.new_segment_id();
        let root_id = self.inner.ids.new_segment_id();
        let priority = crate::ids::random_priority();
        let sampled = !self.inner.is_shutdown.load(Ordering::Relaxed)
            && self.inner.sampler.should_sample(priority);
        let inner = TransactionInner::start(
            &self.inner,
            kind,
            name.into(),
            trace_id,
            id,
            root_id,
            sampled,
            priority,
        );
        Transaction::from_inner(inner)
    }

    /// Asks every exporter to flush anything it has buffered, returning one
    /// result per exporter.
    pub fn force_flush(&self) -> Vec<TraceResult<()>> {
        match self.inner.exporters.lock() {
            Ok(mut exporters) => exporters
                .iter_mut()
                .map(|exporter| futures_executor::block_on(exporter.force_flush()))
                .collect(),
            Err(_) => vec![Err(TraceError::Other("Agent exporter mutex poison".into()))],
        }
    }

    /// Shuts the agent down, shutting down every exporter.
    ///
    /// Only the first call succeeds; later calls return
    /// [`TraceError::AlreadyShutdown`].
    pub fn shutdown(&self) -> TraceResult<()> {
        self.inner.shutdown()
    }
}

/// Builder for [`Agent`].
#[derive(Debug, Default)]
pub struct AgentBuilder {
    config: Option<Config>,
    exporters: Vec<Box<dyn SpanExporter>>,
}

impl AgentBuilder {
    /// The agent configuration; defaults to [`Config::default`].
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Adds an exporter that receives every sampled transaction's records at
    /// finalize.
    pub fn with_exporter<E>(mut self, exporter: E) -> Self
    where
        E: SpanExporter + 'static,
    {
        self.exporters.push(Box::new(exporter));
        self
    }

    /// Builds the agent.
    pub fn build(self) -> Agent {
        let config = self.config.unwrap_or_default();
        Agent {
            inner: Arc::new(AgentInner {
                sampler: config.sampler,
                ids: Arc::from(config.id_generator),
                max_segments: config.max_segments_per_transaction,
                capture_attributes: config.capture_attributes,
                exporters: Mutex::new(self.exporters),
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }
}
