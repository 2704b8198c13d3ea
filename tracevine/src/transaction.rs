//! # Transaction
//!
//! A transaction is one logical request or job observed end to end. It owns
//! the segment tree rooted at its root segment, aggregates the naming
//! decisions made while the work runs, accumulates at most one noticed error,
//! and finalizes exactly once. Finalizing closes the root, computes the final
//! display name, maps the tree to wire records, and hands them to the agent's
//! exporters when the transaction was sampled.
//!
//! Segment handles hold only weak references back to their transaction, so a
//! stray handle kept by slow instrumentation can never keep a finished
//! transaction's tree alive.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::agent::AgentInner;
use crate::export::wire::{build_records, TransactionMeta};
use crate::ids::{IdGenerator, SegmentId, TraceId};
use crate::naming::NameState;
use crate::segment::{SegmentHandle, SegmentInner};
use crate::vine_warn;
use crate::KeyValue;

/// What flavor of work a transaction represents.
///
/// The distinction matters at finalize: web transactions are named by the
/// middleware path that produced the response, background transactions keep
/// their start name unless explicitly renamed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionKind {
    /// Request/response work named through the middleware path stack.
    Web,
    /// A job or task named up front.
    Background,
}

/// The single error a transaction noticed.
///
/// A transaction keeps at most one: the first error sticks, and later errors
/// are dropped unless the first was marked handled in the meantime (an
/// error-handling middleware dealt with it), in which case a new error may
/// take its place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoticedError {
    /// The error's display message.
    pub message: String,
    /// Whether error-handling middleware claimed this error.
    pub handled: bool,
}

#[derive(Debug)]
pub(crate) struct TransactionInner {
    id: SegmentId,
    trace_id: TraceId,
    kind: TransactionKind,
    sampled: bool,
    priority: f64,
    root: Arc<SegmentInner>,
    naming: Mutex<NameState>,
    error: Mutex<Option<NoticedError>>,
    finished: AtomicBool,
    segment_count: AtomicUsize,
    max_segments: usize,
    budget_warned: AtomicBool,
    capture_attributes: bool,
    ids: Arc<dyn IdGenerator>,
    agent: Weak<AgentInner>,
}

impl TransactionInner {
    pub(crate) fn start(
        agent: &Arc<AgentInner>,
        kind: TransactionKind,
        name: Cow<'static, str>,
        trace_id: TraceId,
        id: SegmentId,
        root_id: SegmentId,
        sampled: bool,
        priority: f64,
    ) -> Arc<TransactionInner> {
        let now = crate::time::now();
        Arc::new_cyclic(|weak: &Weak<TransactionInner>| {
            let root = SegmentInner::new(root_id, weak.clone(), Weak::new(), name, now);
            TransactionInner {
                id,
                trace_id,
                kind,
                sampled,
                priority,
                root,
                naming: Mutex::new(NameState::new()),
                error: Mutex::new(None),
                finished: AtomicBool::new(false),
                // the root occupies the first budget slot
                segment_count: AtomicUsize::new(1),
                max_segments: agent.max_segments(),
                budget_warned: AtomicBool::new(false),
                capture_attributes: agent.capture_attributes(),
                ids: agent.id_generator(),
                agent: Arc::downgrade(agent),
            }
        })
    }

    pub(crate) fn root_handle(&self) -> SegmentHandle {
        SegmentHandle::from_inner(self.root.clone())
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn capture_attributes(&self) -> bool {
        self.capture_attributes
    }

    /// Starts a child segment under `parent` if the transaction is still
    /// running and has budget for it.
    pub(crate) fn try_start_child(
        self: &Arc<Self>,
        parent: &SegmentHandle,
        name: Cow<'static, str>,
    ) -> Option<SegmentHandle> {
        if self.is_finished() {
            return None;
        }
        let seen = self.segment_count.fetch_add(1, Ordering::Relaxed);
        if seen >= self.max_segments {
            if !self.budget_warned.swap(true, Ordering::Relaxed) {
                vine_warn!(
                    name: "Transaction.SegmentBudgetExhausted",
                    max_segments = self.max_segments,
                    trace_id = self.trace_id.to_string()
                );
            }
            return None;
        }
        let id = self.ids.new_segment_id();
        Some(parent.spawn_child(id, Arc::downgrade(self), name, crate::time::now()))
    }

    fn noticed_error_snapshot(&self) -> Option<NoticedError> {
        self.error.lock().ok().and_then(|guard| guard.clone())
    }

    fn finish(self: &Arc<Self>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let finalize_time = crate::time::now();

        let (name_override, route_params) = match self.naming.lock() {
            Ok(mut naming) => {
                naming.freeze();
                let name = match self.kind {
                    TransactionKind::Web if naming.has_name() => Some(naming.display_name()),
                    TransactionKind::Web => None,
                    TransactionKind::Background => naming.explicit_name().map(str::to_owned),
                };
                (name, naming.route_params())
            }
            Err(_) => (None, Vec::new()),
        };

        let root = self.root_handle();
        root.end_with_timestamp(finalize_time);

        if !self.sampled {
            return;
        }
        let Some(agent) = self.agent.upgrade() else {
            return;
        };

        let meta = TransactionMeta {
            trace_id: self.trace_id,
            guid: self.id,
            sampled: self.sampled,
            priority: self.priority,
            noticed_error: self.noticed_error_snapshot(),
            route_params: if self.capture_attributes {
                route_params
            } else {
                Vec::new()
            },
        };
        let records = build_records(&root, &meta, finalize_time, name_override);
        agent.export(records);
    }
}

/// One logical request or job observed end to end.
///
/// Cheap to clone; all clones refer to the same transaction.
#[derive(Clone, Debug)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    pub(crate) fn from_inner(inner: Arc<TransactionInner>) -> Self {
        Transaction { inner }
    }

    /// Returns the transaction that owns the currently active segment, if
    /// any.
    pub fn active() -> Option<Transaction> {
        crate::Context::active_segment().and_then(|segment| segment.transaction())
    }

    /// The transaction's root segment.
    pub fn root(&self) -> SegmentHandle {
        self.inner.root_handle()
    }

    /// The trace this transaction belongs to.
    pub fn trace_id(&self) -> TraceId {
        self.inner.trace_id
    }

    /// The transaction's own id, distinct from its root segment's id.
    pub fn id(&self) -> SegmentId {
        self.inner.id
    }

    /// What flavor of work this transaction represents.
    pub fn kind(&self) -> TransactionKind {
        self.inner.kind
    }

    /// Whether this transaction's records will be exported at finalize.
    pub fn is_sampled(&self) -> bool {
        self.inner.sampled
    }

    /// The sampling priority drawn at start, in `[0, 1)`.
    pub fn priority(&self) -> f64 {
        self.inner.priority
    }

    /// Whether [`finish`] has run.
    ///
    /// [`finish`]: Transaction::finish
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Records an error against this transaction.
    ///
    /// The first noticed error sticks; later calls are dropped unless the
    /// held error was marked handled, in which case the new error replaces
    /// it.
    pub fn notice_error(&self, message: impl Into<String>) {
        if let Ok(mut guard) = self.inner.error.lock() {
            match &*guard {
                Some(err) if !err.handled => {}
                _ => {
                    *guard = Some(NoticedError {
                        message: message.into(),
                        handled: false,
                    });
                }
            }
        }
    }

    /// Marks the currently noticed error as handled.
    pub fn mark_error_handled(&self) {
        if let Ok(mut guard) = self.inner.error.lock() {
            if let Some(err) = guard.as_mut() {
                err.handled = true;
            }
        }
    }

    /// The error this transaction noticed, if any.
    pub fn noticed_error(&self) -> Option<NoticedError> {
        self.inner.noticed_error_snapshot()
    }

    pub(crate) fn capture_attributes(&self) -> bool {
        self.inner.capture_attributes()
    }

    /// Pushes a middleware mount path onto the naming stack.
    pub fn append_path(&self, path: impl Into<String>, params: Vec<KeyValue>) {
        if let Ok(mut naming) = self.inner.naming.lock() {
            naming.append_path(path, params);
        }
    }

    /// Pops a middleware mount path off the naming stack.
    pub fn pop_path(&self, expected: &str) {
        if let Ok(mut naming) = self.inner.naming.lock() {
            naming.pop_path(expected);
        }
    }

    /// Marks the current naming stack as the path that produced the
    /// response.
    pub fn mark_path(&self) {
        if let Ok(mut naming) = self.inner.naming.lock() {
            naming.mark_path();
        }
    }

    /// Freezes the transaction name against further changes.
    ///
    /// Call when the response starts, so asynchronous stragglers cannot
    /// rename a transaction the user already saw.
    pub fn freeze_name(&self) {
        if let Ok(mut naming) = self.inner.naming.lock() {
            naming.freeze();
        }
    }

    /// Overrides the transaction's display name. No-op once the name is
    /// frozen.
    pub fn set_name(&self, name: impl Into<Cow<'static, str>>) {
        if let Ok(mut naming) = self.inner.naming.lock() {
            naming.set_name(name);
        }
    }

    /// Sets the display-name prefix, e.g. the framework name. No-op once the
    /// name is frozen.
    pub fn set_name_prefix(&self, prefix: impl Into<Cow<'static, str>>) {
        if let Ok(mut naming) = self.inner.naming.lock() {
            naming.set_prefix(prefix);
        }
    }

    /// The display name as it would be computed right now.
    pub fn display_name(&self) -> String {
        self.inner
            .naming
            .lock()
            .map(|naming| {
                if naming.has_name() {
                    naming.display_name()
                } else {
                    self.root().name().into_owned()
                }
            })
            .unwrap_or_default()
    }

    /// Finalizes the transaction: freezes the name, closes the root segment,
    /// and exports the tree if the transaction was sampled.
    ///
    /// Only the first call has any effect. Segments still open at this point
    /// are exported as truncated; segments started afterwards are not
    /// created at all.
    pub fn finish(&self) {
        self.inner.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::InMemorySpanExporter;
    use crate::{Agent, Config};

    fn test_agent() -> (Agent, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let agent = Agent::builder().with_exporter(exporter.clone()).build();
        (agent, exporter)
    }

    #[test]
    fn first_noticed_error_sticks() {
        let (agent, _) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Web, "request");

        txn.notice_error("boom");
        txn.notice_error("later");

        assert_eq!(
            txn.noticed_error(),
            Some(NoticedError {
                message: "boom".to_owned(),
                handled: false,
            })
        );
    }

    #[test]
    fn handled_error_can_be_replaced() {
        let (agent, _) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Web, "request");

        txn.notice_error("boom");
        txn.mark_error_handled();
        txn.notice_error("second");

        assert_eq!(
            txn.noticed_error(),
            Some(NoticedError {
                message: "second".to_owned(),
                handled: false,
            })
        );
    }

    #[test]
    fn finish_exports_exactly_once() {
        let (agent, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");

        txn.finish();
        txn.finish();

        assert!(txn.is_finished());
        assert_eq!(exporter.get_finished_records().unwrap().len(), 1);
    }

    #[test]
    fn no_segments_after_finish() {
        let (agent, _) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let root = txn.root();
        txn.finish();

        assert!(root.start_child("late").is_none());
    }

    #[test]
    fn segment_budget_is_enforced_and_warned_once() {
        let exporter = InMemorySpanExporter::default();
        let mut config = Config::default();
        config.max_segments_per_transaction = 3;
        let agent = Agent::builder()
            .with_config(config)
            .with_exporter(exporter.clone())
            .build();

        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let root = txn.root();

        // root takes one slot, so two children fit
        assert!(root.start_child("a").is_some());
        assert!(root.start_child("b").is_some());
        assert!(root.start_child("c").is_none());
        assert!(root.start_child("d").is_none());

        txn.finish();
        assert_eq!(exporter.get_finished_records().unwrap().len(), 3);
    }

    #[test]
    fn unsampled_transactions_build_trees_but_do_not_export() {
        let exporter = InMemorySpanExporter::default();
        let mut config = Config::default();
        config.sampler = crate::Sampler::AlwaysOff;
        let agent = Agent::builder()
            .with_config(config)
            .with_exporter(exporter.clone())
            .build();

        let txn = agent.start_transaction(TransactionKind::Background, "job");
        assert!(!txn.is_sampled());

        let child = txn.root().start_child("work").unwrap();
        child.end();
        txn.finish();

        assert!(exporter.get_finished_records().unwrap().is_empty());
    }

    #[test]
    fn web_transactions_take_the_marked_path_name() {
        let (agent, _) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Web, "request");
        txn.set_name_prefix("WebTransaction/Handler");

        txn.append_path("/", Vec::new());
        txn.append_path("/users/:id", Vec::new());
        txn.mark_path();
        txn.pop_path("/users/:id");
        txn.pop_path("/");

        assert_eq!(txn.display_name(), "WebTransaction/Handler/users/:id");
    }

    #[test]
    fn background_transactions_keep_their_start_name() {
        let (agent, _) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "index-rebuild");
        assert_eq!(txn.display_name(), "index-rebuild");
    }
}
