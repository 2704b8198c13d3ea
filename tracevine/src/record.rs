//! # Recorder
//!
//! The recorder is the single entry point instrumentation modules call at an
//! interception point. Given an [`OperationSpec`] and the captured [`Call`],
//! it decides whether the call is traced at all, creates the segment, runs
//! the underlying operation with that segment active, and arranges for the
//! segment to close when the operation completes. One method exists per
//! completion shape: synchronous, fallible, continuation, collapsed rows,
//! future and stream.
//!
//! The recorder must never change what the instrumented call does. Every
//! internal failure, a naming closure that panics, a missing argument, an
//! exhausted segment budget, degrades to running the operation untraced.
//! Errors and panics raised by the operation itself pass through unchanged;
//! the recorder's only side effect on that path is closing the segment it
//! opened.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::Context as TaskContext;
use std::task::Poll;

use futures_core::Stream;
use pin_project_lite::pin_project;

use crate::agent::Agent;
use crate::context::Context;
use crate::operation::{
    AfterCall, AfterHook, Call, Category, MiddlewareKind, MiddlewareSpec, OperationSpec,
};
use crate::segment::SegmentHandle;
use crate::transaction::Transaction;
use crate::{vine_debug, vine_warn};

/// Records intercepted operations against the active transaction.
///
/// Cheap to clone; obtained from [`Agent::recorder`].
///
/// [`Agent::recorder`]: crate::Agent::recorder
#[derive(Clone, Debug)]
pub struct Recorder {
    agent: Agent,
}

/// What the gate decided for one interception.
enum Resolution {
    /// Run the operation untraced.
    PassThrough,
    /// Trace the operation under `segment`; when `entry` is set, the
    /// recorder started that transaction and finishes it on completion.
    Record {
        segment: SegmentHandle,
        entry: Option<Transaction>,
    },
}

impl Recorder {
    pub(crate) fn new(agent: Agent) -> Self {
        Recorder { agent }
    }

    /// Records a synchronous operation.
    ///
    /// The closure runs with the new segment active; the segment closes when
    /// the closure returns, or unwinds.
    ///
    /// # Examples
    ///
    /// ```
    /// use tracevine::{Agent, Call, OperationSpec, TransactionKind};
    ///
    /// let agent = Agent::builder().build();
    /// let recorder = agent.recorder();
    /// let spec = OperationSpec::new("cache.get");
    ///
    /// let txn = agent.start_transaction(TransactionKind::Background, "warmup");
    /// let hit = txn.root().in_scope(|| {
    ///     recorder.record(&spec, &Call::new(), || true)
    /// });
    /// assert!(hit);
    /// txn.finish();
    /// ```
    pub fn record<T>(&self, spec: &OperationSpec, call: &Call, f: impl FnOnce() -> T) -> T {
        match self.resolve(spec, call) {
            Resolution::PassThrough => f(),
            Resolution::Record { segment, entry } => {
                let mut guard = CompletionGuard::new(Completion::new(&segment, spec, entry));
                let result = segment.in_scope(f);
                guard.complete();
                result
            }
        }
    }

    /// Records a fallible synchronous operation.
    ///
    /// Like [`record`], but an `Err` outcome is reported to the spec's
    /// post-completion hook. The result itself is returned unchanged.
    ///
    /// [`record`]: Recorder::record
    pub fn record_result<T, E>(
        &self,
        spec: &OperationSpec,
        call: &Call,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: fmt::Display,
    {
        match self.resolve(spec, call) {
            Resolution::PassThrough => f(),
            Resolution::Record { segment, entry } => {
                let mut guard = CompletionGuard::new(Completion::new(&segment, spec, entry));
                let result = segment.in_scope(f);
                if let Err(error) = &result {
                    guard.observe_error(error.to_string());
                }
                guard.complete();
                result
            }
        }
    }

    /// Records a continuation-style operation.
    ///
    /// The closure receives a [`BoundCallback`] and is expected to hand it to
    /// whatever will eventually invoke the operation's continuation. The
    /// segment stays open until the bound callback is invoked; a callback
    /// that never fires leaves the segment open, and the transaction exports
    /// it as truncated.
    ///
    /// With no active transaction the bound callback is a plain passthrough
    /// and invoking it simply runs the continuation.
    pub fn record_callback<T, F>(&self, spec: &OperationSpec, call: &Call, f: F) -> T
    where
        F: FnOnce(BoundCallback) -> T,
    {
        match self.resolve(spec, call) {
            Resolution::PassThrough => f(BoundCallback { recording: None }),
            Resolution::Record { segment, entry } => {
                let bound = BoundCallback {
                    recording: Some(CallbackRecording {
                        cx: Context::current_with_segment(segment.clone()),
                        completion: Completion::new(&segment, spec, entry),
                    }),
                };
                segment.in_scope(|| f(bound))
            }
        }
    }

    /// Records a high-frequency repeated continuation as one segment.
    ///
    /// Where [`record_callback`] gives every interception its own segment,
    /// the [`RowCallback`] handed to the closure spans all of its
    /// invocations: each [`row`] re-establishes context and extends the
    /// segment, and [`end`] closes it at the time of the last row. Use this
    /// for per-row result callbacks, where a segment per invocation would
    /// explode the tree.
    ///
    /// [`record_callback`]: Recorder::record_callback
    /// [`row`]: RowCallback::row
    /// [`end`]: RowCallback::end
    pub fn record_rows<T, F>(&self, spec: &OperationSpec, call: &Call, f: F) -> T
    where
        F: FnOnce(RowCallback) -> T,
    {
        match self.resolve(spec, call) {
            Resolution::PassThrough => f(RowCallback { recording: None }),
            Resolution::Record { segment, entry } => {
                let rows = RowCallback {
                    recording: Some(Arc::new(RowRecording {
                        cx: Context::current_with_segment(segment.clone()),
                        segment: segment.clone(),
                        completion: Mutex::new(Some(Completion::new(&segment, spec, entry))),
                    })),
                };
                segment.in_scope(|| f(rows))
            }
        }
    }

    /// Records a future-shaped operation.
    ///
    /// The closure constructs the future with the new segment active; the
    /// returned wrapper re-establishes that segment around every poll and
    /// closes it when the future resolves, however long that takes and on
    /// whichever task the final poll runs.
    pub fn record_future<F>(
        &self,
        spec: &OperationSpec,
        call: &Call,
        f: impl FnOnce() -> F,
    ) -> Recorded<F>
    where
        F: Future,
    {
        self.record_wrapped(spec, call, f)
    }

    /// Records a stream-shaped operation.
    ///
    /// The segment stays open while items flow and closes when the stream
    /// reports its end. A stream dropped before its end leaves the segment
    /// open, to be exported as truncated.
    pub fn record_stream<S>(
        &self,
        spec: &OperationSpec,
        call: &Call,
        f: impl FnOnce() -> S,
    ) -> Recorded<S>
    where
        S: Stream,
    {
        self.record_wrapped(spec, call, f)
    }

    fn record_wrapped<T>(
        &self,
        spec: &OperationSpec,
        call: &Call,
        f: impl FnOnce() -> T,
    ) -> Recorded<T> {
        match self.resolve(spec, call) {
            Resolution::PassThrough => Recorded {
                inner: f(),
                recording: None,
            },
            Resolution::Record { segment, entry } => Recorded {
                inner: segment.in_scope(f),
                recording: Some(CallbackRecording {
                    cx: Context::current_with_segment(segment.clone()),
                    completion: Completion::new(&segment, spec, entry),
                }),
            },
        }
    }

    /// Records one middleware invocation in a request/response chain.
    ///
    /// A [`handler`] middleware pushes its mount path onto the transaction's
    /// naming stack before the closure runs. Passing control on via
    /// [`Next::proceed`] pops the path again, because a middleware that
    /// continued the chain did not produce the response. Returning `Err`
    /// leaves the path in place and records the error on the transaction, so
    /// a failed request is named after the middleware that failed, not
    /// whichever ran last.
    ///
    /// An [`errorware`] middleware never touches the naming stack; a
    /// successful run marks the transaction's noticed error as handled.
    ///
    /// [`handler`]: MiddlewareSpec::handler
    /// [`errorware`]: MiddlewareSpec::errorware
    pub fn record_middleware<T, E>(
        &self,
        spec: &MiddlewareSpec,
        call: &Call,
        f: impl FnOnce(Next) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: fmt::Display,
    {
        let active = Context::active_segment();
        let txn = active
            .as_ref()
            .and_then(|segment| segment.transaction())
            .filter(|txn| !txn.is_finished());
        let (Some(active), Some(txn)) = (active, txn) else {
            return f(Next { inner: None });
        };

        let name = match spec.kind() {
            MiddlewareKind::Handler => format!("Middleware/{}", spec.name()),
            MiddlewareKind::Errorware => format!("Errorware/{}", spec.name()),
        };
        let Some(segment) = active.start_child(name) else {
            return f(Next { inner: None });
        };

        let pops = match (spec.kind(), spec.mount_path()) {
            (MiddlewareKind::Handler, Some(path)) => {
                txn.append_path(path.to_owned(), call.attributes().to_vec());
                Some(path.to_owned())
            }
            _ => None,
        };
        let next = Next {
            inner: Some(NextInner {
                txn: txn.clone(),
                path: pops,
            }),
        };

        let mut guard = CompletionGuard::new(Completion {
            segment: segment.clone(),
            after: None,
            entry: None,
        });
        let result = segment.in_scope(|| f(next));
        match &result {
            Ok(_) => {
                if spec.kind() == MiddlewareKind::Errorware {
                    txn.mark_error_handled();
                }
            }
            Err(error) => {
                // The unpopped path names the transaction after this
                // middleware; the error lands in the noticed-error slot.
                txn.notice_error(error.to_string());
                guard.observe_error(error.to_string());
            }
        }
        guard.complete();
        result
    }

    /// The gate every recording passes through. Any outcome other than a
    /// live transaction, a resolved name and an in-budget segment degrades
    /// to pass-through.
    fn resolve(&self, spec: &OperationSpec, call: &Call) -> Resolution {
        let active = Context::active_segment();
        let txn = active
            .as_ref()
            .and_then(|segment| segment.transaction())
            .filter(|txn| !txn.is_finished());

        match (active, txn) {
            (Some(active), Some(txn)) => {
                if spec.internal() && active.is_internal() {
                    return Resolution::PassThrough;
                }
                let Some(name) = derive_name(spec, call) else {
                    return Resolution::PassThrough;
                };
                let Some(segment) = active.start_child(name) else {
                    return Resolution::PassThrough;
                };
                apply_spec(&segment, spec, call, &txn);
                Resolution::Record {
                    segment,
                    entry: None,
                }
            }
            _ => {
                let Some(kind) = spec.entry_point() else {
                    return Resolution::PassThrough;
                };
                let Some(name) = derive_name(spec, call) else {
                    return Resolution::PassThrough;
                };
                let txn = self.agent.start_transaction(kind, name);
                let segment = txn.root();
                apply_spec(&segment, spec, call, &txn);
                Resolution::Record {
                    segment,
                    entry: Some(txn),
                }
            }
        }
    }
}

/// Resolves the segment name, treating a panicking naming closure as an
/// unresolved name.
fn derive_name(spec: &OperationSpec, call: &Call) -> Option<Cow<'static, str>> {
    if !spec.is_derived_name() {
        return spec.resolve_name(call);
    }
    match catch_unwind(AssertUnwindSafe(|| spec.resolve_name(call))) {
        Ok(Some(name)) => Some(name),
        Ok(None) => {
            vine_debug!(name: "Recorder.NameUnresolved");
            None
        }
        Err(_) => {
            vine_warn!(name: "Recorder.NamingPanicked");
            None
        }
    }
}

fn apply_spec(segment: &SegmentHandle, spec: &OperationSpec, call: &Call, txn: &Transaction) {
    match spec.category() {
        Category::Generic => {}
        category => segment.set_category(category.clone()),
    }
    if spec.internal() {
        segment.set_internal(true);
    }
    if spec.opaque() {
        segment.set_opaque(true);
    }
    if txn.capture_attributes() {
        for attribute in call.attributes() {
            segment.add_attribute(attribute.clone());
        }
    }
}

/// Everything that has to happen when a recorded operation completes: run
/// the post-completion hook, close the segment, and finish the transaction
/// if this recording started one.
struct Completion {
    segment: SegmentHandle,
    after: Option<AfterHook>,
    entry: Option<Transaction>,
}

impl Completion {
    fn new(segment: &SegmentHandle, spec: &OperationSpec, entry: Option<Transaction>) -> Self {
        Completion {
            segment: segment.clone(),
            after: spec.after().cloned(),
            entry,
        }
    }

    fn finish(self, error: Option<&str>) {
        self.close(error, false);
    }

    fn finish_at_last_touch(self) {
        self.close(None, true);
    }

    fn close(self, error: Option<&str>, at_last_touch: bool) {
        if let Some(after) = &self.after {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                after(AfterCall {
                    segment: &self.segment,
                    error,
                });
            }));
            if outcome.is_err() {
                vine_warn!(
                    name: "Recorder.AfterHookPanicked",
                    segment_id = self.segment.id().to_string()
                );
            }
        }
        if at_last_touch {
            self.segment.end_at_last_touch();
        } else {
            self.segment.end();
        }
        if let Some(txn) = self.entry {
            txn.finish();
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("segment", &self.segment.id())
            .field("after", &self.after.as_ref().map(|_| "<fn>"))
            .field("entry", &self.entry.as_ref().map(|txn| txn.id()))
            .finish()
    }
}

/// Closes the segment even when the recorded closure unwinds; the panic
/// itself continues to propagate unchanged.
struct CompletionGuard {
    completion: Option<Completion>,
    error: Option<String>,
}

impl CompletionGuard {
    fn new(completion: Completion) -> Self {
        CompletionGuard {
            completion: Some(completion),
            error: None,
        }
    }

    fn observe_error(&mut self, message: String) {
        self.error = Some(message);
    }

    fn complete(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.finish(self.error.as_deref());
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            let message = self
                .error
                .take()
                .unwrap_or_else(|| "unhandled panic".to_owned());
            completion.finish(Some(&message));
        }
    }
}

#[derive(Debug)]
struct CallbackRecording {
    cx: Context,
    completion: Completion,
}

/// A continuation bound to the segment that was active when it was created.
///
/// Invoking it re-establishes that segment for the duration of the
/// continuation, restores the caller's context afterwards even if the
/// continuation leaks a nested scope, and closes the segment. Dropping it
/// without invoking leaves the segment open on purpose: a continuation that
/// never fired is not an error, and the transaction exports the segment as
/// truncated.
#[derive(Debug)]
pub struct BoundCallback {
    recording: Option<CallbackRecording>,
}

impl BoundCallback {
    /// The segment this callback will close, when there is one.
    ///
    /// Instrumentation uses this to act on the segment out of band, for
    /// example ignoring it when a timer is cancelled before it fires.
    pub fn segment(&self) -> Option<&SegmentHandle> {
        self.recording
            .as_ref()
            .map(|recording| &recording.completion.segment)
    }

    /// Invokes the continuation with its segment re-established, then closes
    /// the segment.
    pub fn invoke<R>(self, f: impl FnOnce() -> R) -> R {
        self.invoke_with_error(None, f)
    }

    /// Like [`invoke`], but reports the operation's error outcome to the
    /// post-completion hook. The segment closes either way, and a panicking
    /// continuation still propagates after the close.
    ///
    /// [`invoke`]: BoundCallback::invoke
    pub fn invoke_with_error<R>(self, error: Option<&str>, f: impl FnOnce() -> R) -> R {
        match self.recording {
            None => f(),
            Some(CallbackRecording { cx, completion }) => {
                let mut guard = CompletionGuard::new(completion);
                if let Some(message) = error {
                    guard.observe_error(message.to_owned());
                }
                let result = cx.in_scope(f);
                guard.complete();
                result
            }
        }
    }
}

struct RowRecording {
    cx: Context,
    segment: SegmentHandle,
    completion: Mutex<Option<Completion>>,
}

/// The single segment shared by all invocations of a repeated continuation.
///
/// Cheap to clone; all clones extend the same segment.
#[derive(Clone)]
pub struct RowCallback {
    recording: Option<Arc<RowRecording>>,
}

impl RowCallback {
    /// Runs one continuation invocation with the shared segment active and
    /// records the activity against it.
    pub fn row<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.recording {
            None => f(),
            Some(recording) => {
                let result = recording.cx.in_scope(f);
                recording.segment.touch();
                result
            }
        }
    }

    /// Closes the shared segment at the time of the most recent row.
    ///
    /// Only the first call has any effect.
    pub fn end(&self) {
        if let Some(recording) = &self.recording {
            let completion = recording.completion.lock().ok().and_then(|mut slot| slot.take());
            if let Some(completion) = completion {
                completion.finish_at_last_touch();
            }
        }
    }
}

impl fmt::Debug for RowCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowCallback")
            .field(
                "segment",
                &self.recording.as_ref().map(|recording| recording.segment.id()),
            )
            .finish()
    }
}

pin_project! {
    /// A future or stream recorded as one segment.
    ///
    /// Every poll runs with the recording's segment active. A future closes
    /// the segment when it resolves; a stream records activity per item and
    /// closes at the terminal event, timed at the last item.
    #[derive(Debug)]
    pub struct Recorded<T> {
        #[pin]
        inner: T,
        recording: Option<CallbackRecording>,
    }
}

impl<T: Future> Future for Recorded<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let poll = match this.recording.as_ref() {
            Some(recording) => {
                let _guard = recording.cx.clone().attach();
                this.inner.poll(task_cx)
            }
            None => this.inner.poll(task_cx),
        };
        if poll.is_ready() {
            if let Some(recording) = this.recording.take() {
                recording.completion.finish(None);
            }
        }
        poll
    }
}

impl<T: Stream> Stream for Recorded<T> {
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let poll = match this.recording.as_ref() {
            Some(recording) => {
                let _guard = recording.cx.clone().attach();
                this.inner.poll_next(task_cx)
            }
            None => this.inner.poll_next(task_cx),
        };
        match &poll {
            Poll::Ready(Some(_)) => {
                if let Some(recording) = this.recording.as_ref() {
                    recording.completion.segment.touch();
                }
            }
            Poll::Ready(None) => {
                if let Some(recording) = this.recording.take() {
                    recording.completion.finish_at_last_touch();
                }
            }
            Poll::Pending => {}
        }
        poll
    }
}

/// Continues a middleware chain, recording that this middleware passed
/// control on instead of responding.
#[derive(Debug)]
pub struct Next {
    inner: Option<NextInner>,
}

#[derive(Debug)]
struct NextInner {
    txn: Transaction,
    path: Option<String>,
}

impl Next {
    /// Pops this middleware's mount path off the naming stack, then runs the
    /// rest of the chain.
    pub fn proceed<R>(self, f: impl FnOnce() -> R) -> R {
        if let Some(inner) = self.inner {
            if let Some(path) = &inner.path {
                inner.txn.pop_path(path);
            }
        }
        f()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::export::{InMemorySpanExporter, SpanRecord, WireValue};
    use crate::transaction::TransactionKind;
    use crate::{Agent, KeyValue};

    fn test_agent() -> (Agent, Recorder, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let agent = Agent::builder().with_exporter(exporter.clone()).build();
        let recorder = agent.recorder();
        (agent, recorder, exporter)
    }

    fn span_names(records: &[SpanRecord]) -> Vec<String> {
        records
            .iter()
            .filter_map(|record| match record.intrinsics.get("name") {
                Some(WireValue::String(name)) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    fn duration_of(records: &[SpanRecord], name: &str) -> f64 {
        let record = records
            .iter()
            .find(|record| {
                record.intrinsics.get("name") == Some(&WireValue::String(name.to_owned()))
            })
            .unwrap_or_else(|| panic!("no span named {name:?}"));
        match record.intrinsics.get("duration") {
            Some(WireValue::Double(duration)) => *duration,
            other => panic!("unexpected duration {other:?}"),
        }
    }

    #[test]
    fn record_without_transaction_is_pass_through() {
        let (_agent, recorder, exporter) = test_agent();
        let spec = OperationSpec::new("db.query");

        assert_eq!(recorder.record(&spec, &Call::new(), || 42), 42);
        let result: Result<(), String> =
            recorder.record_result(&spec, &Call::new(), || Err("boom".to_owned()));
        assert_eq!(result, Err("boom".to_owned()));
        let via_callback = recorder.record_callback(&spec, &Call::new(), |bound| {
            assert!(bound.segment().is_none());
            bound.invoke(|| "ran")
        });
        assert_eq!(via_callback, "ran");

        assert!(Context::active_segment().is_none());
        assert!(exporter.get_finished_records().unwrap().is_empty());
    }

    #[test]
    fn record_creates_a_child_under_the_active_segment() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("db.query");

        let value = txn.root().in_scope(|| {
            let value = recorder.record(&spec, &Call::new(), || {
                assert_eq!(
                    Context::active_segment().map(|s| s.name().into_owned()),
                    Some("db.query".to_owned())
                );
                7
            });
            // the recorder restored this scope's own segment
            assert_eq!(
                Context::active_segment().map(|s| s.id()),
                Some(txn.root().id())
            );
            value
        });
        assert_eq!(value, 7);
        txn.finish();

        let records = exporter.get_finished_records().unwrap();
        assert_eq!(span_names(&records), vec!["job", "db.query"]);
    }

    #[test]
    fn unresolved_derived_name_skips_tracing() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::derived(|call| {
            call.arg("table")
                .map(|table| format!("db.{}.select", table.as_str()).into())
        });

        let ran = txn
            .root()
            .in_scope(|| recorder.record(&spec, &Call::new(), || true));
        assert!(ran);
        txn.finish();

        assert_eq!(
            span_names(&exporter.get_finished_records().unwrap()),
            vec!["job"]
        );
    }

    #[test]
    fn panicking_naming_closure_degrades_to_pass_through() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::derived(|_| panic!("bad naming"));

        let value = txn
            .root()
            .in_scope(|| recorder.record(&spec, &Call::new(), || 13));
        assert_eq!(value, 13);
        txn.finish();

        assert_eq!(
            span_names(&exporter.get_finished_records().unwrap()),
            vec!["job"]
        );
    }

    #[test]
    fn panicking_operation_closes_its_segment_and_propagates() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("db.query");

        let unwound = catch_unwind(AssertUnwindSafe(|| {
            txn.root().in_scope(|| {
                recorder.record(&spec, &Call::new(), || panic!("op failed"));
            })
        }));
        assert!(unwound.is_err());
        assert!(Context::active_segment().is_none());
        txn.finish();

        let records = exporter.get_finished_records().unwrap();
        // closed by the guard, so not exported as truncated
        assert_eq!(span_names(&records), vec!["job", "db.query"]);
    }

    #[test]
    fn callback_segment_closes_when_the_continuation_fires() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("db.query");

        let bound = txn
            .root()
            .in_scope(|| recorder.record_callback(&spec, &Call::new(), |bound| bound));
        std::thread::sleep(Duration::from_millis(5));

        let mut continuation_ran = false;
        bound.invoke(|| {
            assert_eq!(
                Context::active_segment().map(|s| s.name().into_owned()),
                Some("db.query".to_owned())
            );
            continuation_ran = true;
        });
        assert!(continuation_ran);
        assert!(Context::active_segment().is_none());
        txn.finish();

        let records = exporter.get_finished_records().unwrap();
        assert_eq!(span_names(&records), vec!["job", "db.query"]);
        assert!(duration_of(&records, "db.query") >= 0.005);
    }

    #[test]
    fn invoked_callback_restores_context_even_when_the_continuation_leaks() {
        let (agent, recorder, _exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("db.query");
        let root = txn.root();

        let bound = root.in_scope(|| recorder.record_callback(&spec, &Call::new(), |bound| bound));

        root.in_scope(|| {
            bound.invoke(|| {
                // a continuation that enters a nested scope and forgets it
                let stray = root.start_child("stray").map(|stray| {
                    std::mem::forget(Context::current_with_segment(stray.clone()).attach());
                    stray
                });
                assert_eq!(
                    Context::active_segment().map(|s| s.id()),
                    stray.map(|s| s.id())
                );
            });
            assert_eq!(Context::active_segment().map(|s| s.id()), Some(root.id()));
        });
        assert!(Context::active_segment().is_none());
        txn.finish();
    }

    #[test]
    fn after_hook_sees_the_error_outcome() {
        let (agent, recorder, _exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let spec = OperationSpec::new("db.query").with_after(move |after| {
            let error = after.error.map(str::to_owned);
            if let Ok(mut seen) = sink.lock() {
                seen.push((error, after.segment.name().into_owned()));
            }
        });

        let result: Result<(), String> = txn.root().in_scope(|| {
            recorder.record_result(&spec, &Call::new(), || Err("timeout".to_owned()))
        });
        assert_eq!(result, Err("timeout".to_owned()));
        txn.finish();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[(Some("timeout".to_owned()), "db.query".to_owned())]
        );
    }

    #[test]
    fn after_hook_panic_is_swallowed() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("db.query").with_after(|_| panic!("bad hook"));

        let value = txn
            .root()
            .in_scope(|| recorder.record(&spec, &Call::new(), || 3));
        assert_eq!(value, 3);
        txn.finish();

        assert_eq!(
            span_names(&exporter.get_finished_records().unwrap()),
            vec!["job", "db.query"]
        );
    }

    #[test]
    fn a_thousand_rows_collapse_into_one_segment() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("db.rows");
        let rows_seen = AtomicUsize::new(0);

        txn.root().in_scope(|| {
            recorder.record_rows(&spec, &Call::new(), |rows| {
                for _ in 0..1000 {
                    rows.row(|| {
                        rows_seen.fetch_add(1, Ordering::Relaxed);
                    });
                }
                rows.end();
            })
        });
        assert_eq!(rows_seen.load(Ordering::Relaxed), 1000);
        txn.finish();

        let records = exporter.get_finished_records().unwrap();
        assert_eq!(span_names(&records), vec!["job", "db.rows"]);
    }

    #[test]
    fn row_callback_end_is_idempotent() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("db.rows");

        txn.root().in_scope(|| {
            recorder.record_rows(&spec, &Call::new(), |rows| {
                rows.row(|| ());
                rows.end();
                rows.end();
            })
        });
        txn.finish();

        assert_eq!(
            span_names(&exporter.get_finished_records().unwrap()),
            vec!["job", "db.rows"]
        );
    }

    #[tokio::test]
    async fn future_segment_spans_a_delayed_resolution() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("external.fetch");

        let fut = txn.root().in_scope(|| {
            recorder.record_future(&spec, &Call::new(), || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                7
            })
        });
        assert_eq!(fut.await, 7);
        txn.finish();

        let records = exporter.get_finished_records().unwrap();
        assert_eq!(span_names(&records), vec!["job", "external.fetch"]);
        assert!(duration_of(&records, "external.fetch") >= 0.010);
    }

    #[tokio::test]
    async fn future_polls_run_with_the_segment_active() {
        let (agent, recorder, _exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("external.fetch");

        let fut = txn.root().in_scope(|| {
            recorder.record_future(&spec, &Call::new(), || async {
                Context::active_segment().map(|s| s.name().into_owned())
            })
        });
        assert_eq!(fut.await.as_deref(), Some("external.fetch"));
        txn.finish();
    }

    #[test]
    fn stream_segment_closes_at_the_terminal_event() {
        use futures_util::StreamExt;

        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("db.cursor");

        // yields its items back to back, then stalls before reporting
        // exhaustion, like a cursor waiting on an empty final fetch
        let mut remaining = vec![3, 2, 1];
        let stream = txn.root().in_scope(|| {
            recorder.record_stream(&spec, &Call::new(), move || {
                futures_util::stream::poll_fn(move |_| match remaining.pop() {
                    Some(item) => Poll::Ready(Some(item)),
                    None => {
                        std::thread::sleep(Duration::from_millis(100));
                        Poll::Ready(None)
                    }
                })
            })
        });
        let items = futures_executor::block_on(stream.collect::<Vec<_>>());
        assert_eq!(items, vec![1, 2, 3]);
        txn.finish();

        let records = exporter.get_finished_records().unwrap();
        assert_eq!(span_names(&records), vec!["job", "db.cursor"]);
        // timed at the last item, not at the exhaustion poll
        assert!(duration_of(&records, "db.cursor") < 0.050);
    }

    #[test]
    fn entry_point_spec_starts_and_finishes_a_transaction() {
        let (_agent, recorder, exporter) = test_agent();
        let spec = OperationSpec::new("consume-message")
            .with_entry_point(TransactionKind::Background);
        let inner = OperationSpec::new("db.insert");

        assert!(Context::active_segment().is_none());
        recorder.record(&spec, &Call::new(), || {
            recorder.record(&inner, &Call::new(), || ());
        });

        let records = exporter.get_finished_records().unwrap();
        assert_eq!(span_names(&records), vec!["consume-message", "db.insert"]);
    }

    #[test]
    fn internal_specs_do_not_nest() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("redis.get").with_internal();

        txn.root().in_scope(|| {
            recorder.record(&spec, &Call::new(), || {
                // same-shim activity under an internal segment is suppressed
                recorder.record(&spec, &Call::new(), || ());
            })
        });
        txn.finish();

        assert_eq!(
            span_names(&exporter.get_finished_records().unwrap()),
            vec!["job", "redis.get"]
        );
    }

    #[test]
    fn opaque_segments_hide_descendants_from_export() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("render").with_opaque();
        let inner = OperationSpec::new("render.partial");

        txn.root().in_scope(|| {
            recorder.record(&spec, &Call::new(), || {
                recorder.record(&inner, &Call::new(), || ());
            })
        });
        txn.finish();

        assert_eq!(
            span_names(&exporter.get_finished_records().unwrap()),
            vec!["job", "render"]
        );
    }

    #[test]
    fn cancelled_timer_is_ignored_without_touching_its_siblings() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let timer_spec = OperationSpec::new("timer");
        let sibling_spec = OperationSpec::new("work");

        let bound = txn.root().in_scope(|| {
            recorder.record(&sibling_spec, &Call::new(), || ());
            recorder.record_callback(&timer_spec, &Call::new(), |bound| bound)
        });
        // cancellation: the continuation will never run
        if let Some(segment) = bound.segment() {
            segment.set_ignore(true);
        }
        drop(bound);
        txn.finish();

        assert_eq!(
            span_names(&exporter.get_finished_records().unwrap()),
            vec!["job", "work"]
        );
    }

    #[test]
    fn pending_callback_is_exported_truncated_at_finalize() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("db.query");

        let bound = txn
            .root()
            .in_scope(|| recorder.record_callback(&spec, &Call::new(), |bound| bound));
        txn.finish();

        let records = exporter.get_finished_records().unwrap();
        assert_eq!(span_names(&records), vec!["job", "Truncated/db.query"]);
        assert!(duration_of(&records, "Truncated/db.query") >= 0.0);
        drop(bound);
    }

    #[test]
    fn captured_arguments_become_agent_attributes() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("db.query").with_datastore("postgres");
        let call = Call::new()
            .with_arg("db.statement", "SELECT 1")
            .with_arg("port", 5432);

        txn.root()
            .in_scope(|| recorder.record(&spec, &call, || ()));
        txn.finish();

        let records = exporter.get_finished_records().unwrap();
        let query = &records[1];
        assert_eq!(
            query.agent_attributes.get("db.statement"),
            Some(&WireValue::String("SELECT 1".to_owned()))
        );
        assert_eq!(
            query.agent_attributes.get("port"),
            Some(&WireValue::Int(5432))
        );
        assert_eq!(
            query.intrinsics.get("component"),
            Some(&WireValue::String("postgres".to_owned()))
        );
    }

    #[test]
    fn middleware_chain_is_named_after_the_responder() {
        let (agent, recorder, _exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Web, "request");
        txn.set_name_prefix("WebTransaction/Handler");
        let logger = MiddlewareSpec::handler("logger", "/");
        let auth = MiddlewareSpec::handler("auth", "/");
        let handler = MiddlewareSpec::handler("show_user", "/users/:id");
        let call = Call::new();

        let result: Result<(), String> = txn.root().in_scope(|| {
            recorder.record_middleware(&logger, &call, |next| {
                next.proceed(|| {
                    recorder.record_middleware(&auth, &call, |next| {
                        next.proceed(|| {
                            recorder.record_middleware(
                                &handler,
                                &Call::new().with_arg("id", "42"),
                                |_next| {
                                    // the handler responds instead of continuing
                                    txn.mark_path();
                                    txn.freeze_name();
                                    Ok(())
                                },
                            )
                        })
                    })
                })
            })
        });
        assert!(result.is_ok());
        txn.finish();

        assert_eq!(txn.display_name(), "WebTransaction/Handler/users/:id");
        assert!(txn.noticed_error().is_none());
    }

    #[test]
    fn failing_middleware_names_the_transaction_and_notices_the_error() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Web, "request");
        txn.set_name_prefix("WebTransaction/Handler");
        let logger = MiddlewareSpec::handler("logger", "/");
        let auth = MiddlewareSpec::handler("auth", "/auth");
        let call = Call::new();

        let result: Result<(), String> = txn.root().in_scope(|| {
            recorder.record_middleware(&logger, &call, |next| {
                next.proceed(|| {
                    recorder.record_middleware(&auth, &call, |_next| {
                        Err("bad credentials".to_owned())
                    })
                })
            })
        });
        assert_eq!(result, Err("bad credentials".to_owned()));
        txn.finish();

        assert_eq!(txn.display_name(), "WebTransaction/Handler/auth");
        assert_eq!(
            txn.noticed_error(),
            Some(crate::NoticedError {
                message: "bad credentials".to_owned(),
                handled: false,
            })
        );
        // both middleware segments were recorded and closed
        assert_eq!(
            span_names(&exporter.get_finished_records().unwrap()),
            vec![
                "WebTransaction/Handler/auth",
                "Middleware/logger",
                "Middleware/auth",
            ]
        );
    }

    #[test]
    fn errorware_marks_the_error_handled_without_naming() {
        let (agent, recorder, _exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Web, "request");
        txn.set_name_prefix("WebTransaction/Handler");
        let auth = MiddlewareSpec::handler("auth", "/auth");
        let errorware = MiddlewareSpec::errorware("error_page");
        let call = Call::new();

        let _ = txn.root().in_scope(|| {
            let failed: Result<(), String> = recorder
                .record_middleware(&auth, &call, |_next| Err("bad credentials".to_owned()));
            assert!(failed.is_err());
            recorder.record_middleware(&errorware, &call, |_next| Ok::<_, String>(()))
        });
        txn.finish();

        // errorware contributed no frame, the failing path still names
        assert_eq!(txn.display_name(), "WebTransaction/Handler/auth");
        assert_eq!(
            txn.noticed_error(),
            Some(crate::NoticedError {
                message: "bad credentials".to_owned(),
                handled: true,
            })
        );
    }

    #[test]
    fn route_params_from_the_marked_frame_are_exported() {
        let (agent, recorder, exporter) = test_agent();
        let txn = agent.start_transaction(TransactionKind::Web, "request");
        txn.set_name_prefix("WebTransaction/Handler");
        let handler = MiddlewareSpec::handler("show_user", "/users/:id");

        let _: Result<(), String> = txn.root().in_scope(|| {
            recorder.record_middleware(
                &handler,
                &Call::new().with_arg("id", "42"),
                |_next| {
                    txn.mark_path();
                    txn.freeze_name();
                    Ok(())
                },
            )
        });
        txn.finish();

        let records = exporter.get_finished_records().unwrap();
        assert_eq!(
            records[0].agent_attributes.get("request.parameters.route.id"),
            Some(&WireValue::String("42".to_owned()))
        );
    }

    #[test]
    fn attribute_capture_can_be_disabled() {
        let exporter = InMemorySpanExporter::default();
        let mut config = crate::Config::default();
        config.capture_attributes = false;
        let agent = Agent::builder()
            .with_config(config)
            .with_exporter(exporter.clone())
            .build();
        let recorder = agent.recorder();

        let txn = agent.start_transaction(TransactionKind::Background, "job");
        let spec = OperationSpec::new("db.query");
        txn.root().in_scope(|| {
            recorder.record(&spec, &Call::new().with_arg("db.statement", "SELECT 1"), || ())
        });
        txn.finish();

        let records = exporter.get_finished_records().unwrap();
        assert!(records[1].agent_attributes.is_empty());
    }
}
