//! # Segment
//!
//! Segments represent a single operation within a transaction. Segments nest
//! to form the transaction's trace tree: each transaction owns a root segment,
//! which describes the end-to-end work and, optionally, one or more child
//! segments for its sub-operations.
//!
//! A segment's start and end timestamps reflect the elapsed real time of the
//! operation. The start time is set on creation, clamped so it never precedes
//! its parent's start. After creation it is possible to rename the segment and
//! attach attributes. These become no-ops once the segment has been closed;
//! only the `ignore` flag may still change, since out-of-band cancellation
//! legitimately arrives after close.

use std::borrow::Cow;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use crate::context::{Context, ScopedContext};
use crate::ids::SegmentId;
use crate::operation::Category;
use crate::transaction::{Transaction, TransactionInner};
use crate::KeyValue;

#[derive(Debug)]
pub(crate) struct SegmentInner {
    id: SegmentId,
    transaction: Weak<TransactionInner>,
    // Weak so a child can never keep its parent alive; ownership flows
    // strictly root-to-leaf through `children`.
    parent: Weak<SegmentInner>,
    state: Mutex<SegmentState>,
}

#[derive(Debug)]
pub(crate) struct SegmentState {
    name: Cow<'static, str>,
    start_time: SystemTime,
    end_time: Option<SystemTime>,
    last_touch: Option<SystemTime>,
    children: Vec<Arc<SegmentInner>>,
    attributes: Vec<KeyValue>,
    custom_attributes: Vec<KeyValue>,
    category: Category,
    opaque: bool,
    internal: bool,
    ignore: bool,
}

impl SegmentState {
    fn new(name: Cow<'static, str>, start_time: SystemTime) -> Self {
        SegmentState {
            name,
            start_time,
            end_time: None,
            last_touch: None,
            children: Vec::new(),
            attributes: Vec::new(),
            custom_attributes: Vec::new(),
            category: Category::Generic,
            opaque: false,
            internal: false,
            ignore: false,
        }
    }
}

impl SegmentInner {
    pub(crate) fn new(
        id: SegmentId,
        transaction: Weak<TransactionInner>,
        parent: Weak<SegmentInner>,
        name: Cow<'static, str>,
        start_time: SystemTime,
    ) -> Arc<Self> {
        Arc::new(SegmentInner {
            id,
            transaction,
            parent,
            state: Mutex::new(SegmentState::new(name, start_time)),
        })
    }
}

/// Thread safe reference to one timed node of a transaction's trace tree.
///
/// Handles are cheap to clone and may be held from any thread; all state
/// access goes through an internal lock. A handle never keeps the rest of the
/// tree alive: the transaction owns the tree through the root.
#[derive(Debug, Clone)]
pub struct SegmentHandle {
    inner: Arc<SegmentInner>,
}

impl SegmentHandle {
    pub(crate) fn from_inner(inner: Arc<SegmentInner>) -> Self {
        SegmentHandle { inner }
    }

    /// Returns this segment's id.
    pub fn id(&self) -> SegmentId {
        self.inner.id
    }

    /// Returns this segment's current name.
    pub fn name(&self) -> Cow<'static, str> {
        self.with_state_ref(|state| state.name.clone())
            .unwrap_or(Cow::Borrowed(""))
    }

    /// Updates the segment's name.
    ///
    /// No-op if the segment has already been closed.
    pub fn set_name<T>(&self, new_name: T)
    where
        T: Into<Cow<'static, str>>,
    {
        self.with_open_state(|state| state.name = new_name.into());
    }

    /// Returns `true` if this segment has not been closed yet.
    pub fn is_recording(&self) -> bool {
        self.with_state_ref(|state| state.end_time.is_none())
            .unwrap_or(false)
    }

    /// Records an attribute observed by instrumentation, such as a captured
    /// call argument.
    ///
    /// No-op if the segment has already been closed.
    pub fn add_attribute(&self, attribute: KeyValue) {
        self.with_open_state(|state| state.attributes.push(attribute));
    }

    /// Records an attribute supplied by application code.
    ///
    /// No-op if the segment has already been closed.
    pub fn add_custom_attribute(&self, attribute: KeyValue) {
        self.with_open_state(|state| state.custom_attributes.push(attribute));
    }

    /// Marks or unmarks this segment as excluded from naming and export.
    ///
    /// Unlike other writes this is honored even after close: cancelling a
    /// timer, for instance, ignores a segment whose timing is already settled.
    /// The flag applies to this segment and its descendants only; it never
    /// propagates upward to an enclosing segment.
    pub fn set_ignore(&self, ignore: bool) {
        self.with_state(|state| state.ignore = ignore);
    }

    /// Returns the segment's start time.
    pub fn start_time(&self) -> SystemTime {
        self.with_state_ref(|state| state.start_time)
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    /// Returns the segment's end time, if it has been closed.
    pub fn end_time(&self) -> Option<SystemTime> {
        self.with_state_ref(|state| state.end_time).flatten()
    }

    /// Returns the segment's duration, if it has been closed.
    pub fn duration(&self) -> Option<Duration> {
        self.with_state_ref(|state| {
            state
                .end_time
                .and_then(|end| end.duration_since(state.start_time).ok())
        })
        .flatten()
    }

    /// Closes this segment at the current time.
    ///
    /// Closing is idempotent: only the first close sets the end time.
    pub fn end(&self) {
        self.end_with_timestamp(crate::time::now());
    }

    /// Closes this segment at the given time, clamped so the recorded end
    /// never precedes the start.
    ///
    /// Closing is idempotent: only the first close sets the end time.
    pub fn end_with_timestamp(&self, timestamp: SystemTime) {
        self.with_state(|state| {
            if state.end_time.is_none() {
                state.end_time = Some(clamp_to_start(timestamp, state.start_time));
            }
        });
    }

    /// Records that work attributable to this segment happened just now.
    ///
    /// Used by collapsed and stream recordings, where one segment spans many
    /// repeated events and should end at the last of them.
    pub fn touch(&self) {
        let now = crate::time::now();
        self.with_state(|state| {
            if state.end_time.is_none() {
                state.last_touch = Some(now);
            }
        });
    }

    /// Closes this segment at the time of its most recent [`touch`], falling
    /// back to the current time if it was never touched.
    ///
    /// [`touch`]: SegmentHandle::touch
    pub fn end_at_last_touch(&self) {
        let fallback = crate::time::now();
        self.with_state(|state| {
            if state.end_time.is_none() {
                let timestamp = state.last_touch.unwrap_or(fallback);
                state.end_time = Some(clamp_to_start(timestamp, state.start_time));
            }
        });
    }

    /// Starts a new child segment under this one.
    ///
    /// Returns `None` when the owning transaction is gone, already finished,
    /// or out of segment budget. The child's start time is clamped so it never
    /// precedes this segment's start.
    pub fn start_child<T>(&self, name: T) -> Option<SegmentHandle>
    where
        T: Into<Cow<'static, str>>,
    {
        let txn = self.inner.transaction.upgrade()?;
        txn.try_start_child(self, name.into())
    }

    /// Runs a closure with this segment active in the current context,
    /// restoring the previous context afterwards.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        let _scope = ScopedContext::enter(Context::current_with_segment(self.clone()));
        f()
    }

    /// Returns the transaction that owns this segment, if it is still alive.
    pub fn transaction(&self) -> Option<Transaction> {
        self.inner.transaction.upgrade().map(Transaction::from_inner)
    }

    pub(crate) fn spawn_child(
        &self,
        id: SegmentId,
        transaction: Weak<TransactionInner>,
        name: Cow<'static, str>,
        now: SystemTime,
    ) -> SegmentHandle {
        let start_time = self
            .with_state_ref(|state| clamp_to_start(now, state.start_time))
            .unwrap_or(now);
        let child = SegmentInner::new(
            id,
            transaction,
            Arc::downgrade(&self.inner),
            name,
            start_time,
        );
        self.with_state(|state| state.children.push(child.clone()));
        SegmentHandle { inner: child }
    }

    pub(crate) fn set_category(&self, category: Category) {
        self.with_state(|state| state.category = category);
    }

    pub(crate) fn set_opaque(&self, opaque: bool) {
        self.with_state(|state| state.opaque = opaque);
    }

    pub(crate) fn set_internal(&self, internal: bool) {
        self.with_state(|state| state.internal = internal);
    }

    pub(crate) fn is_internal(&self) -> bool {
        self.with_state_ref(|state| state.internal).unwrap_or(false)
    }

    pub(crate) fn parent(&self) -> Option<SegmentHandle> {
        self.inner.parent.upgrade().map(SegmentHandle::from_inner)
    }

    /// Copies out everything export needs from this segment, including
    /// handles to its children for the tree walk.
    pub(crate) fn snapshot(&self) -> Option<SegmentSnapshot> {
        self.with_state_ref(|state| SegmentSnapshot {
            id: self.inner.id,
            name: state.name.clone(),
            start_time: state.start_time,
            end_time: state.end_time,
            category: state.category.clone(),
            opaque: state.opaque,
            ignore: state.ignore,
            attributes: state.attributes.clone(),
            custom_attributes: state.custom_attributes.clone(),
            children: state
                .children
                .iter()
                .map(|child| SegmentHandle::from_inner(child.clone()))
                .collect(),
        })
    }

    fn with_state<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut SegmentState) -> T,
    {
        self.inner.state.lock().ok().map(|mut guard| f(&mut guard))
    }

    fn with_open_state<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut SegmentState) -> T,
    {
        self.inner.state.lock().ok().and_then(|mut guard| {
            if guard.end_time.is_none() {
                Some(f(&mut guard))
            } else {
                None
            }
        })
    }

    fn with_state_ref<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&SegmentState) -> T,
    {
        self.inner.state.lock().ok().map(|guard| f(&guard))
    }

    #[cfg(test)]
    pub(crate) fn detached(name: &'static str) -> SegmentHandle {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = SegmentId::from(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        SegmentHandle {
            inner: SegmentInner::new(
                id,
                Weak::new(),
                Weak::new(),
                Cow::Borrowed(name),
                crate::time::now(),
            ),
        }
    }
}

fn clamp_to_start(timestamp: SystemTime, start_time: SystemTime) -> SystemTime {
    if timestamp < start_time {
        start_time
    } else {
        timestamp
    }
}

#[derive(Debug)]
pub(crate) struct SegmentSnapshot {
    pub(crate) id: SegmentId,
    pub(crate) name: Cow<'static, str>,
    pub(crate) start_time: SystemTime,
    pub(crate) end_time: Option<SystemTime>,
    pub(crate) category: Category,
    pub(crate) opaque: bool,
    pub(crate) ignore: bool,
    pub(crate) attributes: Vec<KeyValue>,
    pub(crate) custom_attributes: Vec<KeyValue>,
    pub(crate) children: Vec<SegmentHandle>,
}
