//! Execution-scoped context propagation.
//!
//! The `context` module tracks which segment is active for the current logical
//! flow of control. Instrumentation reads the active segment to parent new
//! work, and re-establishes it inside continuations that run later, on any
//! thread.
//!
//! # Main Types
//!
//! - [`Context`]: An immutable, execution-scoped carrier for the active
//!   segment.
//!

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;

use crate::segment::SegmentHandle;
use crate::vine_warn;


mod future_ext;

pub use future_ext::{FutureContextExt, StreamContextExt, WithContext};

thread_local! {
    static CURRENT_CONTEXT: RefCell<ContextStack> = RefCell::new(ContextStack::default());
}

/// An execution-scoped carrier for the active segment.
///
/// A [`Context`] is a propagation mechanism which carries the currently active
/// [`SegmentHandle`] across API boundaries and between logically associated
/// execution units. Instrumentation parents new segments under whatever the
/// context says is active, so propagating the context correctly is what makes
/// the segment tree reflect causality rather than scheduling order.
///
/// [`Context`]s are immutable; [`with_segment`] returns a new context rather
/// than mutating the original.
///
/// ## Managing the current context
///
/// Contexts can be associated with the caller's current execution unit on a
/// given thread via the [`attach`] method, and previous contexts can be
/// restored by dropping the returned [`ContextGuard`]. Contexts can be nested,
/// and will restore their parent outer context when detached on drop.
///
/// For work that happens later, [`bind`] and [`bind_once`] wrap a closure so
/// that each invocation runs with this context current, restoring the
/// invoking thread's previous context afterwards no matter what the closure
/// did to the context in between.
///
/// [`with_segment`]: Context::with_segment()
/// [`attach`]: Context::attach()
/// [`bind`]: Context::bind()
/// [`bind_once`]: Context::bind_once()
///
/// # Examples
///
/// ```
/// use tracevine::{Agent, Context, TransactionKind};
///
/// let agent = Agent::builder().build();
/// let txn = agent.start_transaction(TransactionKind::Background, "nightly-job");
///
/// // No segment is active until a context carrying one is attached
/// assert!(Context::current().segment().is_none());
///
/// {
///     let _guard = Context::current().with_segment(txn.root()).attach();
///     assert!(Context::current().segment().is_some());
/// }
///
/// // Resets to no active segment when the guard is dropped
/// assert!(Context::current().segment().is_none());
/// ```
#[derive(Clone, Default)]
pub struct Context {
    pub(crate) segment: Option<SegmentHandle>,
}

impl Context {
    /// Creates an empty `Context` with no active segment.
    pub fn new() -> Self {
        Context::default()
    }

    /// Returns an immutable snapshot of the current thread's context.
    pub fn current() -> Self {
        Self::map_current(|cx| cx.clone())
    }

    /// Applies a function to the current context returning its value.
    ///
    /// This can be used to read from the current context without the overhead
    /// of cloning it and dropping the clone.
    ///
    /// Note: This function will panic if you attempt to attach another context
    /// while the current one is still borrowed.
    pub fn map_current<T>(f: impl FnOnce(&Context) -> T) -> T {
        CURRENT_CONTEXT.with(|cx| cx.borrow().map_current_cx(f))
    }

    /// Returns a clone of the current thread's context with the given segment
    /// active.
    ///
    /// This is a more efficient form of `Context::current().with_segment(..)`
    /// as it avoids the intermediate context clone.
    pub fn current_with_segment(segment: SegmentHandle) -> Self {
        Self::map_current(|_cx| Context {
            segment: Some(segment),
        })
    }

    /// Returns a copy of the context with the given segment active.
    pub fn with_segment(&self, segment: SegmentHandle) -> Self {
        Context {
            segment: Some(segment),
        }
    }

    /// Returns the active segment of this context, if any.
    pub fn segment(&self) -> Option<&SegmentHandle> {
        self.segment.as_ref()
    }

    /// Returns the active segment of the current thread's context, if any.
    pub fn active_segment() -> Option<SegmentHandle> {
        Self::map_current(|cx| cx.segment.clone())
    }

    /// Replaces the current context on this thread with this context.
    ///
    /// Dropping the returned [`ContextGuard`] will reset the current context
    /// to the previous value.
    ///
    /// # Examples
    ///
    /// ```
    /// use tracevine::{Agent, Context, TransactionKind};
    ///
    /// let agent = Agent::builder().build();
    /// let txn = agent.start_transaction(TransactionKind::Background, "nightly-job");
    ///
    /// let my_cx = Context::new().with_segment(txn.root());
    ///
    /// // Set the current thread context
    /// let cx_guard = my_cx.attach();
    /// assert!(Context::current().segment().is_some());
    ///
    /// // Drop the guard to restore the previous context
    /// drop(cx_guard);
    /// assert!(Context::current().segment().is_none());
    /// ```
    pub fn attach(self) -> ContextGuard {
        let cx_id = CURRENT_CONTEXT.with(|cx| cx.borrow_mut().push(self));

        ContextGuard {
            cx_pos: cx_id,
            _marker: PhantomData,
        }
    }

    /// Wraps a closure so every invocation runs with this context current.
    ///
    /// The invoking thread's previous context is restored when the call
    /// returns, even if the closure attached further contexts and never
    /// detached them.
    pub fn bind<T, F>(self, mut f: F) -> impl FnMut() -> T
    where
        F: FnMut() -> T,
    {
        move || {
            let _scope = ScopedContext::enter(self.clone());
            f()
        }
    }

    /// Wraps a one-shot closure so its invocation runs with this context
    /// current.
    ///
    /// The invoking thread's previous context is restored when the call
    /// returns, even if the closure attached further contexts and never
    /// detached them.
    ///
    /// # Examples
    ///
    /// ```
    /// use tracevine::{Agent, Context, TransactionKind};
    ///
    /// let agent = Agent::builder().build();
    /// let txn = agent.start_transaction(TransactionKind::Background, "nightly-job");
    ///
    /// let cx = Context::new().with_segment(txn.root());
    /// let continuation = cx.bind_once(|| Context::current().segment().is_some());
    ///
    /// // Runs later, possibly on another thread, with the context
    /// // re-established for the duration of the call.
    /// assert!(continuation());
    /// assert!(Context::current().segment().is_none());
    /// ```
    pub fn bind_once<T, F>(self, f: F) -> impl FnOnce() -> T
    where
        F: FnOnce() -> T,
    {
        move || {
            let _scope = ScopedContext::enter(self);
            f()
        }
    }

    /// Runs a closure with this context current, restoring the previous
    /// context afterwards.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        let _scope = ScopedContext::enter(self.clone());
        f()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Context");
        match &self.segment {
            Some(segment) => dbg.field("segment", &segment.id()),
            None => dbg.field("segment", &"None"),
        };
        dbg.finish()
    }
}

/// A guard that resets the current context to the prior context when dropped.
#[derive(Debug)]
pub struct ContextGuard {
    // The position of the context in the stack. This is used to pop the context.
    cx_pos: u16,
    // Ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let id = self.cx_pos;
        if id > ContextStack::BASE_POS && id < ContextStack::MAX_POS {
            CURRENT_CONTEXT.with(|context_stack| context_stack.borrow_mut().pop_id(id));
        }
    }
}

/// A scope marker that forcibly restores its saved context when dropped.
///
/// Unlike [`ContextGuard`], which pops only its own entry and leaves deeper
/// attachments in place, dropping a `ScopedContext` abandons everything
/// attached above its save point. Continuations use this so a callee that
/// leaks a guard cannot poison the caller's context.
pub(crate) struct ScopedContext {
    cx_pos: u16,
    // Ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl ScopedContext {
    pub(crate) fn enter(cx: Context) -> Self {
        let cx_pos = CURRENT_CONTEXT.with(|stack| stack.borrow_mut().push(cx));

        ScopedContext {
            cx_pos,
            _marker: PhantomData,
        }
    }
}

impl Drop for ScopedContext {
    fn drop(&mut self) {
        let pos = self.cx_pos;
        if pos > ContextStack::BASE_POS && pos < ContextStack::MAX_POS {
            CURRENT_CONTEXT.with(|stack| stack.borrow_mut().restore_to(pos));
        }
    }
}

/// A stack for keeping track of the [`Context`] instances that have been attached
/// to a thread.
///
/// The stack allows for popping of contexts by position, which is used to do out
/// of order dropping of [`ContextGuard`] instances. Only when the top of the
/// stack is popped, the topmost [`Context`] is actually restored.
///
/// The stack relies on the fact that it is thread local and that the
/// [`ContextGuard`] instances that are constructed using ids from it can't be
/// moved to other threads. That means that the ids are always valid and that
/// they are always within the bounds of the stack.
struct ContextStack {
    /// This is the current [`Context`] that is active on this thread, and the top
    /// of the [`ContextStack`]. It is always present, and if the `stack` is empty
    /// it's an empty [`Context`].
    ///
    /// Having this here allows for fast access to the current [`Context`].
    current_cx: Context,
    /// A `stack` of the other contexts that have been attached to the thread.
    stack: Vec<Option<Context>>,
    /// Ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl ContextStack {
    const BASE_POS: u16 = 0;
    const MAX_POS: u16 = u16::MAX;
    const INITIAL_CAPACITY: usize = 8;

    #[inline(always)]
    fn push(&mut self, cx: Context) -> u16 {
        // The next id is the length of the `stack`, plus one since we have the
        // top of the [`ContextStack`] as the `current_cx`.
        let next_id = self.stack.len() + 1;
        if next_id < ContextStack::MAX_POS.into() {
            let current_cx = std::mem::replace(&mut self.current_cx, cx);
            self.stack.push(Some(current_cx));
            next_id as u16
        } else {
            // This is an overflow, log it and ignore it.
            vine_warn!(
                name: "Context.AttachFailed",
                message = format!("Too many contexts. Max limit is {}. \
                  Context::current() remains unchanged as this attach failed. \
                  Dropping the returned ContextGuard will have no impact on Context::current().",
                  ContextStack::MAX_POS)
            );
            ContextStack::MAX_POS
        }
    }

    #[inline(always)]
    fn pop_id(&mut self, pos: u16) {
        if pos == ContextStack::BASE_POS || pos == ContextStack::MAX_POS {
            // The empty context is always at the bottom of the [`ContextStack`]
            // and cannot be popped, and the overflow position is invalid, so do
            // nothing.
            vine_warn!(
                name: "Context.OutOfOrderDrop",
                position = pos,
                message = if pos == ContextStack::BASE_POS {
                    "Attempted to pop the base context which is not allowed"
                } else {
                    "Attempted to pop the overflow position which is not allowed"
                }
            );
            return;
        }
        let len: u16 = self.stack.len() as u16;
        // Are we at the top of the [`ContextStack`]?
        if pos == len {
            // Shrink the stack if possible to clear out any out of order pops.
            while let Some(None) = self.stack.last() {
                _ = self.stack.pop();
            }
            // Restore the previous context. This will always happen since the
            // empty context is always at the bottom of the stack if the
            // [`ContextStack`] is not empty.
            if let Some(Some(next_cx)) = self.stack.pop() {
                self.current_cx = next_cx;
            }
        } else {
            // This is an out of order pop.
            if pos >= len {
                // This is an invalid id, ignore it.
                vine_warn!(
                    name: "Context.PopOutOfBounds",
                    position = pos,
                    stack_length = len,
                    message = "Attempted to pop beyond the end of the context stack"
                );
                return;
            }
            // Clear out the entry at the given id.
            _ = self.stack[pos as usize].take();
        }
    }

    /// Restores the context that was current just before the push that
    /// returned `pos`, abandoning every entry attached above it.
    #[inline(always)]
    fn restore_to(&mut self, pos: u16) {
        if pos == ContextStack::BASE_POS || pos == ContextStack::MAX_POS {
            // Overflow pushes never took effect, nothing to restore.
            return;
        }
        let len: u16 = self.stack.len() as u16;
        if pos > len {
            // This is an invalid id, ignore it.
            vine_warn!(
                name: "Context.RestoreOutOfBounds",
                position = pos,
                stack_length = len,
                message = "Attempted to restore beyond the end of the context stack"
            );
            return;
        }
        // Entries above the save slot belong to guards that were attached
        // inside the scope and leaked. They are abandoned wholesale.
        self.stack.truncate(pos as usize);
        match self.stack.pop() {
            Some(Some(prev_cx)) => self.current_cx = prev_cx,
            // The save slot was cleared by an out of order pop.
            _ => self.current_cx = Context::default(),
        }
    }

    #[inline(always)]
    fn map_current_cx<T>(&self, f: impl FnOnce(&Context) -> T) -> T {
        f(&self.current_cx)
    }
}

impl Default for ContextStack {
    fn default() -> Self {
        ContextStack {
            current_cx: Context::default(),
            stack: Vec::with_capacity(ContextStack::INITIAL_CAPACITY),
            _marker: PhantomData,
        }
    }
}
