use std::pin::Pin;
use std::task::Context as TaskContext;
use std::task::Poll;

use futures_core::Stream;
use pin_project_lite::pin_project;

use crate::Context;

impl<T: std::future::Future> std::future::Future for WithContext<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.vine_cx.clone().attach();

        this.inner.poll(task_cx)
    }
}

impl<T: Stream> Stream for WithContext<T> {
    type Item = T::Item;

    fn poll_next(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let _guard = this.vine_cx.clone().attach();
        T::poll_next(this.inner, task_cx)
    }
}

pin_project! {
    /// A future or stream that has an associated context.
    #[derive(Clone, Debug)]
    pub struct WithContext<T> {
        #[pin]
        inner: T,
        vine_cx: Context,
    }
}

// The following two extension traits are _almost_ identical,
// but need to be separate to avoid overlapping implementation errors.

impl<F: std::future::Future> FutureContextExt for F {}
/// Extension trait allowing futures to carry an active segment.
pub trait FutureContextExt: Sized {
    /// Attaches the provided [`Context`] to this future, returning a `WithContext`
    /// wrapper.
    ///
    /// The attached context will be set as current while this future is being polled.
    ///
    /// [`Context`]: Context
    fn with_context(self, vine_cx: Context) -> WithContext<Self> {
        WithContext {
            inner: self,
            vine_cx,
        }
    }

    /// Attaches the current [`Context`] to this future, returning a `WithContext`
    /// wrapper.
    ///
    /// The attached context will be set as current while this future is being polled.
    ///
    /// [`Context`]: Context
    fn with_current_context(self) -> WithContext<Self> {
        let vine_cx = Context::current();
        self.with_context(vine_cx)
    }
}

impl<S: Stream> StreamContextExt for S {}
/// Extension trait allowing streams to carry an active segment.
pub trait StreamContextExt: Sized {
    /// Attaches the provided [`Context`] to this stream, returning a `WithContext`
    /// wrapper.
    ///
    /// The attached context will be set as current while this stream is being polled.
    ///
    /// [`Context`]: Context
    fn with_context(self, vine_cx: Context) -> WithContext<Self> {
        WithContext {
            inner: self,
            vine_cx,
        }
    }

    /// Attaches the current [`Context`] to this stream, returning a `WithContext`
    /// wrapper.
    ///
    /// The attached context will be set as current while this stream is being polled.
    ///
    /// [`Context`]: Context
    fn with_current_context(self) -> WithContext<Self> {
        let vine_cx = Context::current();
        self.with_context(vine_cx)
    }
}
