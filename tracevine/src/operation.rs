//! Declarative descriptions of intercepted operations.
//!
//! Instrumentation modules do not drive the tracer imperatively. Instead they
//! register an [`OperationSpec`] per interception point: how the segment
//! should be named (a literal, or computed from the live arguments), what
//! category of work it is, how it nests, and what should happen when it
//! completes. The recorder interprets the spec against each live [`Call`].
//! Specs are pure configuration and carry no runtime state.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::segment::SegmentHandle;
use crate::transaction::TransactionKind;
use crate::{KeyValue, Value};

/// How a recorded segment gets its name.
#[derive(Clone)]
pub(crate) enum NameSource {
    Literal(Cow<'static, str>),
    Derived(Arc<dyn Fn(&Call) -> Option<Cow<'static, str>> + Send + Sync>),
}

impl fmt::Debug for NameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameSource::Literal(name) => f.debug_tuple("Literal").field(name).finish(),
            NameSource::Derived(_) => f.debug_tuple("Derived").field(&"<fn>").finish(),
        }
    }
}

/// The kind of work a segment represents.
///
/// Generic segments carry no category-specific export intrinsics. Datastore
/// and external segments additionally export the component that served them
/// and a client span kind.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Category {
    /// In-process work with no remote party.
    Generic,
    /// A call into a database or cache.
    Datastore {
        /// Product name, e.g. `postgres` or `redis`.
        product: Cow<'static, str>,
    },
    /// An outbound call to another service.
    External {
        /// The client library that issued the call.
        library: Cow<'static, str>,
    },
}

impl Default for Category {
    fn default() -> Self {
        Category::Generic
    }
}

/// Scalar snapshots of an intercepted call's arguments.
///
/// Instrumentation captures whatever is cheap and safe to copy out of the
/// live call: positional or named scalars used for naming, and parameters
/// worth exporting. The recorder never touches the call itself.
#[derive(Clone, Debug, Default)]
pub struct Call {
    args: Vec<KeyValue>,
}

impl Call {
    /// Creates an empty call description.
    pub fn new() -> Self {
        Call::default()
    }

    /// Adds one captured argument.
    pub fn with_arg<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<crate::Key>,
        V: Into<Value>,
    {
        self.args.push(KeyValue::new(key, value));
        self
    }

    /// Looks up a captured argument by name.
    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.args
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    pub(crate) fn attributes(&self) -> &[KeyValue] {
        &self.args
    }
}

/// What the recorder passes to a post-completion hook.
#[derive(Debug)]
pub struct AfterCall<'a> {
    /// The segment about to be closed.
    pub segment: &'a SegmentHandle,
    /// The error the operation completed with, if any.
    pub error: Option<&'a str>,
}

pub(crate) type AfterHook = Arc<dyn Fn(AfterCall<'_>) + Send + Sync>;

/// An immutable, declarative description of one interception point.
///
/// # Examples
///
/// A literal name and a datastore category:
///
/// ```
/// use tracevine::OperationSpec;
///
/// let spec = OperationSpec::new("db.users.find").with_datastore("postgres");
/// ```
///
/// A name computed from the captured arguments; returning `None` skips
/// tracing for that call without affecting it:
///
/// ```
/// use tracevine::OperationSpec;
///
/// let spec = OperationSpec::derived(|call| {
///     call.arg("collection")
///         .map(|collection| format!("db.{}.find", collection.as_str()).into())
/// });
/// ```
#[derive(Clone)]
pub struct OperationSpec {
    name: NameSource,
    category: Category,
    internal: bool,
    opaque: bool,
    entry_point: Option<TransactionKind>,
    after: Option<AfterHook>,
}

impl OperationSpec {
    /// Creates a spec with a fixed segment name.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        OperationSpec {
            name: NameSource::Literal(name.into()),
            category: Category::Generic,
            internal: false,
            opaque: false,
            entry_point: None,
            after: None,
        }
    }

    /// Creates a spec whose segment name is derived from the live call.
    ///
    /// Returning `None` skips tracing for that call.
    pub fn derived<F>(name: F) -> Self
    where
        F: Fn(&Call) -> Option<Cow<'static, str>> + Send + Sync + 'static,
    {
        OperationSpec {
            name: NameSource::Derived(Arc::new(name)),
            category: Category::Generic,
            internal: false,
            opaque: false,
            entry_point: None,
            after: None,
        }
    }

    /// Categorizes recorded segments as datastore calls.
    pub fn with_datastore(mut self, product: impl Into<Cow<'static, str>>) -> Self {
        self.category = Category::Datastore {
            product: product.into(),
        };
        self
    }

    /// Categorizes recorded segments as outbound external calls.
    pub fn with_external(mut self, library: impl Into<Cow<'static, str>>) -> Self {
        self.category = Category::External {
            library: library.into(),
        };
        self
    }

    /// Marks recorded segments as internal plumbing: further recordings by
    /// internal specs are suppressed while such a segment is active.
    pub fn with_internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Marks recorded segments as opaque: their descendants are suppressed
    /// from export.
    pub fn with_opaque(mut self) -> Self {
        self.opaque = true;
        self
    }

    /// Makes this spec a transaction entry point: recording with no active
    /// transaction starts one of the given kind instead of passing through,
    /// and finishes it when the recorded operation completes.
    pub fn with_entry_point(mut self, kind: TransactionKind) -> Self {
        self.entry_point = Some(kind);
        self
    }

    /// Installs a hook that runs right before the segment closes, with the
    /// segment and the operation's error outcome. Hook panics are swallowed
    /// and logged, never surfaced to the instrumented call.
    pub fn with_after<F>(mut self, hook: F) -> Self
    where
        F: Fn(AfterCall<'_>) + Send + Sync + 'static,
    {
        self.after = Some(Arc::new(hook));
        self
    }

    pub(crate) fn resolve_name(&self, call: &Call) -> Option<Cow<'static, str>> {
        match &self.name {
            NameSource::Literal(name) => Some(name.clone()),
            NameSource::Derived(derive) => derive(call),
        }
    }

    pub(crate) fn is_derived_name(&self) -> bool {
        matches!(self.name, NameSource::Derived(_))
    }

    pub(crate) fn category(&self) -> &Category {
        &self.category
    }

    pub(crate) fn internal(&self) -> bool {
        self.internal
    }

    pub(crate) fn opaque(&self) -> bool {
        self.opaque
    }

    pub(crate) fn entry_point(&self) -> Option<TransactionKind> {
        self.entry_point
    }

    pub(crate) fn after(&self) -> Option<&AfterHook> {
        self.after.as_ref()
    }
}

impl fmt::Debug for OperationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationSpec")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("internal", &self.internal)
            .field("opaque", &self.opaque)
            .field("entry_point", &self.entry_point)
            .field("after", &self.after.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Whether a middleware participates in naming or only in error bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MiddlewareKind {
    /// Ordinary middleware or route handler; contributes its mount path to
    /// the transaction name.
    Handler,
    /// Error-handling middleware; never contributes to naming, only marks
    /// the transaction's noticed error as handled.
    Errorware,
}

/// Describes one middleware in a request/response chain.
#[derive(Clone, Debug)]
pub struct MiddlewareSpec {
    name: Cow<'static, str>,
    kind: MiddlewareKind,
    mount_path: Option<Cow<'static, str>>,
}

impl MiddlewareSpec {
    /// A middleware or route handler mounted at the given path.
    pub fn handler(
        name: impl Into<Cow<'static, str>>,
        mount_path: impl Into<Cow<'static, str>>,
    ) -> Self {
        MiddlewareSpec {
            name: name.into(),
            kind: MiddlewareKind::Handler,
            mount_path: Some(mount_path.into()),
        }
    }

    /// An error-handling middleware.
    pub fn errorware(name: impl Into<Cow<'static, str>>) -> Self {
        MiddlewareSpec {
            name: name.into(),
            kind: MiddlewareKind::Errorware,
            mount_path: None,
        }
    }

    pub(crate) fn name(&self) -> &Cow<'static, str> {
        &self.name
    }

    pub(crate) fn kind(&self) -> MiddlewareKind {
        self.kind
    }

    pub(crate) fn mount_path(&self) -> Option<&str> {
        self.mount_path.as_deref()
    }
}
