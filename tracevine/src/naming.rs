//! Transaction naming for request/response style work.
//!
//! Many middleware run for one request, but only the one that actually
//! produced the response should name the transaction. The name state tracks
//! mount paths as a stack of frames: middleware push their path on entry and
//! pop it again when they hand off cleanly, while the responding handler marks
//! the stack before it unwinds. A middleware that fails leaves its frame in
//! place, so failed requests are named after the handler that failed rather
//! than whichever handler ran last.
//!
//! Once the response has started the state freezes: late asynchronous work
//! cannot retroactively rename a transaction whose name the user already saw.

use std::borrow::Cow;

use crate::vine_warn;
use crate::KeyValue;

#[derive(Debug, Clone)]
pub(crate) struct PathFrame {
    path: String,
    params: Vec<KeyValue>,
}

#[derive(Debug)]
pub(crate) struct NameState {
    frames: Vec<PathFrame>,
    marked: Vec<PathFrame>,
    frozen: bool,
    prefix: Option<Cow<'static, str>>,
    explicit: Option<Cow<'static, str>>,
}

impl NameState {
    pub(crate) fn new() -> Self {
        NameState {
            frames: Vec::new(),
            marked: Vec::new(),
            frozen: false,
            prefix: None,
            explicit: None,
        }
    }

    /// Pushes a mount-path frame. No-op once frozen.
    pub(crate) fn append_path(&mut self, path: impl Into<String>, params: Vec<KeyValue>) {
        if self.frozen {
            return;
        }
        self.frames.push(PathFrame {
            path: path.into(),
            params,
        });
    }

    /// Pops the top frame if its path matches `expected`.
    ///
    /// A mismatch means push/pop bookkeeping got out of sync somewhere in the
    /// middleware chain; it is logged and the stack is left untouched.
    /// Popping stays legal after freezing, since the chain still unwinds
    /// after the response has started.
    pub(crate) fn pop_path(&mut self, expected: &str) {
        match self.frames.last() {
            Some(frame) if frame.path == expected => {
                self.frames.pop();
            }
            Some(frame) => {
                vine_warn!(
                    name: "Naming.PathPopMismatch",
                    expected = expected,
                    found = frame.path.clone()
                );
            }
            None => {
                vine_warn!(name: "Naming.PathPopEmpty", expected = expected);
            }
        }
    }

    /// Records the current stack as the path that produced the response.
    ///
    /// The marked copy survives the pops that happen while the middleware
    /// chain unwinds. No-op once frozen.
    pub(crate) fn mark_path(&mut self) {
        if self.frozen {
            return;
        }
        self.marked = self.frames.clone();
    }

    /// Freezes the name. Subsequent appends, marks, and renames are ignored.
    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    pub(crate) fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Sets the display-name prefix, e.g. the framework name. No-op once
    /// frozen.
    pub(crate) fn set_prefix(&mut self, prefix: impl Into<Cow<'static, str>>) {
        if self.frozen {
            return;
        }
        self.prefix = Some(prefix.into());
    }

    /// Overrides the computed name entirely. No-op once frozen.
    pub(crate) fn set_name(&mut self, name: impl Into<Cow<'static, str>>) {
        if self.frozen {
            return;
        }
        self.explicit = Some(name.into());
    }

    pub(crate) fn explicit_name(&self) -> Option<&str> {
        self.explicit.as_deref()
    }

    /// Whether any naming activity happened at all. When nothing did, the
    /// transaction keeps its start name instead of being renamed to `/`.
    pub(crate) fn has_name(&self) -> bool {
        self.explicit.is_some() || !self.effective_frames().is_empty()
    }

    /// Joins the effective frames into a normalized route path.
    ///
    /// The effective frames are the marked copy when it is deeper than the
    /// live stack (the usual case after a clean unwind) and the live stack
    /// otherwise (a failing middleware leaves its frame in place, making the
    /// live stack the deeper one).
    pub(crate) fn path(&self) -> String {
        let mut path = String::from("/");
        let parts = self
            .effective_frames()
            .iter()
            .flat_map(|frame| frame.path.split('/'))
            .filter(|part| !part.is_empty());
        for part in parts {
            if path.len() > 1 {
                path.push('/');
            }
            path.push_str(part);
        }
        path
    }

    /// Computes the transaction's display name: the explicit override if one
    /// was set, otherwise the prefixed route path.
    pub(crate) fn display_name(&self) -> String {
        if let Some(name) = &self.explicit {
            return name.to_string();
        }
        let path = self.path();
        match &self.prefix {
            Some(prefix) => format!("{}{}", prefix, path),
            None => path,
        }
    }

    /// Route parameters captured by the effective frames.
    pub(crate) fn route_params(&self) -> Vec<KeyValue> {
        self.effective_frames()
            .iter()
            .flat_map(|frame| frame.params.iter().cloned())
            .collect()
    }

    fn effective_frames(&self) -> &[PathFrame] {
        if self.marked.len() > self.frames.len() {
            &self.marked
        } else {
            &self.frames
        }
    }
}

impl Default for NameState {
    fn default() -> Self {
        Self::new()
    }
}
