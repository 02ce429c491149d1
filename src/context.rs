use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, LazyLock};

use crate::value::Value;

/// An immutable frame of named settings.
///
/// Frames form chains: each frame holds its own shallow bindings plus a
/// pointer to its parent, and lookup walks child to root, so inner scopes
/// shadow outer ones. The bottom of every thread's stack is the process-wide
/// empty root frame, which can never be popped.
///
/// Tasks capture the frame active at *construction* time; the executor
/// re-installs that frame on whichever worker thread runs the body, so
/// injectable parameters resolve identically no matter where execution lands.
pub struct Context {
    bindings: BTreeMap<String, Value>,
    parent: Option<Arc<Context>>,
}

static ROOT: LazyLock<Arc<Context>> = LazyLock::new(|| {
    Arc::new(Context {
        bindings: BTreeMap::new(),
        parent: None,
    })
});

thread_local! {
    static STACK: RefCell<Vec<Arc<Context>>> = RefCell::new(vec![ROOT.clone()]);
}

impl Context {
    /// The frame currently active on this thread.
    pub fn current() -> Arc<Context> {
        STACK.with(|stack| stack.borrow().last().expect("context stack has a root").clone())
    }

    /// The process-wide root frame.
    pub fn root() -> Arc<Context> {
        ROOT.clone()
    }

    /// Looks up a setting, walking child to root.
    ///
    /// Absence (`None`) is distinct from a stored [`Value::Null`].
    pub fn get(&self, name: &str) -> Option<&Value> {
        let mut frame = self;
        loop {
            if let Some(value) = frame.bindings.get(name) {
                return Some(value);
            }
            match &frame.parent {
                Some(parent) => frame = parent,
                None => return None,
            }
        }
    }

    /// The merged bindings visible from this frame, child-wins.
    ///
    /// Intended for introspection and tests; lookup itself never
    /// materializes this map.
    pub fn visible(&self) -> BTreeMap<String, Value> {
        let mut merged = BTreeMap::new();
        let mut chain = vec![self];
        let mut frame = self;
        while let Some(parent) = &frame.parent {
            chain.push(parent.as_ref());
            frame = parent.as_ref();
        }
        for frame in chain.into_iter().rev() {
            for (name, value) in &frame.bindings {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }

    pub fn is_root(self: &Arc<Self>) -> bool {
        Arc::ptr_eq(self, &ROOT)
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("visible", &self.visible()).finish()
    }
}

/// Frames are equal iff their merged bindings are equal.
impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.visible() == other.visible()
    }
}

/// Opens a scope binding the given settings on the current thread.
///
/// The returned guard pops the frame when dropped, on every exit path
/// including unwinding. Scopes opened on one thread are invisible to others.
///
/// ```
/// use purple_titanium::{Context, Value, scope};
///
/// let _outer = scope([("timeout", Value::from(30))]);
/// {
///     let _inner = scope([("timeout", Value::from(60))]);
///     assert_eq!(Context::current().get("timeout"), Some(&Value::Int(60)));
/// }
/// assert_eq!(Context::current().get("timeout"), Some(&Value::Int(30)));
/// ```
pub fn scope<I, K>(settings: I) -> Scope
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    let frame = Arc::new(Context {
        bindings: settings.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        parent: Some(Context::current()),
    });
    push(frame.clone());
    Scope { frame }
}

/// Makes an already-captured frame current on this thread.
///
/// Used by executor workers before invoking a task body, so the body and its
/// diagnostics observe the construction-time frame.
pub(crate) fn install(frame: Arc<Context>) -> Scope {
    push(frame.clone());
    Scope { frame }
}

fn push(frame: Arc<Context>) {
    STACK.with(|stack| stack.borrow_mut().push(frame));
}

/// RAII guard for a pushed frame; see [`scope`].
#[must_use = "dropping the guard immediately closes the scope"]
pub struct Scope {
    frame: Arc<Context>,
}

impl Scope {
    /// The frame this scope pushed.
    pub fn frame(&self) -> Arc<Context> {
        self.frame.clone()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            // Normally ours is the top frame; out-of-order guard drops still
            // remove exactly the frame they pushed. Position 0 is the root.
            if let Some(pos) = stack.iter().rposition(|f| Arc::ptr_eq(f, &self.frame))
                && pos > 0
            {
                stack.remove(pos);
            }
        });
    }
}
