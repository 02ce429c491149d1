use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{CallError, ExecError};
use crate::events::{EventBus, Listener};
use crate::executor::Runner;
use crate::hash::Signature;
use crate::store::Store;
use crate::task::{CallArgs, TaskDef, TaskRecord};
use crate::value::Value;

/// A lazy output handle: a lightweight, copyable token standing for the
/// not-yet-computed result of one task instance.
///
/// Passing a handle as an argument to another task — directly or nested
/// inside a list, tuple, set or map — encodes a dependency edge. Handles are
/// resolved by [`Engine::run`] or a [`Runner`]; diamond-shaped graphs
/// execute each shared dependency once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Output {
    pub(crate) node: u32,
    pub(crate) signature: Signature,
}

impl Output {
    /// The signature of the owning task.
    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub(crate) fn index(&self) -> NodeIndex {
        NodeIndex::new(self.node as usize)
    }

    #[cfg(test)]
    pub(crate) fn fake(node: u32, signature: u64) -> Self {
        Self {
            node,
            signature: Signature(signature),
        }
    }
}

/// The per-signature state of a result in the shared map.
enum Slot {
    /// Some runner is computing this signature right now.
    Resolving,
    Resolved(Value),
    Failed(ExecError),
}

/// What a runner holds after asking for a signature.
pub(crate) enum Claim {
    /// The caller owns the slot and must publish or release it.
    Owned,
    Ready(Result<Value, ExecError>),
    /// A concurrent run is resolving this signature; retry later. Never
    /// blocking here keeps two runs claiming overlapping signatures in
    /// opposite orders from deadlocking each other.
    Busy,
}

/// The engine-wide result map: signature-keyed memoization with
/// signature-level mutual exclusion across concurrent runs.
#[derive(Default)]
pub(crate) struct ResultMap {
    slots: Mutex<HashMap<Signature, Slot>>,
}

impl ResultMap {
    /// Attempts to claim a signature for execution.
    pub(crate) fn try_claim(&self, signature: Signature) -> Claim {
        let mut slots = self.slots.lock().unwrap();
        match slots.get(&signature) {
            None => {
                slots.insert(signature, Slot::Resolving);
                Claim::Owned
            }
            Some(Slot::Resolved(value)) => Claim::Ready(Ok(value.clone())),
            Some(Slot::Failed(err)) => Claim::Ready(Err(err.clone())),
            Some(Slot::Resolving) => Claim::Busy,
        }
    }

    /// Publishes the outcome of a claimed signature.
    pub(crate) fn publish(&self, signature: Signature, result: Result<Value, ExecError>) {
        let mut slots = self.slots.lock().unwrap();
        let slot = match result {
            Ok(value) => Slot::Resolved(value),
            Err(err) => Slot::Failed(err),
        };
        slots.insert(signature, slot);
    }

    /// Releases a claimed signature without a result, e.g. on cancellation,
    /// so a later run can execute it.
    pub(crate) fn release(&self, signature: Signature) {
        let mut slots = self.slots.lock().unwrap();
        if matches!(slots.get(&signature), Some(Slot::Resolving)) {
            slots.remove(&signature);
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) graph: Mutex<Graph<Arc<TaskRecord>, ()>>,
    pub(crate) results: ResultMap,
    pub(crate) store: Mutex<Option<Arc<dyn Store>>>,
    pub(crate) events: EventBus,
}

/// A task-graph pipeline engine.
///
/// The engine owns the task graph, the in-memory result map, the optional
/// persistence store and the event bus. Cloning is cheap and clones share
/// all state. Most programs use one engine — either [`Engine::global`] or an
/// explicit instance — while tests construct isolated engines freely.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

static GLOBAL: LazyLock<Engine> = LazyLock::new(Engine::new);

impl Engine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EngineInner {
                graph: Mutex::new(Graph::new()),
                results: ResultMap::default(),
                store: Mutex::new(None),
                events: EventBus::default(),
            }),
        }
    }

    /// An engine with persistence enabled from the start.
    pub fn with_store(store: Arc<dyn Store>) -> Self {
        let engine = Self::new();
        engine.set_store(Some(store));
        engine
    }

    /// An engine configured from `PT_CACHE_DIR` / `PT_CACHE`; persistence
    /// stays disabled when the environment says nothing.
    pub fn from_env() -> Self {
        let engine = Self::new();
        if let Some(store) = crate::store::from_env() {
            engine.set_store(Some(store));
        }
        engine
    }

    /// The implicit process-wide engine.
    pub fn global() -> &'static Engine {
        &GLOBAL
    }

    /// Replaces the persistence store; `None` disables persistence, making
    /// every load a miss and every save a no-op.
    pub fn set_store(&self, store: Option<Arc<dyn Store>>) {
        *self.inner.store.lock().unwrap() = store;
    }

    pub(crate) fn store(&self) -> Option<Arc<dyn Store>> {
        self.inner.store.lock().unwrap().clone()
    }

    /// Subscribes a lifecycle event listener for every future run.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&crate::events::Event) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(Arc::new(listener) as Listener);
    }

    /// Constructs a task instance from a declaration and call arguments.
    ///
    /// This resolves and freezes the parameters (consulting the active
    /// [`Context`] for injectables), computes the signature, records the
    /// instance and its dependency edges in the graph, and returns the lazy
    /// output handle. The body does not run here.
    pub fn call(&self, def: &TaskDef, args: CallArgs) -> Result<Output, CallError> {
        let frame = Context::current();
        let params = def.resolve(args, &frame)?;
        let record = Arc::new(TaskRecord::new(def, params, frame)?);
        let signature = record.signature;
        let deps = record.deps.clone();

        let mut graph = self.inner.graph.lock().unwrap();
        let index = graph.add_node(record);
        for dep in &deps {
            graph.add_edge(dep.index(), index, ());
        }

        Ok(Output {
            node: index.index() as u32,
            signature,
        })
    }

    /// Executes the minimal subgraph feeding `target` and returns its value.
    /// Shorthand for `self.runner().run(target)`.
    pub fn run(&self, target: Output) -> Result<Value, ExecError> {
        self.runner().run(target)
    }

    /// A configurable run builder.
    pub fn runner(&self) -> Runner {
        Runner::new(self.clone())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = self.inner.graph.lock().unwrap();
        f.debug_struct("Engine")
            .field("tasks", &graph.node_count())
            .field("edges", &graph.edge_count())
            .finish_non_exhaustive()
    }
}
