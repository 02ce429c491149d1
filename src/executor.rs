use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::unbounded;
use petgraph::Direction;
use petgraph::graph::{Graph, NodeIndex};

use crate::engine::{Claim, Engine, Output};
use crate::error::{ExecError, StoreError, TaskFailure};
use crate::events::{Event, EventBus, EventKind, Listener};
use crate::hash::Signature;
use crate::store::{RecordMeta, Store};
use crate::task::{TaskArgs, TaskRecord};
use crate::value::Value;

/// A clonable cooperative cancellation flag.
///
/// The scheduler checks the token between task invocations; a running body
/// is never interrupted, but it may poll a captured clone of the token to
/// stop early. Timeouts are cancellations fired by a timer.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fires [`cancel`](Self::cancel) after `delay` on a timer thread.
    pub fn cancel_after(&self, delay: Duration) {
        let token = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            token.cancel();
        });
    }
}

/// Emits one event to the engine-wide bus and any per-run listeners.
#[derive(Clone)]
struct Emitter {
    engine: EventBus,
    local: EventBus,
}

impl Emitter {
    fn emit(&self, kind: EventKind, task: &str, signature: Signature) {
        let event = Event {
            kind,
            task: task.to_string(),
            signature,
        };
        self.engine.emit(&event);
        self.local.emit(&event);
    }
}

/// A configurable run over an [`Engine`]'s task graph.
///
/// Created through [`Engine::runner`]; executes the minimal subgraph feeding
/// the requested targets, leaves first, parallelizing independent branches
/// on the rayon pool.
pub struct Runner {
    engine: Engine,
    fail_fast: bool,
    cancel: CancelToken,
    store_override: Option<Arc<dyn Store>>,
    store_disabled: bool,
    local_events: EventBus,
}

impl Runner {
    pub(crate) fn new(engine: Engine) -> Self {
        Self {
            engine,
            fail_fast: false,
            cancel: CancelToken::new(),
            store_override: None,
            store_disabled: false,
            local_events: EventBus::default(),
        }
    }

    /// Aborts the whole run on the first failure instead of completing
    /// unrelated branches.
    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    /// Attaches a cancellation token checked between task invocations.
    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Overrides the engine's persistence store for this run.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store_override = Some(store);
        self
    }

    /// Disables persistence for this run regardless of engine configuration.
    pub fn without_store(mut self) -> Self {
        self.store_disabled = true;
        self
    }

    /// Subscribes a lifecycle listener for this run only.
    pub fn subscribe<F>(self, listener: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.local_events.subscribe(Arc::new(listener) as Listener);
        self
    }

    /// Executes dependencies leaves-first and returns the target's value.
    pub fn run(&self, target: Output) -> Result<Value, ExecError> {
        self.run_all(&[target]).pop().expect("one result per target")
    }

    /// Executes the union subgraph of all targets; one result per target, in
    /// order. Without fail-fast, a failure in one branch does not stop
    /// unrelated branches.
    pub fn run_all(&self, targets: &[Output]) -> Vec<Result<Value, ExecError>> {
        let _ = crate::utils::init_logging();

        let graph = self.engine.inner.graph.lock().unwrap().clone();

        for target in targets {
            graph
                .node_weight(target.index())
                .expect("output handle does not belong to this engine");
        }

        // Cycles are structurally impossible (a handle can only reference a
        // task that already existed), so toposort failing means the graph
        // state is broken; surface it instead of scheduling.
        if petgraph::algo::toposort(&graph, None).is_err() {
            return targets.iter().map(|_| Err(ExecError::CycleDetected)).collect();
        }

        // Discover the minimal subgraph feeding the targets.
        let mut reachable = HashSet::new();
        let mut stack: Vec<NodeIndex> = targets.iter().map(Output::index).collect();
        while let Some(index) = stack.pop() {
            if reachable.insert(index) {
                stack.extend(graph.neighbors_directed(index, Direction::Incoming));
            }
        }

        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in graph.raw_edges() {
            if reachable.contains(&edge.source()) && reachable.contains(&edge.target()) {
                dependents.entry(edge.source()).or_default().push(edge.target());
            }
        }

        let counts: HashMap<NodeIndex, usize> = reachable
            .iter()
            .map(|&index| {
                let n = graph
                    .neighbors_directed(index, Direction::Incoming)
                    .filter(|dep| reachable.contains(dep))
                    .count();
                (index, n)
            })
            .collect();

        let store = if self.store_disabled {
            None
        } else {
            self.store_override.clone().or_else(|| self.engine.store())
        };

        let mut state = RunState {
            graph: &graph,
            engine: &self.engine,
            emitter: Emitter {
                engine: self.engine.inner.events.clone(),
                local: self.local_events.clone(),
            },
            store,
            cancel: self.cancel.clone(),
            fail_fast: self.fail_fast,
            dependents,
            counts,
            results: HashMap::new(),
            claimed: HashSet::new(),
            waiters: HashMap::new(),
            ready: VecDeque::new(),
            finished: VecDeque::new(),
            parked: Vec::new(),
            inflight: 0,
            completed: 0,
            total: reachable.len(),
            aborted: false,
        };

        for &index in &reachable {
            if state.counts[&index] == 0 {
                state.ready.push_back(index);
            }
        }

        let (sender, receiver) = unbounded::<(NodeIndex, Result<Value, ExecError>)>();

        rayon::scope(|scope| {
            loop {
                while let Some(index) = state.ready.pop_front() {
                    if let Some(work) = state.stage(index) {
                        state.inflight += 1;
                        let sender = sender.clone();
                        scope.spawn(move |_| {
                            let _ = sender.send(work.execute());
                        });
                    }
                }

                if let Some((index, result)) = state.finished.pop_front() {
                    state.finish(index, result);
                    continue;
                }

                if state.completed >= state.total {
                    break;
                }

                if state.inflight > 0 {
                    match receiver.recv_timeout(Duration::from_millis(10)) {
                        Ok((index, result)) => {
                            state.inflight -= 1;
                            state.finished.push_back((index, result));
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => state.retry_parked(),
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                } else if !state.parked.is_empty() {
                    // Every remaining node is waiting on a concurrent run.
                    std::thread::sleep(Duration::from_millis(5));
                    state.retry_parked();
                } else {
                    break;
                }
            }
        });

        tracing::debug!(
            tasks = state.total,
            executed = state.completed,
            "run complete"
        );

        targets
            .iter()
            .map(|target| {
                state
                    .results
                    .get(&target.index())
                    .cloned()
                    .unwrap_or(Err(ExecError::Cancelled))
            })
            .collect()
    }
}

/// Mutable bookkeeping for one run, driven by the scheduler loop.
struct RunState<'a> {
    graph: &'a Graph<Arc<TaskRecord>, ()>,
    engine: &'a Engine,
    emitter: Emitter,
    store: Option<Arc<dyn Store>>,
    cancel: CancelToken,
    fail_fast: bool,
    dependents: HashMap<NodeIndex, Vec<NodeIndex>>,
    counts: HashMap<NodeIndex, usize>,
    /// Per-node outcomes of this run.
    results: HashMap<NodeIndex, Result<Value, ExecError>>,
    /// Signatures this run holds `Resolving` claims for.
    claimed: HashSet<Signature>,
    /// Nodes parked behind an in-run claim of the same signature.
    waiters: HashMap<Signature, Vec<NodeIndex>>,
    ready: VecDeque<NodeIndex>,
    finished: VecDeque<(NodeIndex, Result<Value, ExecError>)>,
    /// Nodes whose signature a concurrent run is resolving; retried
    /// periodically until that run publishes or releases.
    parked: Vec<NodeIndex>,
    inflight: usize,
    completed: usize,
    total: usize,
    aborted: bool,
}

impl RunState<'_> {
    /// Decides what happens to a ready node: finish it inline (cancelled,
    /// failed dependency, memoized or persisted result) or hand back a
    /// prepared body invocation for the worker pool.
    fn stage(&mut self, index: NodeIndex) -> Option<Work> {
        let record = self.graph[index].clone();
        let signature = record.signature;

        if self.aborted || self.cancel.is_cancelled() {
            self.finished.push_back((index, Err(ExecError::Cancelled)));
            return None;
        }

        // Propagate dependency failures without invoking the body. The
        // original failure's signature travels with the error through
        // arbitrarily long dependent chains.
        for dep in &record.deps {
            if let Some(Err(err)) = self.results.get(&dep.index()) {
                let propagated = match err {
                    ExecError::Cancelled => ExecError::Cancelled,
                    ExecError::CycleDetected => ExecError::CycleDetected,
                    ExecError::TaskFailed { failure, .. } => ExecError::DependencyFailed {
                        task: record.name.clone(),
                        dependency: dep.signature(),
                        failure: failure.clone(),
                    },
                    ExecError::DependencyFailed { dependency, failure, .. } => {
                        ExecError::DependencyFailed {
                            task: record.name.clone(),
                            dependency: *dependency,
                            failure: failure.clone(),
                        }
                    }
                };
                self.finished.push_back((index, Err(propagated)));
                return None;
            }
        }

        // A second instance of the same signature inside this run parks
        // until the first one publishes.
        if self.claimed.contains(&signature) {
            self.waiters.entry(signature).or_default().push(index);
            return None;
        }

        // Engine-wide memoization with signature-level mutual exclusion; a
        // signature held by a concurrent run is parked and retried.
        match self.engine.inner.results.try_claim(signature) {
            Claim::Ready(result) => {
                self.finished.push_back((index, result));
                return None;
            }
            Claim::Busy => {
                self.parked.push(index);
                return None;
            }
            Claim::Owned => {
                self.claimed.insert(signature);
            }
        }

        if let Some(store) = &self.store {
            match store.load(signature) {
                Ok(Some(value)) => {
                    self.emitter.emit(EventKind::CacheHit, &record.name, signature);
                    self.finished.push_back((index, Ok(value)));
                    return None;
                }
                Ok(None) => {
                    self.emitter.emit(EventKind::CacheMiss, &record.name, signature);
                }
                Err(StoreError::Corruption { reason, .. }) => {
                    tracing::warn!(
                        task = %record.name,
                        %signature,
                        %reason,
                        "corrupted cache record, invalidating and recomputing"
                    );
                    if let Err(e) = store.invalidate(signature) {
                        tracing::warn!(%signature, error = %e, "failed to invalidate cache record");
                    }
                    self.emitter.emit(EventKind::CacheMiss, &record.name, signature);
                }
                Err(e) => {
                    tracing::warn!(
                        task = %record.name,
                        %signature,
                        error = %e,
                        "cache load failed, treating as miss"
                    );
                    self.emitter.emit(EventKind::CacheMiss, &record.name, signature);
                }
            }
        }

        // Substitute resolved dependency values into the frozen parameters,
        // preserving their position inside containers.
        let mut values = BTreeMap::new();
        for (name, param) in &record.params {
            values.insert(name.clone(), substitute(&param.value, &self.results));
        }

        Some(Work {
            index,
            record,
            args: TaskArgs::new(values),
            store: self.store.clone(),
            emitter: self.emitter.clone(),
        })
    }

    fn finish(&mut self, index: NodeIndex, result: Result<Value, ExecError>) {
        let signature = self.graph[index].signature;

        if self.claimed.remove(&signature) {
            match &result {
                // Cancellation is a property of the run, not of the task;
                // release the claim so a later run executes it.
                Err(ExecError::Cancelled) => self.engine.inner.results.release(signature),
                other => self.engine.inner.results.publish(signature, other.clone()),
            }
        }

        if let Some(waiting) = self.waiters.remove(&signature) {
            for waiter in waiting {
                self.finished.push_back((waiter, result.clone()));
            }
        }

        if result.is_err() && self.fail_fast {
            self.aborted = true;
        }

        self.results.insert(index, result);
        self.completed += 1;

        if let Some(dependents) = self.dependents.get(&index) {
            for &dependent in dependents {
                if let Some(count) = self.counts.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        self.ready.push_back(dependent);
                    }
                }
            }
        }
    }

    fn retry_parked(&mut self) {
        self.ready.extend(self.parked.drain(..));
    }
}

fn substitute(value: &Value, results: &HashMap<NodeIndex, Result<Value, ExecError>>) -> Value {
    match value {
        Value::Output(out) => results
            .get(&out.index())
            .and_then(|r| r.as_ref().ok())
            .cloned()
            .expect("dependency resolved before dependent"),
        Value::List(items) => Value::List(items.iter().map(|v| substitute(v, results)).collect()),
        Value::Tuple(items) => Value::Tuple(items.iter().map(|v| substitute(v, results)).collect()),
        Value::Set(items) => Value::Set(items.iter().map(|v| substitute(v, results)).collect()),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, results)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// One prepared body invocation, executed on a worker thread.
struct Work {
    index: NodeIndex,
    record: Arc<TaskRecord>,
    args: TaskArgs,
    store: Option<Arc<dyn Store>>,
    emitter: Emitter,
}

impl Work {
    fn execute(self) -> (NodeIndex, Result<Value, ExecError>) {
        // The body must observe the frame captured at construction time,
        // whatever thread it lands on.
        let _frame = crate::context::install(self.record.frame.clone());

        let signature = self.record.signature;
        let name = &self.record.name;

        self.emitter.emit(EventKind::TaskStarted, name, signature);

        let outcome = catch_unwind(AssertUnwindSafe(|| (self.record.body)(&self.args)));

        let result = match outcome {
            Ok(Ok(value)) => {
                self.emitter.emit(EventKind::TaskCompleted, name, signature);
                if let Some(store) = &self.store {
                    let meta = RecordMeta {
                        signature,
                        task: name.clone(),
                        version: self.record.version,
                    };
                    if let Err(e) = store.save(&meta, &value) {
                        tracing::warn!(
                            task = %name,
                            %signature,
                            error = %e,
                            "failed to persist output, keeping it in memory only"
                        );
                    }
                }
                Ok(value)
            }
            Ok(Err(err)) => {
                self.emitter.emit(EventKind::TaskFailed, name, signature);
                Err(ExecError::TaskFailed {
                    task: name.clone(),
                    failure: TaskFailure::from(err),
                })
            }
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("task panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("task panicked: {s}")
                } else {
                    String::from("task panicked with unknown payload")
                };
                self.emitter.emit(EventKind::TaskFailed, name, signature);
                Err(ExecError::TaskFailed {
                    task: name.clone(),
                    failure: TaskFailure::new(anyhow::anyhow!(msg)),
                })
            }
        };

        (self.index, result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use camino::Utf8Path;

    use super::*;
    use crate::context::{Context, scope};
    use crate::store::{FsStore, MemoryStore};
    use crate::task::{Param, TaskDef};
    use crate::value::Opaque;
    use crate::{Value, args};

    fn counting_add(calls: Arc<AtomicUsize>) -> TaskDef {
        TaskDef::new("add", move |args| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::from(args.int("x")? + args.int("y")?))
        })
        .param(Param::new("x"))
        .param(Param::new("y"))
    }

    fn counting_mul(calls: Arc<AtomicUsize>) -> TaskDef {
        TaskDef::new("mul", move |args| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::from(args.int("x")? * args.int("y")?))
        })
        .param(Param::new("x"))
        .param(Param::new("y"))
    }

    #[test]
    fn diamond_graph_runs_leaves_first() {
        let engine = Engine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let add = counting_add(calls.clone());
        let mul = counting_mul(calls.clone());

        let a = engine.call(&add, args![1, 2]).unwrap();
        let b = engine.call(&add, args![2, 3]).unwrap();
        let c = engine.call(&mul, args![a, b]).unwrap();

        assert_eq!(engine.run(c).unwrap(), Value::Int(15));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn results_are_memoized_per_engine() {
        let engine = Engine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let add = counting_add(calls.clone());

        let a = engine.call(&add, args![1, 2]).unwrap();
        assert_eq!(engine.run(a).unwrap(), Value::Int(3));
        assert_eq!(engine.run(a).unwrap(), Value::Int(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A second instance with the same signature shares the result.
        let b = engine.call(&add, args![y => 2, x => 1]).unwrap();
        assert_eq!(a.signature(), b.signature());
        assert_eq!(engine.run(b).unwrap(), Value::Int(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_signatures_within_one_run_execute_once() {
        let engine = Engine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let add = counting_add(calls.clone());
        let mul = counting_mul(Arc::new(AtomicUsize::new(0)));

        let a = engine.call(&add, args![1, 2]).unwrap();
        let b = engine.call(&add, args![1, 2]).unwrap();
        let c = engine.call(&mul, args![a, b]).unwrap();

        assert_eq!(engine.run(c).unwrap(), Value::Int(9));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_handles_resolve_in_place() {
        let engine = Engine::new();
        let add = counting_add(Arc::new(AtomicUsize::new(0)));

        let total = TaskDef::new("total", |args| {
            let items = args
                .expect("items")?
                .as_slice()
                .ok_or_else(|| anyhow::anyhow!("items must be a list"))?;
            let mut sum = 0;
            for item in items {
                sum += item.as_int().ok_or_else(|| anyhow::anyhow!("not an int"))?;
            }
            Ok(Value::from(sum))
        })
        .param(Param::new("items"));

        let a = engine.call(&add, args![1, 2]).unwrap();
        let b = engine.call(&add, args![3, 4]).unwrap();
        let t = engine
            .call(
                &total,
                args![Value::List(vec![Value::Output(a), Value::Int(10), Value::Output(b)])],
            )
            .unwrap();

        assert_eq!(engine.run(t).unwrap(), Value::Int(20));
    }

    #[test]
    fn failure_reaches_every_dependent_but_spares_unrelated_branches() {
        let engine = Engine::new();

        let boom = TaskDef::new("boom", |_| Err(anyhow::anyhow!("broken input")));
        let double = TaskDef::new("double", |args| Ok(Value::from(args.int("x")? * 2)))
            .param(Param::new("x"));
        let ok_calls = Arc::new(AtomicUsize::new(0));
        let add = counting_add(ok_calls.clone());

        let f = engine.call(&boom, args![]).unwrap();
        let d1 = engine.call(&double, args![f]).unwrap();
        let d2 = engine.call(&double, args![d1]).unwrap();
        let unrelated = engine.call(&add, args![1, 1]).unwrap();

        let results = engine.runner().run_all(&[d2, unrelated]);

        match &results[0] {
            Err(ExecError::DependencyFailed { task, dependency, failure }) => {
                assert_eq!(task, "double");
                // The chain reports the *original* failure, not d1's.
                assert_eq!(*dependency, f.signature());
                assert!(failure.to_string().contains("broken input"));
            }
            other => panic!("expected DependencyFailed, got {other:?}"),
        }

        assert_eq!(results[1].as_ref().unwrap(), &Value::Int(2));
        assert_eq!(ok_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fail_fast_aborts_pending_branches() {
        let engine = Engine::new();

        let boom = TaskDef::new("boom", |_| Err(anyhow::anyhow!("nope")));
        let slow = TaskDef::new("slow", |_| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Value::Null)
        });
        let after_calls = Arc::new(AtomicUsize::new(0));
        let counter = after_calls.clone();
        let after = TaskDef::new("after", move |args| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(args.expect("gate")?.clone())
        })
        .param(Param::new("gate"));

        let f = engine.call(&boom, args![]).unwrap();
        let s = engine.call(&slow, args![]).unwrap();
        let a = engine.call(&after, args![s]).unwrap();

        let results = engine.runner().fail_fast(true).run_all(&[f, a]);

        assert!(matches!(results[0], Err(ExecError::TaskFailed { .. })));
        assert!(matches!(results[1], Err(ExecError::Cancelled)));
        assert_eq!(after_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelled_token_aborts_without_poisoning_memoization() {
        let engine = Engine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let add = counting_add(calls.clone());
        let a = engine.call(&add, args![1, 2]).unwrap();

        let token = CancelToken::new();
        token.cancel();
        let result = engine.runner().cancel(token).run(a);
        assert!(matches!(result, Err(ExecError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // A later run without the token executes normally.
        assert_eq!(engine.run(a).unwrap(), Value::Int(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_body_is_captured_as_failure() {
        let engine = Engine::new();
        let bad = TaskDef::new("bad", |_| panic!("ouch"));
        let out = engine.call(&bad, args![]).unwrap();

        match engine.run(out) {
            Err(ExecError::TaskFailed { failure, .. }) => {
                assert!(failure.to_string().contains("ouch"));
            }
            other => panic!("expected TaskFailed, got {other:?}"),
        }
    }

    #[test]
    fn bodies_observe_the_construction_time_frame() {
        let engine = Engine::new();

        // The body reads the ambient context directly; the worker must have
        // the construction-time frame installed for this to resolve.
        // The tag parameter contributes to the signature, keeping the two
        // instances distinct even though the body ignores it.
        let probe = TaskDef::new("probe", |_| {
            Ok(Context::current().get("x").cloned().unwrap_or(Value::Null))
        })
        .param(Param::new("tag"));

        let (outer, inner) = {
            let _outer = scope([("x", Value::Int(1))]);
            let outer = engine.call(&probe, args![tag => "outer"]).unwrap();
            let inner = {
                let _inner = scope([("x", Value::Int(2))]);
                engine.call(&probe, args![tag => "inner"]).unwrap()
            };
            (outer, inner)
        };

        // Execution order is irrelevant; each sees its captured frame.
        let results = engine.runner().run_all(&[inner, outer]);
        assert_eq!(results[0].as_ref().unwrap(), &Value::Int(2));
        assert_eq!(results[1].as_ref().unwrap(), &Value::Int(1));
    }

    #[test]
    fn injected_parameters_resolve_per_construction_scope() {
        let engine = Engine::new();
        let probe = TaskDef::new("probe_injected", |args| Ok(args.expect("x")?.clone()))
            .param(Param::new("x").injected())
            .param(Param::new("tag").ignored());

        let _outer = scope([("x", Value::Int(1))]);
        let outer = engine.call(&probe, args![tag => "outer"]).unwrap();
        let inner = {
            let _inner = scope([("x", Value::Int(2))]);
            engine.call(&probe, args![tag => "inner"]).unwrap()
        };

        let results = engine.runner().run_all(&[outer, inner]);
        assert_eq!(results[0].as_ref().unwrap(), &Value::Int(1));
        assert_eq!(results[1].as_ref().unwrap(), &Value::Int(2));
    }

    #[test]
    fn persisted_runs_skip_bodies_and_corruption_recomputes() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();

        let calls = Arc::new(AtomicUsize::new(0));
        let wire = |engine: &Engine, calls: &Arc<AtomicUsize>| {
            let add = counting_add(calls.clone());
            let mul = counting_mul(calls.clone());
            let a = engine.call(&add, args![1, 2]).unwrap();
            let b = engine.call(&add, args![2, 3]).unwrap();
            engine.call(&mul, args![a, b]).unwrap()
        };

        // First run computes and persists three records.
        let engine = Engine::with_store(Arc::new(FsStore::new(&root)));
        let c = wire(&engine, &calls);
        assert_eq!(engine.run(c).unwrap(), Value::Int(15));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // A fresh engine (no in-memory state) resolves purely from disk.
        let engine = Engine::with_store(Arc::new(FsStore::new(&root)));
        let c = wire(&engine, &calls);
        let hits = Arc::new(AtomicUsize::new(0));
        let hit_counter = hits.clone();
        let result = engine
            .runner()
            .subscribe(move |event| {
                if event.kind == EventKind::CacheHit {
                    hit_counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .run(c);
        assert_eq!(result.unwrap(), Value::Int(15));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        // Corrupt exactly one record; only that task recomputes, and the
        // record is rewritten.
        let victim = root.join(c.signature().to_hex()).with_extension("bin");
        std::fs::write(&victim, b"garbage").unwrap();

        let engine = Engine::with_store(Arc::new(FsStore::new(&root)));
        let c = wire(&engine, &calls);
        assert_eq!(engine.run(c).unwrap(), Value::Int(15));
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let store = FsStore::new(&root);
        assert_eq!(store.load(c.signature()).unwrap(), Some(Value::Int(15)));
    }

    #[test]
    fn unserializable_outputs_fall_back_to_memory() {
        let engine = Engine::new();
        let store = Arc::new(MemoryStore::new());
        engine.set_store(Some(store.clone()));

        let produce = TaskDef::new("produce", |_| Ok(Value::Opaque(Opaque::new(41i64))));
        let consume = TaskDef::new("consume", |args| {
            let opaque = args
                .expect("model")?
                .as_opaque()
                .ok_or_else(|| anyhow::anyhow!("expected an opaque payload"))?;
            let n = opaque
                .downcast_ref::<i64>()
                .ok_or_else(|| anyhow::anyhow!("wrong payload type"))?;
            Ok(Value::from(n + 1))
        })
        .param(Param::new("model").ignored());

        let p = engine.call(&produce, args![]).unwrap();
        let c = engine.call(&consume, args![p]).unwrap();

        assert_eq!(engine.run(c).unwrap(), Value::Int(42));
        // The opaque producer was not persisted; the consumer was.
        assert!(!store.exists(p.signature()).unwrap());
        assert!(store.exists(c.signature()).unwrap());
    }

    #[test]
    fn lifecycle_events_fire_in_order() {
        let engine = Engine::new();
        engine.set_store(Some(Arc::new(MemoryStore::new())));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.subscribe(move |event| {
            sink.lock().unwrap().push(event.kind);
        });

        let add = counting_add(Arc::new(AtomicUsize::new(0)));
        let a = engine.call(&add, args![1, 2]).unwrap();
        engine.run(a).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::CacheMiss, EventKind::TaskStarted, EventKind::TaskCompleted],
        );
    }

    #[test]
    fn failed_events_fire_for_raising_bodies() {
        let engine = Engine::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let boom = TaskDef::new("boom", |_| Err(anyhow::anyhow!("nope")));
        let f = engine.call(&boom, args![]).unwrap();

        let _ = engine
            .runner()
            .subscribe(move |event| sink.lock().unwrap().push(event.kind))
            .run(f);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::TaskStarted, EventKind::TaskFailed],
        );
    }

    #[test]
    fn cancel_after_fires_the_token() {
        let token = CancelToken::new();
        token.cancel_after(Duration::from_millis(20));
        assert!(!token.is_cancelled());
        std::thread::sleep(Duration::from_millis(100));
        assert!(token.is_cancelled());
    }
}
