use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::Context;
use crate::engine::Output;
use crate::error::CallError;
use crate::hash::{Signature, SignatureBuilder};
use crate::value::Value;

/// Result type returned by task bodies.
pub type TaskResult = anyhow::Result<Value>;

/// Task body function, shared between the declaration and every instance.
pub(crate) type Body = Arc<dyn Fn(&TaskArgs) -> TaskResult + Send + Sync>;

/// A declared parameter.
///
/// Every parameter starts plain: it participates in both execution and the
/// signature. The chainable markers change that classification:
///
/// * [`injected`](Param::injected) — when the caller supplies no value, the
///   parameter is resolved by name from the active [`Context`] at
///   construction time. Without a default, an unresolvable injectable fails
///   the call.
/// * [`ignored`](Param::ignored) — the body still sees the value, but it
///   contributes nothing to the signature. A parameter may be both injected
///   and ignored.
#[derive(Debug, Clone)]
pub struct Param {
    pub(crate) name: String,
    pub(crate) injectable: bool,
    pub(crate) ignored: bool,
    pub(crate) default: Option<Value>,
}

impl Param {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            injectable: false,
            ignored: false,
            default: None,
        }
    }

    /// Marks the parameter as sourced from the active context.
    pub fn injected(mut self) -> Self {
        self.injectable = true;
        self
    }

    /// Excludes the parameter from the signature.
    pub fn ignored(mut self) -> Self {
        self.ignored = true;
        self
    }

    /// Supplies a default used when neither the caller nor the context
    /// provides a value.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// A task declaration: name, version, parameter table and body.
///
/// Declarations are cheap to clone and reusable; each invocation through
/// [`Engine::call`](crate::Engine::call) produces an immutable task instance
/// with its own signature and output handle.
///
/// ```
/// use purple_titanium::{Param, TaskDef, Value};
///
/// let add = TaskDef::new("add", |args| {
///     Ok(Value::from(args.int("x")? + args.int("y")?))
/// })
/// .param(Param::new("x"))
/// .param(Param::new("y"));
/// # let _ = add;
/// ```
#[derive(Clone)]
pub struct TaskDef {
    pub(crate) name: String,
    pub(crate) version: u64,
    pub(crate) params: Vec<Param>,
    pub(crate) body: Body,
}

impl TaskDef {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&TaskArgs) -> TaskResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            version: 1,
            params: Vec::new(),
            body: Arc::new(body),
        }
    }

    /// Sets the declared version. Bumping it invalidates every cached
    /// result of this task and of all dependents.
    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Appends a parameter to the declaration. Positional arguments bind in
    /// declaration order.
    pub fn param(mut self, param: Param) -> Self {
        debug_assert!(
            !self.params.iter().any(|p| p.name == param.name),
            "duplicate parameter '{}' in task '{}'",
            param.name,
            self.name,
        );
        self.params.push(param);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn bind_error(&self, reason: impl Into<String>) -> CallError {
        CallError::Bind {
            task: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Binds call arguments onto the parameter table, pulling injectables
    /// from `frame` and applying defaults, then freezes the result.
    pub(crate) fn resolve(
        &self,
        call: CallArgs,
        frame: &Context,
    ) -> Result<BTreeMap<String, BoundParam>, CallError> {
        if call.positional.len() > self.params.len() {
            return Err(self.bind_error(format!(
                "takes at most {} arguments, {} given",
                self.params.len(),
                call.positional.len(),
            )));
        }

        let mut bound: BTreeMap<String, Value> = BTreeMap::new();

        for (param, value) in self.params.iter().zip(call.positional) {
            bound.insert(param.name.clone(), value);
        }

        for (name, value) in call.keywords {
            if !self.params.iter().any(|p| p.name == name) {
                return Err(self.bind_error(format!("unknown parameter '{name}'")));
            }
            if bound.insert(name.clone(), value).is_some() {
                return Err(self.bind_error(format!("parameter '{name}' bound twice")));
            }
        }

        let mut frozen = BTreeMap::new();
        for param in &self.params {
            let value = match bound.remove(&param.name) {
                // An explicit caller value always wins, injectable or not.
                Some(value) => value,
                None if param.injectable => match frame.get(&param.name) {
                    Some(value) => value.clone(),
                    None => match &param.default {
                        Some(default) => default.clone(),
                        None => {
                            return Err(CallError::MissingInjectable {
                                task: self.name.clone(),
                                name: param.name.clone(),
                            });
                        }
                    },
                },
                None => match &param.default {
                    Some(default) => default.clone(),
                    None => {
                        return Err(
                            self.bind_error(format!("missing required parameter '{}'", param.name))
                        );
                    }
                },
            };

            frozen.insert(
                param.name.clone(),
                BoundParam {
                    value,
                    contributes: !param.ignored,
                },
            );
        }

        Ok(frozen)
    }
}

impl std::fmt::Debug for TaskDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDef")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// A parameter after resolution: the frozen value plus whether it feeds the
/// signature (ignored parameters are executed with but skipped when hashing).
#[derive(Debug, Clone)]
pub(crate) struct BoundParam {
    pub(crate) value: Value,
    pub(crate) contributes: bool,
}

/// An immutable task instance stored in the engine graph.
pub(crate) struct TaskRecord {
    pub(crate) name: String,
    pub(crate) version: u64,
    pub(crate) params: BTreeMap<String, BoundParam>,
    pub(crate) deps: Vec<Output>,
    pub(crate) signature: Signature,
    pub(crate) body: Body,
    pub(crate) frame: Arc<Context>,
}

impl TaskRecord {
    /// Builds the instance from a declaration and already-frozen parameters.
    pub(crate) fn new(
        def: &TaskDef,
        params: BTreeMap<String, BoundParam>,
        frame: Arc<Context>,
    ) -> Result<Self, CallError> {
        let mut builder = SignatureBuilder::new(&def.name, def.version);
        for (name, param) in &params {
            if !param.contributes {
                continue;
            }
            builder.param(name, &param.value).map_err(|source| CallError::Unhashable {
                task: def.name.clone(),
                param: name.clone(),
                source,
            })?;
        }
        let signature = builder.finish();

        let mut deps = Vec::new();
        for param in params.values() {
            collect_outputs(&param.value, &mut deps);
        }

        Ok(Self {
            name: def.name.clone(),
            version: def.version,
            params,
            deps,
            signature,
            body: def.body.clone(),
            frame,
        })
    }
}

impl std::fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRecord")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("signature", &self.signature)
            .field("deps", &self.deps.len())
            .finish_non_exhaustive()
    }
}

/// Collects every output handle reachable through containers, preserving
/// discovery order and deduplicating diamond references.
fn collect_outputs(value: &Value, acc: &mut Vec<Output>) {
    match value {
        Value::Output(out) => {
            if !acc.contains(out) {
                acc.push(*out);
            }
        }
        Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
            for item in items {
                collect_outputs(item, acc);
            }
        }
        Value::Map(map) => {
            for item in map.values() {
                collect_outputs(item, acc);
            }
        }
        _ => {}
    }
}

/// Call-site arguments: positionals bind to parameters in declaration order,
/// keywords by name. Usually built with the [`args!`](crate::args) macro.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub(crate) positional: Vec<Value>,
    pub(crate) keywords: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pos(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kw(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keywords.push((name.into(), value.into()));
        self
    }
}

/// Builds [`CallArgs`] from positional and `name => value` keyword entries.
///
/// ```
/// use purple_titanium::args;
///
/// let a = args![1, 2];
/// let b = args![1, y => 2];
/// let c = args![x => 1, y => 2];
/// # let _ = (a, b, c);
/// ```
#[macro_export]
macro_rules! args {
    (@acc $acc:expr $(,)?) => { $acc };
    (@acc $acc:expr, $name:ident => $value:expr $(, $($rest:tt)*)?) => {
        $crate::args!(@acc $acc.kw(stringify!($name), $crate::Value::from($value)) $(, $($rest)*)?)
    };
    (@acc $acc:expr, $value:expr $(, $($rest:tt)*)?) => {
        $crate::args!(@acc $acc.pos($crate::Value::from($value)) $(, $($rest)*)?)
    };
    () => { $crate::CallArgs::new() };
    ($($rest:tt)+) => { $crate::args!(@acc $crate::CallArgs::new(), $($rest)+) };
}

/// The fully resolved arguments a task body executes with.
///
/// Dependency handles have been substituted with their computed values;
/// ignored parameters are present with the value the caller supplied.
#[derive(Debug, Clone)]
pub struct TaskArgs {
    values: BTreeMap<String, Value>,
}

impl TaskArgs {
    pub(crate) fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// The resolved value, or an error naming the missing parameter.
    pub fn expect(&self, name: &str) -> anyhow::Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("no parameter named '{name}'"))
    }

    pub fn int(&self, name: &str) -> anyhow::Result<i64> {
        self.expect(name)?
            .as_int()
            .ok_or_else(|| anyhow::anyhow!("parameter '{name}' is not an integer"))
    }

    pub fn float(&self, name: &str) -> anyhow::Result<f64> {
        self.expect(name)?
            .as_float()
            .ok_or_else(|| anyhow::anyhow!("parameter '{name}' is not a float"))
    }

    pub fn text(&self, name: &str) -> anyhow::Result<&str> {
        self.expect(name)?
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("parameter '{name}' is not a string"))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::scope;
    use crate::error::CallError;

    fn noop() -> TaskDef {
        TaskDef::new("noop", |_| Ok(Value::Null))
    }

    fn resolve(def: &TaskDef, call: CallArgs) -> Result<BTreeMap<String, BoundParam>, CallError> {
        def.resolve(call, &Context::current())
    }

    #[test]
    fn positional_and_keyword_binding_agree() {
        let def = noop().param(Param::new("x")).param(Param::new("y"));

        let a = resolve(&def, args![1, 2]).unwrap();
        let b = resolve(&def, args![y => 2, x => 1]).unwrap();

        assert_eq!(a["x"].value, Value::Int(1));
        assert_eq!(a["y"].value, Value::Int(2));
        assert_eq!(b["x"].value, Value::Int(1));
        assert_eq!(b["y"].value, Value::Int(2));
    }

    #[test]
    fn defaults_fill_unbound_parameters() {
        let def = noop().param(Param::new("x")).param(Param::new("z").default(0));

        let params = resolve(&def, args![5]).unwrap();
        assert_eq!(params["z"].value, Value::Int(0));
    }

    #[test]
    fn bind_errors() {
        let def = noop().param(Param::new("x"));

        assert!(matches!(resolve(&def, args![1, 2]), Err(CallError::Bind { .. })));
        assert!(matches!(resolve(&def, args![q => 1]), Err(CallError::Bind { .. })));
        assert!(matches!(resolve(&def, args![1, x => 1]), Err(CallError::Bind { .. })));
        assert!(matches!(resolve(&def, args![]), Err(CallError::Bind { .. })));
    }

    #[test]
    fn injectable_resolution_order() {
        let def = noop().param(Param::new("timeout").injected());

        // No context binding, no default, no caller value.
        assert!(matches!(
            resolve(&def, args![]),
            Err(CallError::MissingInjectable { .. }),
        ));

        // Context supplies the value.
        {
            let _scope = scope([("timeout", Value::Int(30))]);
            let params = resolve(&def, args![]).unwrap();
            assert_eq!(params["timeout"].value, Value::Int(30));
        }

        // An explicit caller value beats the context.
        {
            let _scope = scope([("timeout", Value::Int(30))]);
            let params = resolve(&def, args![timeout => 5]).unwrap();
            assert_eq!(params["timeout"].value, Value::Int(5));
        }
    }

    #[test]
    fn injectable_default_applies_when_context_is_silent() {
        let def = noop().param(Param::new("retries").injected().default(3));

        let params = resolve(&def, args![]).unwrap();
        assert_eq!(params["retries"].value, Value::Int(3));

        let _scope = scope([("retries", Value::Int(7))]);
        let params = resolve(&def, args![]).unwrap();
        assert_eq!(params["retries"].value, Value::Int(7));
    }

    #[test]
    fn ignored_parameters_do_not_contribute() {
        let def = noop()
            .param(Param::new("data"))
            .param(Param::new("device").ignored().default("cuda"));

        let params = resolve(&def, args![1]).unwrap();
        assert!(params["data"].contributes);
        assert!(!params["device"].contributes);
        assert_eq!(params["device"].value, Value::Str("cuda".into()));
    }

    #[test]
    fn injected_and_ignored_parameters_resolve_but_skip_the_signature() {
        let def = noop()
            .param(Param::new("data"))
            .param(Param::new("trace").injected().ignored());

        let _scope = scope([("trace", Value::Bool(true))]);
        let params = resolve(&def, args![1]).unwrap();
        assert_eq!(params["trace"].value, Value::Bool(true));
        assert!(!params["trace"].contributes);
    }

    #[test]
    fn nested_outputs_become_dependencies() {
        let a = Output::fake(0, 11);
        let b = Output::fake(1, 22);

        let value = Value::Map(
            [
                (crate::Key::from("first"), Value::List(vec![Value::Output(a)])),
                (crate::Key::from("second"), Value::Tuple(vec![Value::Output(b), Value::Output(a)])),
            ]
            .into_iter()
            .collect(),
        );

        let mut deps = Vec::new();
        collect_outputs(&value, &mut deps);
        assert_eq!(deps, vec![a, b]);
    }
}
