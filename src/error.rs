use std::sync::Arc;

use thiserror::Error;

use crate::hash::Signature;

/// A clonable wrapper around a userland task failure.
///
/// Task bodies return [`anyhow::Result`], but a single failure may have to
/// reach many dependents, so the underlying error is shared behind an `Arc`.
#[derive(Debug, Error, Clone)]
#[error(transparent)]
pub struct TaskFailure(#[from] pub(crate) Arc<anyhow::Error>);

impl TaskFailure {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for TaskFailure {
    fn from(e: anyhow::Error) -> Self {
        TaskFailure(Arc::new(e))
    }
}

/// A value with no canonical hash encoding was fed to the signature hasher.
#[derive(Debug, Error, Clone)]
#[error("value of type `{type_name}` has no canonical hash")]
pub struct UnhashableValue {
    pub type_name: &'static str,
}

/// Errors raised while constructing a task instance.
///
/// These surface immediately from [`Engine::call`](crate::Engine::call) and
/// prevent the output handle from being created.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("cannot bind call arguments for task '{task}': {reason}")]
    Bind { task: String, reason: String },

    #[error("task '{task}': required injectable parameter '{name}' is absent from the active context")]
    MissingInjectable { task: String, name: String },

    #[error("task '{task}': parameter '{param}' cannot contribute to the signature: {source}")]
    Unhashable {
        task: String,
        param: String,
        source: UnhashableValue,
    },
}

/// Errors raised while executing a task graph.
///
/// Execution failures attach to the offending output handle and are carried
/// to every dependent, so the whole enum is `Clone`.
#[derive(Debug, Error, Clone)]
pub enum ExecError {
    /// The task body returned an error or panicked.
    #[error("task '{task}' failed: {failure}")]
    TaskFailed { task: String, failure: TaskFailure },

    /// A prerequisite failed; the body was never invoked. Carries the
    /// signature of the originally failing task together with its failure.
    #[error("task '{task}' skipped: dependency {dependency} failed: {failure}")]
    DependencyFailed {
        task: String,
        dependency: Signature,
        failure: TaskFailure,
    },

    /// The run was aborted through its cancellation token or by fail-fast.
    #[error("run cancelled")]
    Cancelled,

    /// The task graph contains a cycle. Unreachable through the public API,
    /// detected defensively before scheduling.
    #[error("cycle detected in task graph")]
    CycleDetected,
}

/// Errors raised by a persistence [`Store`](crate::Store).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record header or payload failed validation.
    #[error("cache record {signature} is corrupted: {reason}")]
    Corruption { signature: Signature, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The value has no serialized form (opaque payloads, task handles).
    #[error("value cannot be serialized: {0}")]
    Unserializable(String),

    #[error("failed to decode cached value: {0}")]
    Decode(String),
}
