#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod context;
mod engine;
mod error;
mod events;
mod executor;
mod hash;
mod store;
mod task;
mod utils;
mod value;

pub use crate::context::{Context, Scope, scope};
pub use crate::engine::{Engine, Output};
pub use crate::error::{CallError, ExecError, StoreError, TaskFailure, UnhashableValue};
pub use crate::events::{Event, EventKind};
pub use crate::executor::{CancelToken, Runner};
pub use crate::hash::Signature;
pub use crate::store::{
    BinarySerializer, ENV_CACHE, ENV_CACHE_DIR, FsStore, JsonSerializer, MemoryStore, RecordMeta,
    Serializer, Store,
};
pub use crate::task::{CallArgs, Param, TaskArgs, TaskDef, TaskResult};
pub use crate::utils::init_logging;
pub use crate::value::{Key, Opaque, Value};
