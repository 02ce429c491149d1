use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::hash::Signature;
use crate::value::{Key, Value};

/// Magic bytes opening every persisted record.
const MAGIC: &[u8; 4] = b"PT01";

/// Environment variable naming the cache root directory.
pub const ENV_CACHE_DIR: &str = "PT_CACHE_DIR";
/// Environment variable toggling persistence; `0`, `false` or `off` disable it.
pub const ENV_CACHE: &str = "PT_CACHE";

/// Identifying header data stored alongside a record.
///
/// The signature alone addresses the content; the task name and version are
/// informational, useful when inspecting a cache directory by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub signature: Signature,
    pub task: String,
    pub version: u64,
}

/// Content-addressed persistence for task outputs, keyed by signature.
///
/// Implementations must be safe to share across runner threads; the
/// scheduler guarantees at most one in-flight save per signature.
pub trait Store: Send + Sync {
    fn save(&self, meta: &RecordMeta, value: &Value) -> Result<(), StoreError>;

    /// `Ok(None)` is a miss; corruption and I/O problems are errors so the
    /// caller can decide between invalidation and fallback.
    fn load(&self, signature: Signature) -> Result<Option<Value>, StoreError>;

    fn exists(&self, signature: Signature) -> Result<bool, StoreError>;

    fn invalidate(&self, signature: Signature) -> Result<(), StoreError>;

    fn invalidate_all(&self) -> Result<(), StoreError>;
}

// ******************************
// *        Serializers         *
// ******************************

/// The serialized mirror of [`Value`].
///
/// Opaque payloads and task handles have no wire form; converting a value
/// containing either fails, which the executor downgrades to an
/// in-memory-only result.
#[derive(Debug, Serialize, Deserialize)]
enum Wire {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Wire>),
    Tuple(Vec<Wire>),
    Map(Vec<(Key, Wire)>),
    Set(Vec<Wire>),
}

fn to_wire(value: &Value) -> Result<Wire, StoreError> {
    Ok(match value {
        Value::Null => Wire::Null,
        Value::Bool(b) => Wire::Bool(*b),
        Value::Int(n) => Wire::Int(*n),
        Value::Float(f) => Wire::Float(*f),
        Value::Str(s) => Wire::Str(s.clone()),
        Value::List(items) => Wire::List(to_wire_seq(items)?),
        Value::Tuple(items) => Wire::Tuple(to_wire_seq(items)?),
        Value::Set(items) => Wire::Set(to_wire_seq(items)?),
        Value::Map(map) => Wire::Map(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), to_wire(v)?)))
                .collect::<Result<_, StoreError>>()?,
        ),
        Value::Output(_) => {
            return Err(StoreError::Unserializable(
                "task output handles cannot be persisted".to_string(),
            ));
        }
        Value::Opaque(op) => {
            return Err(StoreError::Unserializable(format!(
                "opaque payload of type `{}` cannot be persisted",
                op.type_name(),
            )));
        }
    })
}

fn to_wire_seq(items: &[Value]) -> Result<Vec<Wire>, StoreError> {
    items.iter().map(to_wire).collect()
}

fn from_wire(wire: Wire) -> Value {
    match wire {
        Wire::Null => Value::Null,
        Wire::Bool(b) => Value::Bool(b),
        Wire::Int(n) => Value::Int(n),
        Wire::Float(f) => Value::Float(f),
        Wire::Str(s) => Value::Str(s),
        Wire::List(items) => Value::List(items.into_iter().map(from_wire).collect()),
        Wire::Tuple(items) => Value::Tuple(items.into_iter().map(from_wire).collect()),
        Wire::Set(items) => Value::Set(items.into_iter().map(from_wire).collect()),
        Wire::Map(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k, from_wire(v)))
                .collect::<BTreeMap<Key, Value>>(),
        ),
    }
}

/// Pluggable value codec used by the persistence backends.
pub trait Serializer: Send + Sync {
    /// The 1-byte format tag written into record headers.
    fn format_tag(&self) -> u8;

    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>, StoreError>;

    fn from_bytes(&self, bytes: &[u8]) -> Result<Value, StoreError>;
}

/// Human-readable JSON encoding, format tag 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn format_tag(&self) -> u8 {
        0
    }

    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>, StoreError> {
        let wire = to_wire(value)?;
        serde_json::to_vec(&wire).map_err(|e| StoreError::Unserializable(e.to_string()))
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Value, StoreError> {
        let wire: Wire =
            serde_json::from_slice(bytes).map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(from_wire(wire))
    }
}

/// Compact binary encoding, format tag 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinarySerializer;

impl Serializer for BinarySerializer {
    fn format_tag(&self) -> u8 {
        1
    }

    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>, StoreError> {
        let wire = to_wire(value)?;
        bincode::serialize(&wire).map_err(|e| StoreError::Unserializable(e.to_string()))
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Value, StoreError> {
        let wire: Wire =
            bincode::deserialize(bytes).map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(from_wire(wire))
    }
}

// ******************************
// *      Record encoding       *
// ******************************

fn encode_record(
    meta: &RecordMeta,
    serializer: &dyn Serializer,
    value: &Value,
) -> Result<Vec<u8>, StoreError> {
    let payload = serializer.to_bytes(value)?;
    let mut buf = Vec::with_capacity(4 + 1 + 8 + meta.task.len() + 8 + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.push(serializer.format_tag());
    buf.extend_from_slice(&(meta.task.len() as u64).to_le_bytes());
    buf.extend_from_slice(meta.task.as_bytes());
    buf.extend_from_slice(&meta.version.to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

fn decode_record(
    signature: Signature,
    serializer: &dyn Serializer,
    bytes: &[u8],
) -> Result<Value, StoreError> {
    let corrupt = |reason: &str| StoreError::Corruption {
        signature,
        reason: reason.to_string(),
    };

    if bytes.len() < 4 + 1 + 8 {
        return Err(corrupt("record shorter than its header"));
    }
    if &bytes[..4] != MAGIC {
        return Err(corrupt("unknown magic bytes"));
    }
    let tag = bytes[4];
    if tag != serializer.format_tag() {
        return Err(corrupt("format tag does not match the configured serializer"));
    }

    let name_len = u64::from_le_bytes(bytes[5..13].try_into().unwrap()) as usize;
    let payload_at = 13usize
        .checked_add(name_len)
        .and_then(|n| n.checked_add(8))
        .ok_or_else(|| corrupt("task name length overflows the record"))?;
    if bytes.len() < payload_at {
        return Err(corrupt("task name length overflows the record"));
    }
    std::str::from_utf8(&bytes[13..13 + name_len])
        .map_err(|_| corrupt("task name is not valid UTF-8"))?;

    serializer
        .from_bytes(&bytes[payload_at..])
        .map_err(|e| match e {
            StoreError::Decode(reason) => StoreError::Corruption { signature, reason },
            other => other,
        })
}

// ******************************
// *         Backends           *
// ******************************

/// Filesystem persistence: one record file per signature, named by the hex
/// signature, under a root directory.
pub struct FsStore {
    root: Utf8PathBuf,
    serializer: Arc<dyn Serializer>,
}

impl FsStore {
    /// A store rooted at `root` with the default JSON serializer.
    pub fn new(root: impl AsRef<Utf8Path>) -> Self {
        Self::with_serializer(root, Arc::new(JsonSerializer))
    }

    pub fn with_serializer(root: impl AsRef<Utf8Path>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            root: root.as_ref().to_owned(),
            serializer,
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path_for(&self, signature: Signature) -> Utf8PathBuf {
        self.root.join(signature.to_hex()).with_extension("bin")
    }
}

impl Store for FsStore {
    fn save(&self, meta: &RecordMeta, value: &Value) -> Result<(), StoreError> {
        let bytes = encode_record(meta, self.serializer.as_ref(), value)?;
        fs::create_dir_all(&self.root)?;
        fs::write(self.path_for(meta.signature), bytes)?;
        Ok(())
    }

    fn load(&self, signature: Signature) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(signature);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode_record(signature, self.serializer.as_ref(), &bytes).map(Some)
    }

    fn exists(&self, signature: Signature) -> Result<bool, StoreError> {
        Ok(self.path_for(signature).exists())
    }

    fn invalidate(&self, signature: Signature) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(signature)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn invalidate_all(&self) -> Result<(), StoreError> {
        if !self.root.exists() {
            return Ok(());
        }
        for entry in self.root.read_dir_utf8()? {
            let entry = entry?;
            if entry.path().extension() == Some("bin") {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// In-memory persistence backend.
///
/// Records still pass through the configured serializer, so this backend
/// exercises the same encode/decode paths as [`FsStore`]; useful in tests
/// and for ephemeral single-process runs.
pub struct MemoryStore {
    records: Mutex<HashMap<Signature, Vec<u8>>>,
    serializer: Arc<dyn Serializer>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_serializer(Arc::new(JsonSerializer))
    }

    pub fn with_serializer(serializer: Arc<dyn Serializer>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            serializer,
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn save(&self, meta: &RecordMeta, value: &Value) -> Result<(), StoreError> {
        let bytes = encode_record(meta, self.serializer.as_ref(), value)?;
        self.records.lock().unwrap().insert(meta.signature, bytes);
        Ok(())
    }

    fn load(&self, signature: Signature) -> Result<Option<Value>, StoreError> {
        let bytes = match self.records.lock().unwrap().get(&signature) {
            Some(bytes) => bytes.clone(),
            None => return Ok(None),
        };
        decode_record(signature, self.serializer.as_ref(), &bytes).map(Some)
    }

    fn exists(&self, signature: Signature) -> Result<bool, StoreError> {
        Ok(self.records.lock().unwrap().contains_key(&signature))
    }

    fn invalidate(&self, signature: Signature) -> Result<(), StoreError> {
        self.records.lock().unwrap().remove(&signature);
        Ok(())
    }

    fn invalidate_all(&self) -> Result<(), StoreError> {
        self.records.lock().unwrap().clear();
        Ok(())
    }
}

/// Builds a store from the environment: `PT_CACHE_DIR` names the root and
/// `PT_CACHE=0|false|off` disables persistence entirely.
pub(crate) fn from_env() -> Option<Arc<dyn Store>> {
    if let Ok(toggle) = std::env::var(ENV_CACHE) {
        let toggle = toggle.to_ascii_lowercase();
        if toggle == "0" || toggle == "false" || toggle == "off" {
            return None;
        }
    }
    let root = std::env::var(ENV_CACHE_DIR).ok()?;
    Some(Arc::new(FsStore::new(Utf8PathBuf::from(root))))
}
