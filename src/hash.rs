use serde::{Deserialize, Serialize};

use crate::error::UnhashableValue;
use crate::value::{Key, Value};

/// A 64-bit deterministic fingerprint identifying a task instance.
///
/// Signatures depend only on the task's name, version, contributing
/// parameters and, transitively, on its dependencies' signatures. They are
/// stable across threads, processes and argument order, which makes them
/// usable as content-addressed cache keys.
///
/// All integer encodings feeding the hash are little-endian; floats hash as
/// their IEEE-754 bit pattern.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(pub(crate) u64);

impl Signature {
    /// The zero-padded lowercase hex form, used for on-disk record names.
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

// One leading tag byte per hashed value keeps different kinds with identical
// payload bytes from colliding (e.g. 1i64 vs "1").
const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STR: u8 = 0x04;
const TAG_SEQ: u8 = 0x05;
const TAG_MAP: u8 = 0x06;
const TAG_SET: u8 = 0x07;
const TAG_OUTPUT: u8 = 0x08;

const SEQ_KIND_LIST: u8 = 0x00;
const SEQ_KIND_TUPLE: u8 = 0x01;

/// Incremental 64-bit hasher over byte chunks, backed by blake3.
#[derive(Default)]
pub(crate) struct SigHasher(blake3::Hasher);

impl SigHasher {
    pub(crate) fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn write_u64(&mut self, n: u64) {
        self.write(&n.to_le_bytes());
    }

    pub(crate) fn finish(&self) -> Signature {
        let mut out = [0u8; 8];
        self.0.finalize_xof().fill(&mut out);
        Signature(u64::from_le_bytes(out))
    }

    /// Feeds one value's canonical chunk sequence.
    pub(crate) fn write_value(&mut self, value: &Value) -> Result<(), UnhashableValue> {
        match value {
            Value::Null => self.write(&[TAG_NULL]),
            Value::Bool(b) => {
                self.write(&[TAG_BOOL, *b as u8]);
            }
            Value::Int(n) => {
                self.write(&[TAG_INT]);
                self.write(&n.to_le_bytes());
            }
            Value::Float(f) => {
                self.write(&[TAG_FLOAT]);
                self.write(&f.to_bits().to_le_bytes());
            }
            Value::Str(s) => self.write_str(TAG_STR, s),
            Value::List(items) => self.write_seq(SEQ_KIND_LIST, items)?,
            Value::Tuple(items) => self.write_seq(SEQ_KIND_TUPLE, items)?,
            Value::Map(map) => {
                self.write(&[TAG_MAP]);
                // BTreeMap iterates keys in canonical-form order already.
                for (key, val) in map {
                    self.write_u64(hash_key(key).0);
                    self.write_u64(hash_value(val)?.0);
                }
            }
            Value::Set(items) => {
                self.write(&[TAG_SET]);
                let mut hashes: Vec<u64> =
                    items.iter().map(|v| hash_value(v).map(|h| h.0)).collect::<Result<_, _>>()?;
                hashes.sort_unstable();
                hashes.dedup();
                self.write_u64(hashes.len() as u64);
                for h in hashes {
                    self.write_u64(h);
                }
            }
            Value::Output(out) => {
                self.write(&[TAG_OUTPUT]);
                self.write_u64(out.signature().0);
            }
            Value::Opaque(op) => {
                return Err(UnhashableValue {
                    type_name: op.type_name(),
                });
            }
        }
        Ok(())
    }

    fn write_str(&mut self, tag: u8, s: &str) {
        self.write(&[tag]);
        self.write_u64(s.len() as u64);
        self.write(s.as_bytes());
    }

    fn write_seq(&mut self, kind: u8, items: &[Value]) -> Result<(), UnhashableValue> {
        self.write(&[TAG_SEQ, kind]);
        self.write_u64(items.len() as u64);
        for item in items {
            self.write_value(item)?;
        }
        Ok(())
    }
}

/// Hashes a single value in isolation.
pub(crate) fn hash_value(value: &Value) -> Result<Signature, UnhashableValue> {
    let mut hasher = SigHasher::default();
    hasher.write_value(value)?;
    Ok(hasher.finish())
}

fn hash_key(key: &Key) -> Signature {
    let mut hasher = SigHasher::default();
    match key {
        Key::Bool(b) => hasher.write(&[TAG_BOOL, *b as u8]),
        Key::Int(n) => {
            hasher.write(&[TAG_INT]);
            hasher.write(&n.to_le_bytes());
        }
        Key::Str(s) => hasher.write_str(TAG_STR, s),
    }
    hasher.finish()
}

/// Accumulates a task's identity into its signature.
///
/// Contributions must be fed in lexicographic parameter-name order; the
/// caller iterates its frozen parameter map, which already guarantees this.
pub(crate) struct SignatureBuilder {
    hasher: SigHasher,
}

impl SignatureBuilder {
    pub(crate) fn new(name: &str, version: u64) -> Self {
        let mut hasher = SigHasher::default();
        hasher.write_str(TAG_STR, name);
        hasher.write_u64(version);
        Self { hasher }
    }

    pub(crate) fn param(&mut self, name: &str, value: &Value) -> Result<(), UnhashableValue> {
        self.hasher.write_str(TAG_STR, name);
        self.hasher.write_value(value)
    }

    pub(crate) fn finish(self) -> Signature {
        self.hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::value::Opaque;

    fn sig(value: &Value) -> Signature {
        hash_value(value).unwrap()
    }

    #[test]
    fn hashing_is_deterministic() {
        let v = Value::List(vec![Value::Int(1), Value::Str("x".into()), Value::Null]);
        assert_eq!(sig(&v), sig(&v.clone()));
    }

    #[test]
    fn kinds_with_identical_payloads_differ() {
        assert_ne!(sig(&Value::Int(1)), sig(&Value::Bool(true)));
        assert_ne!(sig(&Value::Str("1".into())), sig(&Value::Int(1)));
        assert_ne!(
            sig(&Value::List(vec![Value::Int(1)])),
            sig(&Value::Tuple(vec![Value::Int(1)])),
        );
        assert_ne!(sig(&Value::Null), sig(&Value::Str(String::new())));
    }

    #[test]
    fn float_hash_uses_bit_pattern() {
        assert_ne!(sig(&Value::Float(0.0)), sig(&Value::Float(-0.0)));
        assert_eq!(sig(&Value::Float(1.5)), sig(&Value::Float(1.5)));
    }

    #[test]
    fn map_hash_ignores_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert(Key::from("x"), Value::Int(1));
        a.insert(Key::from("y"), Value::Int(2));

        let mut b = BTreeMap::new();
        b.insert(Key::from("y"), Value::Int(2));
        b.insert(Key::from("x"), Value::Int(1));

        assert_eq!(sig(&Value::Map(a)), sig(&Value::Map(b)));
    }

    #[test]
    fn set_hash_ignores_element_order() {
        let a = Value::Set(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let b = Value::Set(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        assert_eq!(sig(&a), sig(&b));

        let c = Value::Set(vec![Value::Int(1), Value::Int(2)]);
        assert_ne!(sig(&a), sig(&c));
    }

    #[test]
    fn nested_containers_hash_recursively() {
        let mut inner = BTreeMap::new();
        inner.insert(Key::from("k"), Value::List(vec![Value::Float(1.0)]));

        let a = Value::List(vec![Value::Map(inner.clone()), Value::Int(9)]);
        let b = Value::List(vec![Value::Map(inner), Value::Int(9)]);
        assert_eq!(sig(&a), sig(&b));
    }

    #[test]
    fn empty_containers_are_distinct() {
        assert_ne!(sig(&Value::List(vec![])), sig(&Value::Tuple(vec![])));
        assert_ne!(sig(&Value::List(vec![])), sig(&Value::Set(vec![])));
        assert_ne!(sig(&Value::Map(BTreeMap::new())), sig(&Value::Set(vec![])));
    }

    #[test]
    fn opaque_values_are_unhashable() {
        let err = hash_value(&Value::Opaque(Opaque::new(42u8))).unwrap_err();
        assert!(err.type_name.contains("u8"));

        // Also when nested inside a container.
        let nested = Value::List(vec![Value::Opaque(Opaque::new(42u8))]);
        assert!(hash_value(&nested).is_err());
    }

    #[test]
    fn builder_separates_name_version_and_params() {
        let a = SignatureBuilder::new("add", 1).finish();
        let b = SignatureBuilder::new("add", 2).finish();
        let c = SignatureBuilder::new("mul", 1).finish();
        assert_ne!(a, b);
        assert_ne!(a, c);

        let mut d = SignatureBuilder::new("add", 1);
        d.param("x", &Value::Int(1)).unwrap();
        let mut e = SignatureBuilder::new("add", 1);
        e.param("x", &Value::Int(2)).unwrap();
        assert_ne!(d.finish(), e.finish());
    }

    #[test]
    fn hex_rendering_is_fixed_width() {
        let s = Signature(0xab);
        assert_eq!(s.to_hex(), "00000000000000ab");
        assert_eq!(format!("{s}"), "00000000000000ab");
        assert_eq!(format!("{s:?}"), "Signature(00000000000000ab)");
    }
}
