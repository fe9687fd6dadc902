//! Hashable group-by keys.
//!
//! `Value` carries floats and shared references, so it cannot be a map key
//! directly. [`ValueKey`] pairs each value with a normalized, hashable form:
//! floats by bit pattern, events and objects by identity.

use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use vesper_core::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    Timestamp(i64),
    Duration(u64),
    Seq(Vec<KeyPart>),
    Entries(Vec<(String, KeyPart)>),
    Identity(usize),
}

impl KeyPart {
    fn of(value: &Value) -> Self {
        match value {
            Value::Null => KeyPart::Null,
            Value::Bool(b) => KeyPart::Bool(*b),
            Value::Int(n) => KeyPart::Int(*n),
            // -0.0 and 0.0 group together
            Value::Float(f) => KeyPart::Float(if *f == 0.0 { 0 } else { f.to_bits() }),
            Value::Str(s) => KeyPart::Str(s.clone()),
            Value::Timestamp(t) => KeyPart::Timestamp(*t),
            Value::Duration(d) => KeyPart::Duration(*d),
            Value::Array(items) => KeyPart::Seq(items.iter().map(KeyPart::of).collect()),
            Value::Map(map) => KeyPart::Entries(
                map.iter()
                    .map(|(k, v)| (k.clone(), KeyPart::of(v)))
                    .collect(),
            ),
            Value::Event(e) => KeyPart::Identity(Arc::as_ptr(e) as *const () as usize),
            Value::Object(o) => KeyPart::Identity(o.addr()),
        }
    }
}

/// A value usable as a hash-map key
#[derive(Clone)]
pub struct ValueKey {
    value: Value,
    part: KeyPart,
}

impl ValueKey {
    pub fn new(value: Value) -> Self {
        let part = KeyPart::of(&value);
        Self { value, part }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        self.part == other.part
    }
}

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.part.hash(state);
    }
}

impl fmt::Debug for ValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// The group-by value of one row; empty for ungrouped statements
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct GroupKey(SmallVec<[ValueKey; 2]>);

impl GroupKey {
    pub fn ungrouped() -> Self {
        Self::default()
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        Self(values.into_iter().map(ValueKey::new).collect())
    }

    pub fn is_ungrouped(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.iter().map(ValueKey::value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;
    use vesper_core::MapEvent;

    #[test]
    fn test_equal_values_make_equal_keys() {
        let a = GroupKey::from_values([Value::str("IBM"), Value::Float(1.5)]);
        let b = GroupKey::from_values([Value::str("IBM"), Value::Float(1.5)]);
        let c = GroupKey::from_values([Value::str("MSFT"), Value::Float(1.5)]);
        let set: FxHashSet<GroupKey> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn test_int_and_float_group_separately() {
        assert_ne!(
            GroupKey::from_values([Value::Int(1)]),
            GroupKey::from_values([Value::Float(1.0)])
        );
    }

    #[test]
    fn test_events_key_by_identity() {
        let e1 = MapEvent::new("A").with_field("id", 1i64).into_ref();
        let e2 = MapEvent::new("A").with_field("id", 1i64).into_ref();
        assert_eq!(
            ValueKey::new(Value::Event(e1.clone())),
            ValueKey::new(Value::Event(e1))
        );
        assert_ne!(
            ValueKey::new(Value::Event(e2)),
            ValueKey::new(Value::Event(MapEvent::new("A").with_field("id", 1i64).into_ref()))
        );
    }

    #[test]
    fn test_ungrouped_display() {
        assert!(GroupKey::ungrouped().is_ungrouped());
        assert_eq!(
            GroupKey::from_values([Value::str("a"), Value::Int(2)]).to_string(),
            "('a', 2)"
        );
    }
}
