//! Keys, values and the canonical attribute set identifying a time series.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// The name half of a [`KeyValue`] pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Cow<'static, str>);

impl Key {
    /// Creates a new key.
    pub fn new(value: impl Into<Cow<'static, str>>) -> Self {
        Key(value.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for Key {
    fn from(value: &'static str) -> Self {
        Key(Cow::Borrowed(value))
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key(Cow::Owned(value))
    }
}

impl From<Cow<'static, str>> for Key {
    fn from(value: Cow<'static, str>) -> Self {
        Key(value)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The value half of a [`KeyValue`] pair.
///
/// Floating point values are compared and hashed by bit pattern so that
/// attribute sets containing them remain usable as map keys. Two `NaN`s
/// with identical bits are therefore considered equal here.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Value {
    /// A boolean value.
    Bool(bool),
    /// A signed 64-bit integer value.
    I64(i64),
    /// A 64-bit floating point value.
    F64(f64),
    /// A string value.
    String(Cow<'static, str>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Bool(b) => b.hash(state),
            Value::I64(i) => i.hash(state),
            Value::F64(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::F64(value)
    }
}

impl From<&'static str> for Value {
    fn from(value: &'static str) -> Self {
        Value::String(Cow::Borrowed(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(Cow::Owned(value))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::I64(i) => write!(f, "{i}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::String(s) => f.write_str(s),
        }
    }
}

/// A single key/value attribute pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyValue {
    /// The attribute name.
    pub key: Key,
    /// The attribute value.
    pub value: Value,
}

impl KeyValue {
    /// Creates a new key/value pair.
    pub fn new(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        KeyValue {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An immutable, order-independent set of attributes identifying a
/// time series.
///
/// Construction canonicalizes the input: pairs are sorted by key and a
/// duplicated key keeps the last value supplied. Two differently ordered
/// slices of the same pairs therefore compare equal and hash identically.
/// Cloning is cheap; the underlying storage is shared.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttributeSet(Arc<[KeyValue]>);

impl AttributeSet {
    /// Creates a set from the given attributes, dropping earlier values of
    /// duplicated keys.
    pub fn new(attributes: impl IntoIterator<Item = KeyValue>) -> Self {
        let mut deduped = BTreeMap::new();
        for kv in attributes {
            deduped.insert(kv.key, kv.value);
        }
        AttributeSet(
            deduped
                .into_iter()
                .map(|(key, value)| KeyValue { key, value })
                .collect(),
        )
    }

    /// The number of attributes in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set holds no attributes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the attributes in canonical (key-sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.0.iter()
    }

    /// Looks up the value recorded for `key`.
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.0
            .binary_search_by(|kv| kv.key.cmp(key))
            .ok()
            .map(|idx| &self.0[idx].value)
    }

    /// Returns a new set holding only the attributes `predicate` accepts.
    ///
    /// The result keeps the canonical order of the input, so filtering is
    /// idempotent: filtering an already filtered set with the same
    /// predicate yields an equal set.
    pub fn filter(&self, predicate: impl Fn(&KeyValue) -> bool) -> AttributeSet {
        AttributeSet(self.0.iter().filter(|kv| predicate(kv)).cloned().collect())
    }

    /// Copies the attributes out into a plain vector.
    pub fn to_vec(&self) -> Vec<KeyValue> {
        self.0.to_vec()
    }
}

impl Default for AttributeSet {
    fn default() -> Self {
        AttributeSet(Vec::new().into())
    }
}

impl From<&[KeyValue]> for AttributeSet {
    fn from(attributes: &[KeyValue]) -> Self {
        AttributeSet::new(attributes.iter().cloned())
    }
}

impl From<Vec<KeyValue>> for AttributeSet {
    fn from(attributes: Vec<KeyValue>) -> Self {
        AttributeSet::new(attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::collections::HashMap;

    fn hash_of(set: &AttributeSet) -> u64 {
        let mut hasher = DefaultHasher::new();
        set.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn equality_is_order_independent() {
        let a = AttributeSet::new([
            KeyValue::new("user", "alice"),
            KeyValue::new("tid", 7),
            KeyValue::new("active", true),
        ]);
        let b = AttributeSet::new([
            KeyValue::new("active", true),
            KeyValue::new("user", "alice"),
            KeyValue::new("tid", 7),
        ]);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let mut cells = HashMap::new();
        cells.insert(a, 1);
        *cells.entry(b).or_insert(0) += 1;
        assert_eq!(cells.len(), 1, "both orderings must collapse to one cell");
    }

    #[test]
    fn duplicate_keys_keep_the_last_value() {
        let set = AttributeSet::new([KeyValue::new("k", 1), KeyValue::new("k", 2)]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&Key::new("k")), Some(&Value::I64(2)));
    }

    #[test]
    fn filter_is_idempotent_and_order_preserving() {
        let set = AttributeSet::new([
            KeyValue::new("a", 1),
            KeyValue::new("b", 2),
            KeyValue::new("c", 3),
        ]);
        let keep_not_b = |kv: &KeyValue| kv.key.as_str() != "b";
        let once = set.filter(keep_not_b);
        let twice = once.filter(keep_not_b);
        assert_eq!(once, twice);
        let keys: Vec<_> = once.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, ["a", "c"]);
    }

    #[test]
    fn float_values_are_usable_as_map_keys() {
        let a = AttributeSet::new([KeyValue::new("ratio", 0.5)]);
        let b = AttributeSet::new([KeyValue::new("ratio", 0.5)]);
        assert_eq!(a, b);
        assert_ne!(a, AttributeSet::new([KeyValue::new("ratio", 0.25)]));
    }

    #[test]
    fn lookup_missing_key_is_none() {
        let set = AttributeSet::new([KeyValue::new("present", 1)]);
        assert!(set.get(&Key::new("absent")).is_none());
    }
}
