//! Index keys and key definitions.
//!
//! An [`IndexKey`] is the comparison key of one tuple in one index: the
//! addressed field values, cloned out in part order. Keys are compared
//! lexicographically with shorter-prefix-first semantics, so a partial
//! search key sorts immediately before every full key it is a prefix of —
//! which is exactly what ordered-range positioning needs.

use std::cmp::Ordering;
use std::fmt;

use smallvec::SmallVec;
use strata_types::{Tuple, Value};

/// A comparison key: an ordered list of field values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey(SmallVec<[Value; 3]>);

impl IndexKey {
    pub fn new(parts: impl IntoIterator<Item = Value>) -> Self {
        Self(parts.into_iter().collect())
    }

    /// An empty key (matches everything).
    pub fn empty() -> Self {
        Self(SmallVec::new())
    }

    #[inline]
    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.0.len() as u32
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append `value` to the key.
    pub fn push(&mut self, value: Value) {
        self.0.push(value);
    }

    /// A new key with `suffix`'s parts appended.
    #[must_use]
    pub fn concat(&self, suffix: &IndexKey) -> IndexKey {
        let mut out = self.clone();
        for v in suffix.parts() {
            out.push(v.clone());
        }
        out
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<Value> for IndexKey {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Compare a full key against a (possibly partial) search key.
///
/// Only the first `partial.len()` parts of `full` participate; if they all
/// match, the keys are considered equal. This is the comparison every
/// range predicate is built on.
pub fn compare_prefix(full: &IndexKey, partial: &IndexKey) -> Ordering {
    for (a, b) in full.parts().iter().zip(partial.parts()) {
        match a.cmp(b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    if full.parts().len() < partial.parts().len() {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// Definition of a positional key: which tuple fields form the key, in
/// which order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDef {
    parts: SmallVec<[u32; 4]>,
}

impl KeyDef {
    pub fn new(parts: impl IntoIterator<Item = u32>) -> Self {
        Self {
            parts: parts.into_iter().collect(),
        }
    }

    #[inline]
    pub fn parts(&self) -> &[u32] {
        &self.parts
    }

    #[inline]
    pub fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }

    /// Extract the key of `tuple`.
    ///
    /// # Panics
    ///
    /// Panics if the tuple does not conform to the schema (a key field is
    /// missing). Tuples are validated before they reach an index.
    pub fn extract(&self, tuple: &Tuple) -> IndexKey {
        self.parts
            .iter()
            .map(|&pos| {
                tuple
                    .field(pos)
                    .unwrap_or_else(|| panic!("tuple has no field {pos} required by key"))
                    .clone()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(vals: &[i64]) -> IndexKey {
        vals.iter().map(|&v| Value::Int(v)).collect()
    }

    #[test]
    fn test_prefix_compare_partial_key() {
        let full = key(&[2, 10]);
        assert_eq!(compare_prefix(&full, &key(&[2])), Ordering::Equal);
        assert_eq!(compare_prefix(&full, &key(&[3])), Ordering::Less);
        assert_eq!(compare_prefix(&full, &key(&[1])), Ordering::Greater);
        assert_eq!(compare_prefix(&full, &key(&[2, 10])), Ordering::Equal);
        assert_eq!(compare_prefix(&full, &key(&[2, 11])), Ordering::Less);
    }

    #[test]
    fn test_empty_search_key_matches_anything() {
        assert_eq!(compare_prefix(&key(&[5]), &IndexKey::empty()), Ordering::Equal);
    }

    #[test]
    fn test_shorter_prefix_sorts_first() {
        // A partial key positions before every full key it prefixes.
        assert!(key(&[2]) < key(&[2, 0]));
        assert!(key(&[2, 9]) < key(&[3]));
    }

    #[test]
    fn test_key_def_extract() {
        let t = Tuple::new(vec![Value::Int(7), Value::Str("x".into()), Value::Int(9)]);
        let def = KeyDef::new([2, 0]);
        assert_eq!(def.extract(&t), key(&[9, 7]));
    }
}
