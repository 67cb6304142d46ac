//! Physical index storage.
//!
//! An index stores the comparison key of every physically present tuple.
//! Non-unique ordered indexes extend their declared key with the primary
//! key parts, so every stored key is unique and a tuple displaces exactly
//! the prior version of its own row. The engine above relies on `replace`
//! reporting both the displaced tuple and the ascending successor of a
//! fresh insertion: the successor is where gap trackers live.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use smallvec::SmallVec;
use strata_error::{Result, StrataError};
use strata_types::Tuple;

use crate::def::{DupMode, IndexDef, IndexKind};
use crate::iterator::{tuple_key_is_before, IteratorType};
use crate::key::{compare_prefix, IndexKey};

#[derive(Debug)]
enum Storage {
    Tree(BTreeMap<IndexKey, Tuple>),
    Hash(HashMap<IndexKey, Tuple>),
}

/// One physical index of a space.
#[derive(Debug)]
pub struct Index {
    def: IndexDef,
    /// Primary-key parts appended to the declared key of a non-unique
    /// index so that stored keys are unique per row.
    pk_suffix: SmallVec<[u32; 4]>,
    storage: Storage,
}

impl Index {
    pub(crate) fn new(def: IndexDef, pk_parts: &[u32]) -> Self {
        let pk_suffix: SmallVec<[u32; 4]> = if def.unique {
            SmallVec::new()
        } else {
            pk_parts.iter().copied().collect()
        };
        let storage = match def.kind {
            IndexKind::Hash => Storage::Hash(HashMap::new()),
            _ => Storage::Tree(BTreeMap::new()),
        };
        Self {
            def,
            pk_suffix,
            storage,
        }
    }

    #[inline]
    pub fn def(&self) -> &IndexDef {
        &self.def
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Number of parts in the full comparison key.
    pub fn cmp_part_count(&self) -> u32 {
        self.def.part_count() + self.pk_suffix.len() as u32
    }

    /// The declared key of `tuple`.
    ///
    /// # Panics
    ///
    /// For functional indexes, panics if the user function fails to
    /// produce a key: the key is needed to maintain chain identity and
    /// there is no way to continue without it.
    pub fn declared_key_of(&self, tuple: &Tuple) -> IndexKey {
        match &self.def.kind {
            IndexKind::Func { func, .. } => func(tuple).unwrap_or_else(|| {
                panic!(
                    "functional index '{}' failed to compute a key",
                    self.def.name
                )
            }),
            _ => self.def.key.extract(tuple),
        }
    }

    /// The full comparison key of `tuple` (declared key plus the pk
    /// suffix of a non-unique index).
    pub fn cmp_key_of(&self, tuple: &Tuple) -> IndexKey {
        self.cmp_key_from_declared(self.declared_key_of(tuple), tuple)
    }

    /// Extend an already-known declared key with the pk suffix values.
    pub fn cmp_key_from_declared(&self, mut declared: IndexKey, tuple: &Tuple) -> IndexKey {
        for &pos in &self.pk_suffix {
            declared.push(
                tuple
                    .field(pos)
                    .unwrap_or_else(|| panic!("tuple has no field {pos} required by key"))
                    .clone(),
            );
        }
        declared
    }

    /// Number of physically stored tuples.
    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Tree(t) => t.len(),
            Storage::Hash(h) => h.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up the physically stored tuple under the full comparison key.
    pub fn get(&self, cmp_key: &IndexKey) -> Option<Tuple> {
        match &self.storage {
            Storage::Tree(t) => t.get(cmp_key).cloned(),
            Storage::Hash(h) => h.get(cmp_key).cloned(),
        }
    }

    /// Physical update.
    ///
    /// Inserting `new` displaces whatever shares its comparison key; if
    /// `old` is given and keyed differently, `old` is removed as well.
    /// Returns the displaced tuple and, for a fresh insertion into an
    /// ordered index, the ascending successor of the new position.
    pub fn replace(
        &mut self,
        old: Option<&Tuple>,
        new: Option<&Tuple>,
    ) -> (Option<Tuple>, Option<Tuple>) {
        match new {
            Some(new_tuple) => {
                let k = self.cmp_key_of(new_tuple);
                let displaced = match &mut self.storage {
                    Storage::Tree(t) => t.insert(k.clone(), new_tuple.clone()),
                    Storage::Hash(h) => h.insert(k.clone(), new_tuple.clone()),
                };
                let successor = if displaced.is_none() {
                    self.next_ascending_after(&k)
                } else {
                    None
                };
                if let Some(old_tuple) = old {
                    let ko = self.cmp_key_of(old_tuple);
                    if ko != k {
                        match &mut self.storage {
                            Storage::Tree(t) => t.remove(&ko),
                            Storage::Hash(h) => h.remove(&ko),
                        };
                    }
                }
                (displaced, successor)
            }
            None => {
                let removed = old.and_then(|old_tuple| {
                    let ko = self.cmp_key_of(old_tuple);
                    match &mut self.storage {
                        Storage::Tree(t) => t.remove(&ko),
                        Storage::Hash(h) => h.remove(&ko),
                    }
                });
                (removed, None)
            }
        }
    }

    /// The physically stored tuple whose key follows `cmp_key` in
    /// ascending order. `None` for unordered indexes.
    pub fn next_ascending_after(&self, cmp_key: &IndexKey) -> Option<Tuple> {
        match &self.storage {
            Storage::Tree(t) => t
                .range((Bound::Excluded(cmp_key.clone()), Bound::Unbounded))
                .next()
                .map(|(_, tuple)| tuple.clone()),
            Storage::Hash(_) => None,
        }
    }

    /// The tuple an ascending positioning for (`iter`, `key`) lands on:
    /// the first stored tuple at-or-after the scanned region. This is the
    /// successor the engine hangs gap trackers off.
    pub fn ascending_bound(&self, iter: IteratorType, key: Option<&IndexKey>) -> Option<Tuple> {
        let Storage::Tree(tree) = &self.storage else {
            return None;
        };
        let Some(key) = key else {
            return match iter {
                IteratorType::Ge => tree.values().next().cloned(),
                _ => None,
            };
        };
        let skip_equal = matches!(
            iter,
            IteratorType::Gt | IteratorType::Req | IteratorType::Le
        );
        tree.iter()
            .find(|(k, _)| {
                let cmp = compare_prefix(k, key);
                if skip_equal {
                    cmp == Ordering::Greater
                } else {
                    cmp != Ordering::Less
                }
            })
            .map(|(_, tuple)| tuple.clone())
    }

    /// Physically matching tuples in iteration order.
    ///
    /// # Panics
    ///
    /// Unordered indexes support only full-key equality and unkeyed full
    /// scans; anything else panics.
    pub fn scan(&self, iter: IteratorType, key: Option<&IndexKey>) -> Vec<Tuple> {
        match &self.storage {
            Storage::Hash(h) => match (iter, key) {
                (IteratorType::Eq, Some(k)) => h.get(k).cloned().into_iter().collect(),
                (IteratorType::Ge | IteratorType::Le, None) => h.values().cloned().collect(),
                _ => panic!("unordered index '{}' supports only equality scans", self.def.name),
            },
            Storage::Tree(tree) => {
                let Some(key) = key else {
                    let mut all: Vec<Tuple> = tree.values().cloned().collect();
                    if matches!(iter, IteratorType::Le | IteratorType::Lt) {
                        all.reverse();
                    }
                    return all;
                };
                let cmp = |k: &IndexKey| compare_prefix(k, key);
                let mut out: Vec<Tuple> = match iter {
                    IteratorType::Eq | IteratorType::Req => tree
                        .iter()
                        .skip_while(|(k, _)| cmp(k) == Ordering::Less)
                        .take_while(|(k, _)| cmp(k) == Ordering::Equal)
                        .map(|(_, t)| t.clone())
                        .collect(),
                    IteratorType::Ge => tree
                        .iter()
                        .skip_while(|(k, _)| cmp(k) == Ordering::Less)
                        .map(|(_, t)| t.clone())
                        .collect(),
                    IteratorType::Gt => tree
                        .iter()
                        .skip_while(|(k, _)| cmp(k) != Ordering::Greater)
                        .map(|(_, t)| t.clone())
                        .collect(),
                    IteratorType::Le => tree
                        .iter()
                        .take_while(|(k, _)| cmp(k) != Ordering::Greater)
                        .map(|(_, t)| t.clone())
                        .collect(),
                    IteratorType::Lt => tree
                        .iter()
                        .take_while(|(k, _)| cmp(k) == Ordering::Less)
                        .map(|(_, t)| t.clone())
                        .collect(),
                };
                if matches!(iter, IteratorType::Req | IteratorType::Le | IteratorType::Lt) {
                    out.reverse();
                }
                out
            }
        }
    }

    /// Count physically matching tuples, optionally stopping at the
    /// `until` bound (exclusive, in iteration order).
    pub fn count_matching(
        &self,
        iter: IteratorType,
        key: Option<&IndexKey>,
        until: Option<&IndexKey>,
    ) -> u64 {
        let mut count = 0;
        for tuple in self.scan(iter, key) {
            if let Some(until_key) = until {
                let tk = self.cmp_key_of(&tuple);
                if !tuple_key_is_before(&tk, until_key, iter) {
                    break;
                }
            }
            count += 1;
        }
        count
    }

    /// Duplicate/absence verdict for a prospective insertion, judged
    /// against the visibility-resolved displaced tuple `dup`.
    pub fn check_dup(
        &self,
        old: Option<&Tuple>,
        dup: Option<&Tuple>,
        mode: DupMode,
    ) -> Result<()> {
        match dup {
            None => {
                if mode == DupMode::Replace {
                    return Err(StrataError::TupleNotFound {
                        index: self.def.name.clone(),
                    });
                }
            }
            Some(dup_tuple) => {
                let is_old = old.is_some_and(|o| o.same(dup_tuple));
                if !is_old && (old.is_some() || mode == DupMode::Insert) {
                    return Err(StrataError::DuplicateKey {
                        index: self.def.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::def::IndexDef;
    use strata_types::Value;

    fn tuple(vals: &[i64]) -> Tuple {
        Tuple::new(vals.iter().map(|&v| Value::Int(v)).collect::<Vec<_>>())
    }

    fn key(vals: &[i64]) -> IndexKey {
        vals.iter().map(|&v| Value::Int(v)).collect()
    }

    fn pk_index() -> Index {
        Index::new(IndexDef::tree("pk", [0], true), &[0])
    }

    #[test]
    fn test_replace_reports_displaced_and_successor() {
        let mut idx = pk_index();
        let (d, s) = idx.replace(None, Some(&tuple(&[5])));
        assert!(d.is_none() && s.is_none());

        let (d, s) = idx.replace(None, Some(&tuple(&[1])));
        assert!(d.is_none());
        assert_eq!(s.unwrap().field(0), Some(&Value::Int(5)));

        // Displacing an existing key reports no successor.
        let five2 = tuple(&[5]);
        let (d, s) = idx.replace(None, Some(&five2));
        assert_eq!(d.unwrap().field(0), Some(&Value::Int(5)));
        assert!(s.is_none());
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn test_replace_removes_old_with_different_key() {
        let mut idx = pk_index();
        let a = tuple(&[1]);
        let b = tuple(&[2]);
        idx.replace(None, Some(&a));
        idx.replace(Some(&a), Some(&b));
        assert!(idx.get(&key(&[1])).is_none());
        assert!(idx.get(&key(&[2])).is_some());
    }

    #[test]
    fn test_scan_directions() {
        let mut idx = pk_index();
        for v in [1, 3, 5] {
            idx.replace(None, Some(&tuple(&[v])));
        }
        let ge: Vec<i64> = idx
            .scan(IteratorType::Ge, Some(&key(&[2])))
            .iter()
            .map(|t| match t.field(0) {
                Some(Value::Int(v)) => *v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ge, vec![3, 5]);

        let lt: Vec<i64> = idx
            .scan(IteratorType::Lt, Some(&key(&[5])))
            .iter()
            .map(|t| match t.field(0) {
                Some(Value::Int(v)) => *v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(lt, vec![3, 1]);
    }

    #[test]
    fn test_ascending_bound_per_iterator() {
        let mut idx = pk_index();
        for v in [1, 5] {
            idx.replace(None, Some(&tuple(&[v])));
        }
        let b = idx.ascending_bound(IteratorType::Ge, Some(&key(&[2])));
        assert_eq!(b.unwrap().field(0), Some(&Value::Int(5)));
        let b = idx.ascending_bound(IteratorType::Le, Some(&key(&[1])));
        assert_eq!(b.unwrap().field(0), Some(&Value::Int(5)));
        let b = idx.ascending_bound(IteratorType::Lt, Some(&key(&[1])));
        assert_eq!(b.unwrap().field(0), Some(&Value::Int(1)));
        assert!(idx.ascending_bound(IteratorType::Gt, Some(&key(&[5]))).is_none());
    }

    #[test]
    fn test_non_unique_index_keys_tuples_apart() {
        let mut idx = Index::new(IndexDef::tree("sk", [1], false), &[0]);
        let a = tuple(&[1, 7]);
        let b = tuple(&[2, 7]);
        idx.replace(None, Some(&a));
        idx.replace(None, Some(&b));
        assert_eq!(idx.len(), 2, "same declared key, different rows");
        assert_eq!(idx.scan(IteratorType::Eq, Some(&key(&[7]))).len(), 2);
    }

    #[test]
    fn test_check_dup_modes() {
        let idx = pk_index();
        let old = tuple(&[1]);
        let dup = tuple(&[1]);
        assert!(idx.check_dup(None, None, DupMode::Insert).is_ok());
        assert!(matches!(
            idx.check_dup(None, None, DupMode::Replace),
            Err(StrataError::TupleNotFound { .. })
        ));
        assert!(matches!(
            idx.check_dup(None, Some(&dup), DupMode::Insert),
            Err(StrataError::DuplicateKey { .. })
        ));
        // The displaced tuple being the declared old tuple is fine.
        assert!(idx.check_dup(Some(&old), Some(&old), DupMode::Replace).is_ok());
        // Replace-or-insert over an undeclared occupant is fine too.
        assert!(idx.check_dup(None, Some(&dup), DupMode::ReplaceOrInsert).is_ok());
    }

    #[test]
    fn test_count_matching_with_until() {
        let mut idx = pk_index();
        for v in [1, 2, 3, 4] {
            idx.replace(None, Some(&tuple(&[v])));
        }
        assert_eq!(idx.count_matching(IteratorType::Ge, Some(&key(&[1])), None), 4);
        assert_eq!(
            idx.count_matching(IteratorType::Ge, Some(&key(&[1])), Some(&key(&[3]))),
            2
        );
        assert_eq!(
            idx.count_matching(IteratorType::Le, None, Some(&key(&[2]))),
            2
        );
    }
}
