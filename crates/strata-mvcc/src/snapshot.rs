//! The snapshot cleaner.
//!
//! Snapshot iteration walks physical indexes, which hold the newest
//! version of every chain — including versions not yet confirmed. The
//! cleaner maps each such dirty tuple of one (space, index) pair to the
//! tuple actually committed at the read-view point, so a snapshot writer
//! can substitute on the fly. Built once per snapshot, consulted per
//! tuple, dropped after.

use std::collections::HashMap;

use strata_types::{SpaceId, Tuple, TupleAddr};

use crate::manager::{TxManager, Xxh3BuildHasher};

/// Maps dirty tuples handed out of the engine's scope to their committed
/// versions.
pub struct SnapshotCleaner {
    map: HashMap<TupleAddr, Option<Tuple>, Xxh3BuildHasher>,
}

impl TxManager {
    /// Build a cleaner for one index of one space.
    #[must_use]
    pub fn snapshot_cleaner_create(&mut self, space: SpaceId, ord: u32) -> SnapshotCleaner {
        let mut map: HashMap<TupleAddr, Option<Tuple>, Xxh3BuildHasher> = HashMap::default();
        for sid in self.stories_in_index(space, ord) {
            let tuple = self.stories[sid].tuple.clone();
            // No transaction viewpoint: committed and prepared changes
            // are in, nothing is tracked.
            let (clean, _) = self.find_visible_tuple(sid, None, ord, true);
            if clean.as_ref().is_some_and(|c| c.same(&tuple)) {
                continue;
            }
            map.insert(tuple.addr(), clean);
        }
        SnapshotCleaner { map }
    }
}

impl SnapshotCleaner {
    /// The committed version of `tuple`, or `None` if nothing committed
    /// stands at its key. Clean tuples pass through unchanged.
    #[must_use]
    pub fn clarify(&self, tuple: &Tuple) -> Option<Tuple> {
        match self.map.get(&tuple.addr()) {
            Some(clean) => clean.clone(),
            None => Some(tuple.clone()),
        }
    }

    /// Number of substitutions the cleaner carries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_index::IndexDef;
    use strata_types::Value;

    #[test]
    fn test_cleaner_substitutes_uncommitted_head() {
        let mut m = TxManager::new();
        let space = SpaceId::new(1);
        m.create_space(space, "t", vec![IndexDef::tree("pk", [0], true)])
            .unwrap();

        let seed = m.begin();
        m.insert(seed, space, Tuple::new(vec![Value::Int(1), Value::Int(10)]))
            .unwrap();
        m.commit(seed).unwrap();

        // An in-progress replace puts its version at the head.
        let writer = m.begin();
        m.replace(writer, space, Tuple::new(vec![Value::Int(1), Value::Int(20)]))
            .unwrap();

        let physical = m
            .space(space)
            .unwrap()
            .index(0)
            .get(&strata_index::IndexKey::new([Value::Int(1)]))
            .unwrap();
        assert_eq!(physical.field(1), Some(&Value::Int(20)));

        let cleaner = m.snapshot_cleaner_create(space, 0);
        let clean = cleaner.clarify(&physical).unwrap();
        assert_eq!(clean.field(1), Some(&Value::Int(10)));
        m.rollback(writer).unwrap();
    }

    #[test]
    fn test_cleaner_passes_clean_tuples_through() {
        let mut m = TxManager::new();
        let space = SpaceId::new(1);
        m.create_space(space, "t", vec![IndexDef::tree("pk", [0], true)])
            .unwrap();
        let cleaner = m.snapshot_cleaner_create(space, 0);
        assert!(cleaner.is_empty());
        let t = Tuple::new(vec![Value::Int(1)]);
        assert!(cleaner.clarify(&t).unwrap().same(&t));
    }
}
