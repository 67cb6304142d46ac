//! The functional-key cache.
//!
//! Functional indexes derive their key by running user code, which may
//! yield; the engine must never recompute a key mid-surgery. Keys of
//! dirty tuples are therefore computed once and cached process-wide,
//! keyed by tuple identity and index, and purged when the story dies.
//! Key computation failure is fatal — chain identity depends on it.

use strata_index::IndexKey;
use strata_types::{SpaceId, Tuple};

use crate::arena::StoryId;
use crate::manager::TxManager;

impl TxManager {
    /// The declared key of `tuple` in index `ord` of `space`, served
    /// from the functional-key cache for dirty tuples.
    pub(crate) fn tuple_declared_key(&mut self, space: SpaceId, ord: u32, tuple: &Tuple) -> IndexKey {
        let is_func = matches!(
            self.spaces[&space].index(ord).def().kind,
            strata_index::IndexKind::Func { .. }
        );
        if !is_func {
            return self.spaces[&space].index(ord).declared_key_of(tuple);
        }

        let cache_key = (tuple.addr(), space, ord);
        if let Some(declared) = self.func_keys.get(&cache_key) {
            return declared.clone();
        }
        let declared = self.spaces[&space].index(ord).declared_key_of(tuple);
        if tuple.is_dirty() {
            self.func_keys.insert(cache_key, declared.clone());
            let sid = self.story_get(tuple);
            self.stories[sid].has_func_key = true;
        }
        declared
    }

    /// The full comparison key of `tuple` in index `ord` of `space`.
    pub(crate) fn tuple_cmp_key(&mut self, space: SpaceId, ord: u32, tuple: &Tuple) -> IndexKey {
        let declared = self.tuple_declared_key(space, ord, tuple);
        self.spaces[&space]
            .index(ord)
            .cmp_key_from_declared(declared, tuple)
    }

    /// Purge every cached functional key of the story's tuple.
    pub(crate) fn clear_func_keys(&mut self, sid: StoryId) {
        let (addr, space, index_count) = {
            let story = &self.stories[sid];
            (story.tuple.addr(), story.space, story.index_count)
        };
        for ord in 0..index_count {
            self.func_keys.remove(&(addr, space, ord));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use strata_index::IndexDef;
    use strata_types::Value;

    #[test]
    fn test_func_key_computed_once_for_dirty_tuple() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let func: strata_index::KeyFn = Arc::new(move |t: &Tuple| {
            counted.fetch_add(1, Ordering::Relaxed);
            t.field(1).cloned().map(|v| IndexKey::new([v]))
        });

        let mut m = TxManager::new();
        let space = SpaceId::new(1);
        m.create_space(
            space,
            "t",
            vec![
                IndexDef::tree("pk", [0], true),
                IndexDef::func("fk", func, 1, true),
            ],
        )
        .unwrap();

        let t = Tuple::new(vec![Value::Int(1), Value::Int(10)]);
        let sid = m.story_new(space, &t);
        let calls_after_insert = calls.load(Ordering::Relaxed);

        let k1 = m.tuple_cmp_key(space, 1, &t);
        let k2 = m.tuple_cmp_key(space, 1, &t);
        assert_eq!(k1, k2);
        assert_eq!(
            calls.load(Ordering::Relaxed),
            calls_after_insert + 1,
            "second engine-side lookup served from cache"
        );
        assert!(m.stories[sid].has_func_key);

        m.story_delete(sid);
        assert!(m.func_keys.is_empty(), "cache purged with the story");
    }
}
