//! The story garbage collector.
//!
//! A crawler advances a cursor through the global story list, running a
//! fixed number of steps per newly created story plus whatever backlog
//! has accumulated. Each visited story is classified with ordered
//! predicates; only a story that no statement, reader, read view, chain
//! shape or gap tracker can still need is unlinked and destroyed.

use crate::arena::StoryId;
use crate::manager::TxManager;
use crate::story::StoryStatus;

/// Collector steps scheduled per story creation.
pub const GC_STEPS_PER_STORY: usize = 2;

impl TxManager {
    /// Run one collector step: examine the story under the cursor and
    /// either reclassify it or unlink and destroy it.
    pub fn story_gc_step(&mut self) {
        let Some(sid) = self.gc_cursor else {
            // Wrapped around: restart from the head of the list.
            self.gc_cursor = self.all_head;
            return;
        };
        self.gc_cursor = self.stories[sid].all_next;

        let lowest_rv_psn = self.lowest_rv_psn();

        // The order of the checks matters: a directly used story must not
        // be reclassified as read-view-pinned, and so on down.
        {
            let story = &self.stories[sid];
            if story.add_stmt.is_some() || story.del_stmt.is_some() || !story.readers.is_empty() {
                self.story_set_status(sid, StoryStatus::Used);
                return;
            }
        }
        {
            let story = &self.stories[sid];
            if story.add_psn >= lowest_rv_psn || story.del_psn >= lowest_rv_psn {
                self.story_set_status(sid, StoryStatus::ReadView);
                return;
            }
        }
        let index_count = self.stories[sid].index_count;
        for ord in 0..index_count {
            let (newer, older, has_gaps, in_index) = {
                let link = self.stories[sid].link(ord);
                (link.newer, link.older, !link.read_gaps.is_empty(), link.in_index)
            };
            match newer {
                None => {
                    debug_assert!(in_index);
                    // Unlinking the head would promote `older` to the top
                    // without it being physically in the index.
                    if older.is_some() {
                        self.story_set_status(sid, StoryStatus::Used);
                        return;
                    }
                }
                Some(newer) => {
                    // In a secondary index an in-progress newer insertion
                    // may yet be rolled back, resurrecting the need for
                    // this story.
                    if ord > 0 && self.stories[newer].add_stmt.is_some() {
                        self.story_set_status(sid, StoryStatus::Used);
                        return;
                    }
                }
            }
            if has_gaps {
                self.story_set_status(sid, StoryStatus::TrackGap);
                return;
            }
        }

        tracing::debug!(story = %sid, "collecting unreachable story");
        self.story_full_unlink_gc_step(sid);
        self.story_delete(sid);
    }

    /// Run the accumulated collector backlog.
    pub fn story_gc(&mut self) {
        let steps = std::mem::take(&mut self.must_do_gc_steps);
        for _ in 0..steps {
            self.story_gc_step();
        }
    }

    /// Unlink a story from every chain, removing its tuple from an index
    /// when the story is a deleted head. Preserves the top-of-chain
    /// invariant: a head is only ever unlinked when its chain is
    /// otherwise empty, so no successor is silently promoted.
    pub(crate) fn story_full_unlink_gc_step(&mut self, sid: StoryId) {
        let index_count = self.stories[sid].index_count;
        for ord in 0..index_count {
            let newer = self.stories[sid].link(ord).newer;
            match newer {
                None => {
                    let (in_index, older, del_psn) = {
                        let link = self.stories[sid].link(ord);
                        (link.in_index, link.older, self.stories[sid].del_psn)
                    };
                    debug_assert!(in_index);
                    debug_assert!(older.is_none());
                    if del_psn.is_some() && in_index {
                        // The story deletes the tuple: this is where the
                        // tuple finally leaves the index.
                        let tuple = self.stories[sid].tuple.clone();
                        let space = self.stories[sid].space;
                        let (removed, _) = self
                            .spaces
                            .get_mut(&space)
                            .expect("space of a live story")
                            .index_mut(ord)
                            .replace(Some(&tuple), None);
                        debug_assert!(removed.is_some_and(|t| t.same(&tuple)));
                        self.stories[sid].link_mut(ord).in_index = false;
                        if ord == 0 {
                            self.unref_from_primary(sid);
                        }
                    }
                    self.story_unlink(sid, older, ord);
                }
                Some(newer) => {
                    let older = self.stories[sid].link(ord).older;
                    self.stories[newer].link_mut(ord).older = older;
                    if let Some(older) = older {
                        self.stories[older].link_mut(ord).newer = Some(newer);
                    }
                    let link = self.stories[sid].link_mut(ord);
                    link.older = None;
                    link.newer = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_index::{IndexDef, IndexKey};
    use strata_types::{SpaceId, Tuple, Value};

    fn setup() -> (TxManager, SpaceId) {
        let mut m = TxManager::new();
        let sid = SpaceId::new(1);
        m.create_space(sid, "t", vec![IndexDef::tree("pk", [0], true)])
            .unwrap();
        (m, sid)
    }

    fn drain_gc(m: &mut TxManager) {
        // A couple of full passes over the story list.
        for _ in 0..64 {
            m.story_gc_step();
        }
    }

    #[test]
    fn test_gc_collects_story_of_committed_insert() {
        let (mut m, space) = setup();
        let tx = m.begin();
        m.insert(tx, space, Tuple::new(vec![Value::Int(1)])).unwrap();
        m.commit(tx).unwrap();
        drain_gc(&mut m);
        assert_eq!(m.stories.len(), 0, "committed insert leaves no story");
        // The tuple itself stays in the index.
        assert!(m
            .space(space)
            .unwrap()
            .index(0)
            .get(&IndexKey::new([Value::Int(1)]))
            .is_some());
    }

    #[test]
    fn test_gc_keeps_story_referenced_by_statement() {
        let (mut m, space) = setup();
        let tx = m.begin();
        m.insert(tx, space, Tuple::new(vec![Value::Int(1)])).unwrap();
        drain_gc(&mut m);
        assert!(m.stories.len() > 0, "in-progress statement pins its story");
        assert_eq!(m.stories[m.stories.ids().next().unwrap()].status, StoryStatus::Used);
        m.rollback(tx).unwrap();
    }

    #[test]
    fn test_gc_removes_deleted_head_from_index() {
        let (mut m, space) = setup();
        let tx = m.begin();
        m.insert(tx, space, Tuple::new(vec![Value::Int(1)])).unwrap();
        m.commit(tx).unwrap();

        let tx2 = m.begin();
        let deleted = m
            .delete(tx2, space, &IndexKey::new([Value::Int(1)]))
            .unwrap();
        assert!(deleted.is_some());
        m.commit(tx2).unwrap();
        drain_gc(&mut m);
        assert!(
            m.space(space)
                .unwrap()
                .index(0)
                .get(&IndexKey::new([Value::Int(1)]))
                .is_none(),
            "committed delete physically leaves the index only at collection"
        );
        assert_eq!(m.stories.len(), 0);
    }

    #[test]
    fn test_gc_respects_read_view_pin() {
        let (mut m, space) = setup();
        let tx = m.begin();
        m.insert(tx, space, Tuple::new(vec![Value::Int(1)])).unwrap();
        m.commit(tx).unwrap();
        drain_gc(&mut m);

        // A reader goes to a read view below a newer deleter.
        let reader = m.begin();
        let got = m.get(Some(reader), space, 0, &IndexKey::new([Value::Int(1)])).unwrap();
        assert!(got.is_some());

        let deleter = m.begin();
        m.delete(deleter, space, &IndexKey::new([Value::Int(1)])).unwrap();
        m.prepare(deleter).unwrap();
        assert_eq!(m.txns[&reader].status, crate::txn::TxnStatus::InReadView);
        m.commit(deleter).unwrap();

        drain_gc(&mut m);
        // The story outlives the commit: the reader's view still needs it.
        assert!(m.stories.len() > 0);
        m.rollback(reader).unwrap();
        drain_gc(&mut m);
        assert_eq!(m.stories.len(), 0);
    }
}
