//! The visibility resolver.
//!
//! Given a chain head and a transaction's viewpoint, walk newest to
//! oldest classifying each version's insert and delete, and return the
//! version the transaction is allowed to see. Skipping a *prepared*
//! change on the way down lazily demotes the walker to a read view at
//! that writer's PSN — this is how the engine discovers, without any
//! up-front ordering, that a reader can no longer serialize after a
//! concurrent committer.
//!
//! Clarification also installs the read-side bookkeeping: a read tracker
//! on the version it returns, or a gap tracker on the chain head when it
//! returns nothing.

use strata_types::{Psn, SpaceId, Tuple, TxnId};

use crate::arena::StoryId;
use crate::manager::TxManager;
use crate::txn::Isolation;

impl TxManager {
    /// Whether the beginning of a story (the insertion of its tuple) is
    /// visible to `txn`. The second flag reports the change being the
    /// transaction's own.
    pub(crate) fn insert_is_visible(
        &self,
        sid: StoryId,
        txn: Option<TxnId>,
        prepared_ok: bool,
    ) -> (bool, bool) {
        let story = &self.stories[sid];

        if let (Some(stmt), Some(txn)) = (story.add_stmt, txn) {
            if self.stmts[stmt].txn == txn {
                return (true, true);
            }
        }

        let rv_psn = self.viewpoint_psn(txn);

        if prepared_ok && story.add_psn.is_some() && story.add_psn.get() < rv_psn {
            // Added by another prepared transaction.
            return (true, false);
        }
        if story.add_psn.is_some() && story.add_stmt.is_none() && story.add_psn.get() < rv_psn {
            // Added by a committed transaction.
            return (true, false);
        }
        if story.add_psn.is_none() && story.add_stmt.is_none() {
            // Added long ago, before history was kept.
            return (true, false);
        }
        (false, false)
    }

    /// Whether the end of a story (the deletion of its tuple) is visible
    /// to `txn`.
    pub(crate) fn delete_is_visible(
        &self,
        sid: StoryId,
        txn: Option<TxnId>,
        prepared_ok: bool,
    ) -> (bool, bool) {
        let story = &self.stories[sid];

        if let Some(txn) = txn {
            let mut cur = story.del_stmt;
            while let Some(stmt_id) = cur {
                let stmt = &self.stmts[stmt_id];
                if stmt.txn == txn {
                    return (true, true);
                }
                cur = stmt.next_in_del_list;
            }
        }

        let rv_psn = self.viewpoint_psn(txn);

        if prepared_ok && story.del_psn.is_some() && story.del_psn.get() < rv_psn {
            return (true, false);
        }
        if story.del_psn.is_some() && story.del_stmt.is_none() && story.del_psn.get() < rv_psn {
            return (true, false);
        }
        (false, false)
    }

    /// The PSN ceiling of a transaction's viewpoint: its read-view PSN if
    /// demoted, otherwise unbounded.
    fn viewpoint_psn(&self, txn: Option<TxnId>) -> u64 {
        txn.and_then(|t| self.txns.get(&t))
            .map(|t| t.rv_psn)
            .filter(|p| p.is_some())
            .map_or(u64::MAX, Psn::get)
    }

    /// Scan a chain from `sid` down for the version visible to `txn`.
    /// No tracking side effects.
    pub(crate) fn find_visible_tuple(
        &self,
        sid: StoryId,
        txn: Option<TxnId>,
        ord: u32,
        prepared_ok: bool,
    ) -> (Option<Tuple>, bool) {
        let mut cur = Some(sid);
        while let Some(s) = cur {
            let (visible, own) = self.delete_is_visible(s, txn, prepared_ok);
            if visible {
                return (None, own);
            }
            let (visible, own) = self.insert_is_visible(s, txn, prepared_ok);
            if visible {
                return (Some(self.stories[s].tuple.clone()), own);
            }
            cur = self.stories[s].link(ord).older;
        }
        (None, false)
    }

    /// Whether `txn` may see prepared but unconfirmed changes in `space`.
    pub(crate) fn detect_prepared_ok(&self, txn: Option<TxnId>, space: SpaceId) -> bool {
        if self.spaces[&space].is_system {
            return true;
        }
        let Some(txn) = txn.and_then(|t| self.txns.get(&t)) else {
            return false;
        };
        match txn.isolation {
            Isolation::ReadCommitted => true,
            Isolation::ReadConfirmed | Isolation::Linearizable => false,
            // The best effort we can make: a read-only transaction reads
            // a stable confirmed view; one that has written sees prepared
            // changes to avoid trivial write-write conflicts.
            Isolation::BestEffort => txn.has_writes(),
        }
    }

    /// Walk the chain headed by `top` for the version visible to `txn`,
    /// demoting `txn` past any prepared change it skips, and install the
    /// read-side tracking.
    pub(crate) fn clarify_story(
        &mut self,
        txn: Option<TxnId>,
        _space: SpaceId,
        top: StoryId,
        ord: u32,
        prepared_ok: bool,
    ) -> Option<Tuple> {
        let mut sid = top;
        let mut own_change = false;
        let mut result: Option<Tuple> = None;

        loop {
            let (visible, own) = self.delete_is_visible(sid, txn, prepared_ok);
            if visible {
                own_change = own;
                break;
            }
            {
                let story = &self.stories[sid];
                if story.del_psn.is_some() && story.del_stmt.is_some() {
                    // Skipping a prepared deletion: the walker must
                    // serialize before that writer.
                    let psn = story.del_psn;
                    if let Some(t) = txn {
                        self.send_to_read_view(t, psn);
                    }
                }
            }

            let (visible, own) = self.insert_is_visible(sid, txn, prepared_ok);
            if visible {
                own_change = own;
                result = Some(self.stories[sid].tuple.clone());
                break;
            }
            {
                let story = &self.stories[sid];
                if story.add_psn.is_some() && story.add_stmt.is_some() {
                    // Same for a skipped prepared insertion.
                    let psn = story.add_psn;
                    if let Some(t) = txn {
                        self.send_to_read_view(t, psn);
                    }
                }
            }

            match self.stories[sid].link(ord).older {
                Some(older) => sid = older,
                None => break,
            }
        }

        if let Some(t) = txn {
            if !own_change {
                // A visible tuple is visible in every index, but a miss
                // is a per-index observation: the gap lands on the head
                // of the chain in this index.
                match &result {
                    None => self.track_story_gap(t, top, ord),
                    Some(_) => self.track_read_story(Some(t), sid),
                }
            }
        }
        result
    }

    /// Resolve the version of `tuple` visible to `txn`, installing read
    /// or gap trackers as a side effect. With the engine disabled this
    /// returns its input unchanged.
    pub fn clarify(
        &mut self,
        txn: Option<TxnId>,
        space: SpaceId,
        ord: u32,
        tuple: &Tuple,
    ) -> Option<Tuple> {
        if !self.enabled {
            return Some(tuple.clone());
        }
        if !tuple.is_dirty() {
            self.track_read(txn, space, Some(tuple));
            return Some(tuple.clone());
        }
        let prepared_ok = self.detect_prepared_ok(txn, space);
        let story = self.story_get(tuple);
        self.clarify_story(txn, space, story, ord, prepared_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::TxnStatus;
    use strata_index::IndexDef;
    use strata_types::Value;

    fn setup() -> (TxManager, SpaceId) {
        let mut m = TxManager::new();
        let sid = SpaceId::new(1);
        m.create_space(sid, "t", vec![IndexDef::tree("pk", [0], true)])
            .unwrap();
        (m, sid)
    }

    fn tuple(v: i64) -> Tuple {
        Tuple::new(vec![Value::Int(v)])
    }

    #[test]
    fn test_clean_tuple_clarifies_to_itself() {
        let (mut m, space) = setup();
        let tx = m.begin();
        let t = tuple(1);
        let seen = m.clarify(Some(tx), space, 0, &t);
        assert!(seen.unwrap().same(&t));
        // The read was tracked through a fresh degenerate story.
        assert_eq!(m.txns[&tx].read_set.len(), 1);
    }

    #[test]
    fn test_ancient_story_is_visible_to_everyone() {
        let (mut m, space) = setup();
        let t = tuple(1);
        let sid = m.story_new(space, &t);
        let (visible, own) = m.insert_is_visible(sid, None, false);
        assert!(visible);
        assert!(!own);
    }

    #[test]
    fn test_own_in_progress_write_is_visible_only_to_owner() {
        let (mut m, space) = setup();
        let tx1 = m.begin();
        let tx2 = m.begin();
        let t = tuple(1);
        m.insert(tx1, space, t.clone()).unwrap();
        let physical = m.space(space).unwrap().index(0).get(
            &strata_index::IndexKey::new([Value::Int(1)]),
        );
        let physical = physical.unwrap();
        assert!(m.clarify(Some(tx1), space, 0, &physical).is_some());
        assert!(m.clarify(Some(tx2), space, 0, &physical).is_none());
        // tx2 observed a pending version: it holds an inplace gap now.
        assert_eq!(m.txns[&tx2].gap_list.len(), 1);
    }

    #[test]
    fn test_skipping_prepared_write_demotes_reader() {
        let (mut m, space) = setup();
        let writer = m.begin();
        m.insert(writer, space, tuple(1)).unwrap();
        let psn = m.prepare(writer).unwrap();

        let reader = m.begin_with_isolation(Isolation::ReadConfirmed);
        let physical = m
            .space(space)
            .unwrap()
            .index(0)
            .get(&strata_index::IndexKey::new([Value::Int(1)]))
            .unwrap();
        let seen = m.clarify(Some(reader), space, 0, &physical);
        assert!(seen.is_none(), "prepared change hidden from read-confirmed");
        assert_eq!(m.txns[&reader].status, TxnStatus::InReadView);
        assert_eq!(m.txns[&reader].rv_psn, psn);
    }

    #[test]
    fn test_read_committed_sees_prepared() {
        let (mut m, space) = setup();
        let writer = m.begin();
        m.insert(writer, space, tuple(1)).unwrap();
        m.prepare(writer).unwrap();

        let reader = m.begin_with_isolation(Isolation::ReadCommitted);
        let physical = m
            .space(space)
            .unwrap()
            .index(0)
            .get(&strata_index::IndexKey::new([Value::Int(1)]))
            .unwrap();
        let seen = m.clarify(Some(reader), space, 0, &physical);
        assert!(seen.is_some());
        assert_eq!(m.txns[&reader].status, TxnStatus::InProgress);
    }
}
