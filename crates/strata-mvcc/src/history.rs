//! Statement lifecycle: adding writes to history, preparation with its
//! conflict cascade, commit and rollback.
//!
//! A key's history is a chain of stories ordered by serialization time:
//! in-progress additions first, then prepared, then committed, then
//! rolled-back markers. Adding a statement physically updates every
//! index and forms the chains; preparing it sinks the new story to the
//! prepared level, rewires competing deleters, and demotes every reader
//! whose observation just became stale; rollback rewinds all of it.

use strata_index::{compare_prefix, direction, key_matches_until, DupMode, IteratorType};
use strata_types::{Psn, SpaceId, Tuple, TxnId};

use crate::arena::{StmtId, StoryId, TrackerId};
use crate::gap::{GapKind, GapLocation, PointKey};
use crate::manager::TxManager;

impl TxManager {
    // -- duplicate checking -------------------------------------------------

    /// Verify that the tuples displaced from the space's indexes do not
    /// violate the replace rules, resolving each displacement to the
    /// version visible to the writer. On success returns the visible
    /// replaced tuple (the statement's effective `old_tuple`) and whether
    /// it was the writer's own change.
    fn check_dup(
        &mut self,
        stmt_id: StmtId,
        replaced: &[Option<Tuple>],
        old_tuple: Option<&Tuple>,
        mode: DupMode,
    ) -> strata_error::Result<(Option<Tuple>, bool)> {
        let (txn, space) = {
            let stmt = &self.stmts[stmt_id];
            (stmt.txn, stmt.space)
        };

        let mut is_own_change = false;
        let visible_replaced = match &replaced[0] {
            None => None,
            Some(t) if !t.is_dirty() => Some(t.clone()),
            Some(t) => {
                let sid = self.story_get(t);
                let (visible, own) = self.find_visible_tuple(sid, Some(txn), 0, true);
                is_own_change = own;
                visible
            }
        };

        if let Err(err) =
            self.spaces[&space]
                .index(0)
                .check_dup(old_tuple, visible_replaced.as_ref(), mode)
        {
            self.track_read(Some(txn), space, visible_replaced.as_ref());
            return Err(err);
        }

        for ord in 1..self.spaces[&space].index_count() {
            // A dirty displacement's chain cannot resolve to a clean
            // tuple, but it can resolve to nothing — the only way the
            // secondary insert is legal.
            let Some(rep) = &replaced[ord as usize] else {
                continue;
            };
            let visible = if !rep.is_dirty() {
                Some(rep.clone())
            } else {
                let sid = self.story_get(rep);
                self.find_visible_tuple(sid, Some(txn), ord, true).0
            };
            if let Err(err) = self.spaces[&space].index(ord).check_dup(
                visible_replaced.as_ref(),
                visible.as_ref(),
                DupMode::Insert,
            ) {
                self.track_read(Some(txn), space, visible.as_ref());
                return Err(err);
            }
        }

        Ok((visible_replaced, is_own_change))
    }

    // -- writer-side tracker scans ------------------------------------------

    /// A tuple landed on a full key some transactions had looked up and
    /// missed: convert every waiting point hole into an inplace gap on
    /// the new story.
    pub(crate) fn handle_point_hole_write(&mut self, space: SpaceId, sid: StoryId, ord: u32) {
        debug_assert!(self.stories[sid].link(ord).newer.is_none());
        let tuple = self.stories[sid].tuple.clone();
        let key = self.tuple_declared_key(space, ord, &tuple);
        let Some(bucket) = self.point_holes.remove(&PointKey { space, ord, key }) else {
            return;
        };
        for hid in bucket {
            let txn = self.holes[hid].txn;
            self.track_story_gap(txn, sid, ord);
            if let Some(owner) = self.txns.get_mut(&txn) {
                if let Some(pos) = owner.point_holes.iter().position(|&h| h == hid) {
                    owner.point_holes.remove(pos);
                }
            }
            self.holes.free(hid);
        }
    }

    /// A tuple was inserted at a fresh position: full-scan readers of
    /// the index and nearby-gap readers of the crossed interval must be
    /// tracked against the new story. Depending on which side of a
    /// recorded range the insertion lands, a nearby tracker is left in
    /// place, moved to the new story, or split across both gaps.
    pub(crate) fn handle_gap_write(
        &mut self,
        space: SpaceId,
        sid: StoryId,
        successor: Option<&Tuple>,
        ord: u32,
    ) {
        debug_assert!(self.stories[sid].link(ord).newer.is_none());
        let tuple = self.stories[sid].tuple.clone();

        let index_items: Vec<_> = self
            .index_gaps
            .get(&(space, ord))
            .map(|l| l.to_vec())
            .unwrap_or_default();
        for gid in &index_items {
            let item = &self.gaps[*gid];
            if matches!(item.kind, GapKind::FullScan) {
                let txn = item.txn;
                self.track_story_gap(txn, sid, ord);
            }
        }

        if let Some(succ) = successor {
            if !succ.is_dirty() {
                return; // no gap records on a clean successor
            }
        }

        let list: Vec<_> = match successor {
            Some(succ) => {
                let succ_story = self.story_get(succ);
                debug_assert!(ord < self.stories[succ_story].index_count);
                self.stories[succ_story].link(ord).read_gaps.to_vec()
            }
            None => index_items,
        };

        let new_key = self.tuple_cmp_key(space, ord, &tuple);
        let cmp_parts = self.spaces[&space].index(ord).cmp_part_count();

        for gid in list {
            let (txn, iter, item_key) = match &self.gaps[gid].kind {
                GapKind::Nearby { iter, key } => (self.gaps[gid].txn, *iter, key.clone()),
                _ => continue,
            };
            let cmp: i32 = match &item_key {
                None => 0,
                Some(k) => match compare_prefix(&new_key, k) {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                },
            };
            let dir = i32::from(direction(iter));
            let is_full_key = item_key.as_ref().is_some_and(|k| k.len() == cmp_parts);
            let is_eq = iter.is_eq();
            let is_e = matches!(iter, IteratorType::Le | IteratorType::Ge);

            let need_split = item_key.is_none()
                || (dir * cmp > 0 && !is_eq)
                || (!is_full_key && cmp == 0 && (is_e || is_eq));
            let need_move = !need_split
                && ((dir < 0 && cmp > 0)
                    || (cmp > 0 && iter == IteratorType::Eq)
                    || (cmp == 0 && ((dir < 0 && is_full_key) || iter == IteratorType::Lt)));
            let need_track = need_split || (is_full_key && cmp == 0 && is_e);

            if need_track {
                self.track_story_gap(txn, sid, ord);
            }
            if need_split {
                // The insertion divided the gap in two; the old tracker
                // keeps one side, a copy covers the other.
                self.gap_new(
                    txn,
                    GapKind::Nearby {
                        iter,
                        key: item_key,
                    },
                    GapLocation::Story { story: sid, ord },
                    false,
                );
            } else if need_move {
                let old_location = self.gaps[gid].location;
                let list = match old_location {
                    GapLocation::Story { story, ord } => {
                        &mut self.stories[story].link_mut(ord).read_gaps
                    }
                    GapLocation::Index { space, ord } => {
                        self.index_gaps.entry((space, ord)).or_default()
                    }
                };
                if let Some(pos) = list.iter().position(|&g| g == gid) {
                    list.remove(pos);
                }
                self.gaps[gid].location = GapLocation::Story { story: sid, ord };
                self.stories[sid].link_mut(ord).read_gaps.push(gid);
            } else {
                debug_assert!(
                    (dir > 0 && cmp < 0)
                        || (cmp < 0 && iter == IteratorType::Req)
                        || (cmp == 0 && ((dir > 0 && is_full_key) || iter == IteratorType::Gt))
                );
            }
        }
    }

    /// A matching tuple was inserted or deleted under a recorded count:
    /// promote the counting transaction to a gap reader (insert) or a
    /// reader (delete) of the affected story, so the change conflicts.
    pub(crate) fn handle_counted_write(&mut self, space: SpaceId, sid: StoryId, ord: u32) {
        let is_insert = self.stories[sid].del_stmt.is_none();
        debug_assert!(self.stories[sid].link(ord).newer.is_none() || !is_insert);

        let tuple = self.stories[sid].tuple.clone();
        let new_key = self.tuple_cmp_key(space, ord, &tuple);

        let items: Vec<_> = self
            .index_gaps
            .get(&(space, ord))
            .map(|l| l.to_vec())
            .unwrap_or_default();
        for gid in items {
            let (txn, iter, key, until) = match &self.gaps[gid].kind {
                GapKind::Count { iter, key, until } => {
                    (self.gaps[gid].txn, *iter, key.clone(), until.clone())
                }
                _ => continue,
            };
            let until_key = until.map(|u| self.tuple_cmp_key(space, ord, &u));
            if key_matches_until(&new_key, iter, key.as_ref(), until_key.as_ref()) {
                if is_insert {
                    // The counter read this range and found nothing here.
                    self.track_story_gap(txn, sid, ord);
                } else {
                    // The counter effectively read this tuple.
                    self.track_read_story(Some(txn), sid);
                }
            }
        }
    }

    // -- add ---------------------------------------------------------------

    /// Add a statement to history. Insert path when `new_tuple` is
    /// present, delete path otherwise; returns the effective old tuple.
    pub(crate) fn history_add_stmt(
        &mut self,
        stmt_id: StmtId,
        old_tuple: Option<Tuple>,
        new_tuple: Option<Tuple>,
        mode: DupMode,
    ) -> strata_error::Result<Option<Tuple>> {
        debug_assert!(new_tuple.is_some() || old_tuple.is_some());
        self.story_gc();
        match new_tuple {
            Some(new_tuple) => self.history_add_insert_stmt(stmt_id, old_tuple, new_tuple, mode),
            None => {
                let old = old_tuple.expect("delete statement without a tuple");
                self.history_add_delete_stmt(stmt_id, old)
            }
        }
    }

    fn history_add_insert_stmt(
        &mut self,
        stmt_id: StmtId,
        old_tuple: Option<Tuple>,
        new_tuple: Tuple,
        mode: DupMode,
    ) -> strata_error::Result<Option<Tuple>> {
        debug_assert!(!new_tuple.is_dirty());
        let (txn, space) = {
            let stmt = &self.stmts[stmt_id];
            (stmt.txn, stmt.space)
        };
        let index_count = self.spaces[&space].index_count();

        // The story must exist before the physical replaces so the tuple
        // is dirty while user code (functional keys) can observe it.
        let add_story = self.story_new(space, &new_tuple);

        let mut replaced: Vec<Option<Tuple>> = Vec::with_capacity(index_count as usize);
        let mut successors: Vec<Option<Tuple>> = Vec::with_capacity(index_count as usize);
        for ord in 0..index_count {
            let (rep, succ) = self
                .spaces
                .get_mut(&space)
                .expect("live space")
                .index_mut(ord)
                .replace(None, Some(&new_tuple));
            replaced.push(rep);
            successors.push(succ);
        }

        let (visible_replaced, is_own_change) =
            match self.check_dup(stmt_id, &replaced, old_tuple.as_ref(), mode) {
                Ok(ok) => ok,
                Err(err) => {
                    // Duplicate key: physically undo every replace, newest
                    // first, and drop the unborn story.
                    for ord in (0..index_count).rev() {
                        self.spaces
                            .get_mut(&space)
                            .expect("live space")
                            .index_mut(ord)
                            .replace(Some(&new_tuple), replaced[ord as usize].as_ref());
                    }
                    self.story_delete(add_story);
                    return Err(err);
                }
            };
        self.stmts[stmt_id].is_own_change = is_own_change;

        self.story_link_added_by(add_story, stmt_id);

        // The tuple displaced from the primary index gets a story now if
        // it never had one.
        let next_pk = replaced[0].clone();
        let next_pk_story = match &next_pk {
            Some(t) if t.is_dirty() => Some(self.story_get(t)),
            Some(t) => Some(self.story_new(space, t)),
            None => None,
        };

        // Collect conflicts or form chains, per index.
        for ord in 0..index_count {
            match replaced[ord as usize].clone() {
                None => {
                    self.handle_gap_write(space, add_story, successors[ord as usize].as_ref(), ord);
                    self.handle_point_hole_write(space, add_story, ord);
                    self.handle_counted_write(space, add_story, ord);
                    self.story_link_top(add_story, None, ord, true);
                }
                Some(next) => {
                    let next_story = if next_pk.as_ref().is_some_and(|t| t.same(&next)) {
                        next_pk_story.expect("story of displaced pk tuple")
                    } else {
                        debug_assert!(next.is_dirty());
                        self.story_get(&next)
                    };
                    self.story_link_top(add_story, Some(next_story), ord, true);
                }
            }
        }

        // The visibility-resolved old tuple is what this statement
        // deletes.
        let mut del_story = None;
        if let Some(old) = &visible_replaced {
            debug_assert!(old.is_dirty());
            let ds = if next_pk.as_ref().is_some_and(|t| t.same(old)) {
                next_pk_story.expect("story of displaced pk tuple")
            } else {
                self.story_get(old)
            };
            self.story_link_deleted_by(ds, stmt_id);
            del_story = Some(ds);
        }

        // An INSERT asserted the absence of the key; defend that
        // observation so a later concurrent write conflicts. A statement
        // following this transaction's own change needs no defense: its
        // precondition is guaranteed by serialization with itself.
        if !is_own_change && mode == DupMode::Insert {
            debug_assert!(del_story.is_none());
            match del_story {
                None => self.track_story_gap(txn, add_story, 0),
                Some(ds) => self.track_read_story(Some(txn), ds),
            }
        }

        Ok(visible_replaced)
    }

    fn history_add_delete_stmt(
        &mut self,
        stmt_id: StmtId,
        old_tuple: Tuple,
    ) -> strata_error::Result<Option<Tuple>> {
        // The old tuple reached us through clarification, so its story
        // exists and already carries this transaction's read tracker.
        debug_assert!(old_tuple.is_dirty());
        let del_story = self.story_get(&old_tuple);

        if let Some(add_stmt) = self.stories[del_story].add_stmt {
            let own = self.stmts[add_stmt].txn == self.stmts[stmt_id].txn;
            self.stmts[stmt_id].is_own_change = own;
        }
        self.story_link_deleted_by(del_story, stmt_id);

        // Anyone who counted this tuple must learn of the deletion.
        let space = self.stmts[stmt_id].space;
        for ord in 0..self.spaces[&space].index_count() {
            self.handle_counted_write(space, del_story, ord);
        }

        if !self.stories[del_story].tuple_is_retained {
            self.track_retained_tuple(del_story);
        }

        Ok(Some(old_tuple))
    }

    // -- prepare ------------------------------------------------------------

    /// Demote every reader of a story whose version is ending, except
    /// the writer itself.
    fn handle_conflict_story_readers(&mut self, sid: StoryId, writer: TxnId, psn: Psn) {
        let readers: Vec<TrackerId> = self.stories[sid].readers.to_vec();
        for tid in readers {
            let reader = self.trackers[tid].reader;
            if reader != writer {
                self.send_to_read_view(reader, psn);
            }
        }
    }

    /// Demote every inplace-gap holder on a chain head, except the
    /// writer itself.
    fn handle_conflict_gap_readers(&mut self, top: StoryId, ord: u32, writer: TxnId, psn: Psn) {
        debug_assert!(self.stories[top].link(ord).newer.is_none());
        let items: Vec<_> = self.stories[top].link(ord).read_gaps.to_vec();
        for gid in items {
            let item = &self.gaps[gid];
            if item.txn == writer || !matches!(item.kind, GapKind::Inplace) {
                continue;
            }
            let txn = item.txn;
            self.send_to_read_view(txn, psn);
        }
    }

    /// Prepare a statement under its transaction's freshly assigned PSN.
    pub(crate) fn history_prepare_stmt(&mut self, stmt_id: StmtId) {
        debug_assert!(self.txns[&self.stmts[stmt_id].txn].psn.is_some());
        if self.stmts[stmt_id].add_story.is_some() {
            self.history_prepare_insert_stmt(stmt_id);
        } else if self.stmts[stmt_id].del_story.is_some() {
            self.history_prepare_delete_stmt(stmt_id);
        }
        // A deletion of nothing has no stories, and nothing to do here.
        self.story_gc();
    }

    fn history_prepare_insert_stmt(&mut self, stmt_id: StmtId) {
        let story = self.stmts[stmt_id].add_story.expect("insert statement");
        let txn = self.stmts[stmt_id].txn;
        let psn = self.txns[&txn].psn;
        let index_count = self.stories[story].index_count;

        // Sink the story below the remaining in-progress additions, so
        // prepared versions precede in-progress ones in every chain.
        for ord in 0..index_count {
            loop {
                let Some(old_story) = self.stories[story].link(ord).older else {
                    break;
                };
                let old = &self.stories[old_story];
                if old.add_psn.is_some() || old.add_stmt.is_none() {
                    // Prepared, committed or rolled back: sunk far enough.
                    break;
                }
                self.story_reorder(story, old_story, ord);
            }
        }

        #[cfg(debug_assertions)]
        {
            let old_story = self.stories[story].link(0).older;
            match self.stmts[stmt_id].del_story {
                None => debug_assert!(
                    old_story.is_none() || self.stories[old_story.unwrap()].del_psn.is_some()
                ),
                Some(ds) => debug_assert_eq!(old_story, Some(ds)),
            }
        }

        // Rewire in-progress deleters in the primary chain.
        match self.stmts[stmt_id].del_story {
            None => {
                // This statement replaced nothing: in-progress writers
                // above us who also replaced nothing now replace this
                // tuple, and must be told so.
                let mut cur = self.stories[story].link(0).newer;
                while let Some(test_story) = cur {
                    cur = self.stories[test_story].link(0).newer;
                    let Some(test_stmt) = self.stories[test_story].add_stmt else {
                        continue;
                    };
                    if self.stmts[test_stmt].is_own_change {
                        continue;
                    }
                    debug_assert!(self.stmts[test_stmt].txn != txn);
                    debug_assert!(self.stmts[test_stmt].del_story.is_none());
                    debug_assert!(self.txns[&self.stmts[test_stmt].txn].psn.is_none());
                    self.story_link_deleted_by(story, test_stmt);
                }
            }
            Some(del_story) => {
                // This statement replaced an older story: in-progress
                // deleters of that story now delete this tuple instead.
                let mut others = Vec::new();
                let mut cur = self.stories[del_story].del_stmt;
                while let Some(s) = cur {
                    cur = self.stmts[s].next_in_del_list;
                    if s != stmt_id {
                        debug_assert!(self.stmts[s].txn != txn);
                        debug_assert!(self.txns[&self.stmts[s].txn].psn.is_none());
                        others.push(s);
                    }
                }
                for other in others {
                    self.story_unlink_deleted_by(del_story, other);
                    self.story_link_deleted_by(story, other);
                }
            }
        }

        // Main conflicts.
        match self.stmts[stmt_id].del_story {
            Some(del_story) => {
                // That story ends now; everyone who read it must go to a
                // read view or be aborted.
                self.handle_conflict_story_readers(del_story, txn, psn);
            }
            None => {
                // A tuple appeared; everyone who depended on the absence
                // in the primary index must be demoted. Secondary
                // indexes are handled below.
                let top = self.story_find_top(story, 0);
                self.handle_conflict_gap_readers(top, 0, txn, psn);
            }
        }

        // Secondary cross-write conflicts. An in-progress writer whose
        // secondary key collides with this newly prepared version must
        // be demoted — unless it overwrites the same row in the primary
        // too, which is a legitimate overwrite, or it follows its own
        // earlier delete.
        for ord in 1..index_count {
            let mut top = story;
            let mut cur = self.stories[story].link(ord).newer;
            while let Some(newer_story) = cur {
                top = newer_story;
                cur = self.stories[newer_story].link(ord).newer;
                let Some(test_stmt) = self.stories[newer_story].add_stmt else {
                    continue;
                };
                let test_txn = self.stmts[test_stmt].txn;
                if test_txn == txn {
                    continue;
                }
                if self.stmts[test_stmt].is_own_change && self.stmts[test_stmt].del_story.is_none()
                {
                    continue;
                }
                if self.stmts[test_stmt].del_story == Some(story) {
                    continue;
                }
                self.send_to_read_view(test_txn, psn);
            }
            // Gap readers of the secondary head: any statement kind can
            // introduce a new secondary key.
            self.handle_conflict_gap_readers(top, ord, txn, psn);
        }

        // Stamp the PSNs last.
        self.stories[story].add_psn = psn;
        if let Some(del_story) = self.stmts[stmt_id].del_story {
            self.stories[del_story].del_psn = psn;
        }
    }

    fn history_prepare_delete_stmt(&mut self, stmt_id: StmtId) {
        debug_assert!(self.stmts[stmt_id].add_story.is_none());
        let del_story = self.stmts[stmt_id].del_story.expect("delete statement");
        let txn = self.stmts[stmt_id].txn;
        let psn = self.txns[&txn].psn;

        // Competing in-progress deleters are unlinked: the story ends
        // here, and their transactions are doomed to a read-write
        // conflict anyway.
        let mut others = Vec::new();
        let mut cur = self.stories[del_story].del_stmt;
        while let Some(s) = cur {
            cur = self.stmts[s].next_in_del_list;
            if s != stmt_id {
                debug_assert!(self.stmts[s].txn != txn);
                debug_assert!(self.txns[&self.stmts[s].txn].psn.is_none());
                others.push(s);
            }
        }
        for other in others {
            self.story_unlink_deleted_by(del_story, other);
        }

        self.handle_conflict_story_readers(del_story, txn, psn);

        self.stories[del_story].del_psn = psn;
    }

    // -- commit -------------------------------------------------------------

    /// Commit a prepared statement: fold the replacement into the space
    /// statistic and detach the statement from its stories.
    pub(crate) fn history_commit_stmt(&mut self, stmt_id: StmtId) {
        let space = self.stmts[stmt_id].space;
        let old = self.stmts[stmt_id]
            .del_story
            .map(|s| self.stories[s].tuple.clone());
        let new = self.stmts[stmt_id]
            .add_story
            .map(|s| self.stories[s].tuple.clone());
        if let Some(sp) = self.spaces.get_mut(&space) {
            sp.update_stat(old.as_ref(), new.as_ref());
        }

        if let Some(add_story) = self.stmts[stmt_id].add_story {
            debug_assert_eq!(self.stories[add_story].add_stmt, Some(stmt_id));
            self.story_unlink_added_by(add_story, stmt_id);
        }
        if let Some(del_story) = self.stmts[stmt_id].del_story {
            debug_assert_eq!(self.stories[del_story].del_stmt, Some(stmt_id));
            self.story_unlink_deleted_by(del_story, stmt_id);
        }
        self.story_gc();
    }

    // -- rollback -----------------------------------------------------------

    /// Abort every transaction that read `sid`.
    fn abort_story_readers(&mut self, sid: StoryId) {
        let readers: Vec<TrackerId> = self.stories[sid].readers.to_vec();
        for tid in readers {
            let reader = self.trackers[tid].reader;
            self.abort_with_conflict(reader);
        }
    }

    /// Abort every transaction that observed the absence of `sid`'s
    /// version. Gap trackers live on chain heads only.
    fn abort_gap_readers(&mut self, sid: StoryId) {
        for ord in 0..self.stories[sid].index_count {
            let top = self.story_find_top(sid, ord);
            let items: Vec<_> = self.stories[top].link(ord).read_gaps.to_vec();
            for gid in items {
                let item = &self.gaps[gid];
                if matches!(item.kind, GapKind::Inplace) {
                    let txn = item.txn;
                    self.abort_with_conflict(txn);
                }
            }
        }
    }

    fn history_rollback_added_story(&mut self, stmt_id: StmtId) {
        let add_story = self.stmts[stmt_id].add_story.expect("added story");
        let del_story = self.stmts[stmt_id].del_story;
        let txn = self.stmts[stmt_id].txn;

        if self.txns[&txn].psn.is_some() {
            // Preparation rewired in-progress deleters onto this story;
            // rollback is in reverse statement order, so no statement of
            // our own transaction can still delete it. Everything in the
            // deleter list goes back to the prior story, or to nothing.
            while let Some(test_stmt) = self.stories[add_story].del_stmt {
                debug_assert!(self.stmts[test_stmt].txn != txn);
                debug_assert!(!self.stmts[test_stmt].is_own_change);
                debug_assert!(self.txns[&self.stmts[test_stmt].txn].psn.is_none());
                self.story_unlink_deleted_by(add_story, test_stmt);
                if let Some(ds) = del_story {
                    self.story_link_deleted_by(ds, test_stmt);
                }
            }

            self.stories[add_story].add_psn = Psn::NONE;
            if let Some(ds) = del_story {
                self.stories[ds].del_psn = Psn::NONE;
            }

            // Whoever managed to read the prepared state raced a
            // transaction that failed; they must be aborted.
            self.abort_story_readers(add_story);
        }

        self.story_unlink_added_by(add_story, stmt_id);
        if let Some(ds) = del_story {
            self.story_unlink_deleted_by(ds, stmt_id);
        }

        // Sink the story to the bottom of every chain (physically
        // restoring the previous head on the way) and mark it deleted in
        // the remote past: invisible to every reader, still able to hold
        // a read set if one remains.
        let index_count = self.stories[add_story].index_count;
        for ord in 0..index_count {
            while let Some(old_story) = self.stories[add_story].link(ord).older {
                self.story_reorder(add_story, old_story, ord);
            }
        }
        self.stories[add_story].del_psn = Psn::ROLLBACKED;
    }

    fn history_rollback_deleted_story(&mut self, stmt_id: StmtId) {
        let del_story = self.stmts[stmt_id].del_story.expect("deleted story");
        let txn = self.stmts[stmt_id].txn;

        if self.txns[&txn].psn.is_some() {
            // Preparation unlinked other would-be deleters; the
            // replace-like ones are still findable in the primary chain
            // above us and get their link back. Pure deletes are not in
            // any chain, but their transactions are already conflicted
            // by the read-write conflict, so they no longer matter.
            let mut cur = self.stories[del_story].link(0).newer;
            while let Some(test_story) = cur {
                cur = self.stories[test_story].link(0).newer;
                let Some(test_stmt) = self.stories[test_story].add_stmt else {
                    continue;
                };
                if self.stmts[test_stmt].is_own_change {
                    continue;
                }
                debug_assert!(self.stmts[test_stmt].txn != txn);
                debug_assert!(self.stmts[test_stmt].del_story.is_none());
                debug_assert!(self.txns[&self.stmts[test_stmt].txn].psn.is_none());
                self.story_link_deleted_by(del_story, test_stmt);
            }

            self.stories[del_story].del_psn = Psn::NONE;

            // Whoever read the absence of this story raced the failed
            // deletion.
            self.abort_gap_readers(del_story);
        }

        self.story_unlink_deleted_by(del_story, stmt_id);
    }

    /// Roll back a statement with no stories attached: either it never
    /// had any (a deletion that found nothing), or a space invalidation
    /// destroyed them. The DDL owner and transactions prepared before
    /// the DDL restore the physical index content from the statement's
    /// saved tuples; concurrent bystanders were already handled at
    /// invalidation and do nothing.
    fn history_rollback_empty_stmt(&mut self, stmt_id: StmtId) {
        let txn = self.stmts[stmt_id].txn;
        let schema_changed = self.txns[&txn].is_schema_changed;
        if !schema_changed && self.txns[&txn].psn.is_none() {
            return;
        }
        let rollback_old = self.stmts[stmt_id].rollback_old.clone();
        let rollback_new = self.stmts[stmt_id].rollback_new.clone();
        if rollback_old.is_none() && rollback_new.is_none() {
            return;
        }
        let space = self.stmts[stmt_id].space;
        let Some(sp) = self.spaces.get_mut(&space) else {
            return;
        };
        for ord in 0..sp.index_count() {
            sp.index_mut(ord)
                .replace(rollback_new.as_ref(), rollback_old.as_ref());
        }
    }

    /// Roll a statement back, physically and logically.
    pub(crate) fn history_rollback_stmt(&mut self, stmt_id: StmtId) {
        #[cfg(debug_assertions)]
        {
            let stmt = &self.stmts[stmt_id];
            let psn = self.txns[&stmt.txn].psn;
            if let Some(add) = stmt.add_story {
                debug_assert!(self.stories[add]
                    .tuple
                    .same(stmt.rollback_new.as_ref().expect("saved new tuple")));
                debug_assert_eq!(self.stories[add].add_psn, psn);
            }
            if let Some(del) = stmt.del_story {
                debug_assert_eq!(self.stories[del].del_psn, psn);
            }
            // At most one prepared statement may delete a story at a time.
            debug_assert!(psn.is_none() || stmt.next_in_del_list.is_none());
        }

        if self.stmts[stmt_id].add_story.is_some() {
            self.history_rollback_added_story(stmt_id);
        } else if self.stmts[stmt_id].del_story.is_some() {
            self.history_rollback_deleted_story(stmt_id);
        } else {
            self.history_rollback_empty_stmt(stmt_id);
        }
        debug_assert!(self.stmts[stmt_id].add_story.is_none());
        debug_assert!(self.stmts[stmt_id].del_story.is_none());
    }
}
