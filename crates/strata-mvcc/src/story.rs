//! Stories: per-tuple version records and their per-index chains.
//!
//! A story is a part of the history of a value in a space: from the point
//! its tuple was added to the point it was deleted. Stories of the same
//! key of each index are linked into a chain, newest first, and the chain
//! head is the story whose tuple the index physically stores — the
//! top-of-chain invariant everything else leans on.

use smallvec::SmallVec;
use strata_types::{Psn, SpaceId, Tuple};

use crate::arena::{GapId, StmtId, StoryId, TrackerId};
use crate::gc::GC_STEPS_PER_STORY;
use crate::manager::TxManager;
use crate::stats::story_size;

/// Why a story cannot be collected yet. Maintained for statistics; the
/// collector recomputes it on every visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoryStatus {
    /// Referenced by a statement, a reader, or pinned by chain shape.
    Used = 0,
    /// May still be needed by an active read view.
    ReadView = 1,
    /// Holds gap trackers.
    TrackGap = 2,
}

pub const STORY_STATUS_COUNT: usize = 3;

/// Per-index link of a story.
pub struct StoryLink {
    /// Story that happened after this one ended.
    pub newer: Option<StoryId>,
    /// Story that happened before this one started.
    pub older: Option<StoryId>,
    /// Gap items whose location is this story in this index. Only the
    /// chain head may hold any.
    pub read_gaps: Vec<GapId>,
    /// Whether this story's tuple is what the index physically stores.
    /// True only for the chain head.
    pub in_index: bool,
}

/// A version record for a tuple in a specific space.
pub struct Story {
    /// The referenced tuple.
    pub tuple: Tuple,
    pub space: SpaceId,
    /// Statement introducing this version; cleared on commit.
    pub add_stmt: Option<StmtId>,
    /// PSN of the introducing transaction, assigned at preparation.
    pub add_psn: Psn,
    /// Head of the list of statements intending to delete this version.
    pub del_stmt: Option<StmtId>,
    /// PSN of the deleting transaction, assigned at preparation.
    pub del_psn: Psn,
    /// Read trackers pinning this story, most recently used at the back.
    pub readers: Vec<TrackerId>,
    /// Number of indexes of the space at creation time.
    pub index_count: u32,
    pub status: StoryStatus,
    /// The tuple is no longer in the primary index and this story holds
    /// the only strong reference.
    pub tuple_is_retained: bool,
    /// A functional key is cached for this tuple.
    pub has_func_key: bool,
    /// One link per index.
    pub links: SmallVec<[StoryLink; 4]>,
    /// Links in the global story list the collector crawls.
    pub(crate) all_prev: Option<StoryId>,
    pub(crate) all_next: Option<StoryId>,
}

impl Story {
    #[inline]
    pub fn link(&self, ord: u32) -> &StoryLink {
        &self.links[ord as usize]
    }

    #[inline]
    pub fn link_mut(&mut self, ord: u32) -> &mut StoryLink {
        &mut self.links[ord as usize]
    }
}

impl TxManager {
    /// Allocate a story for `tuple`, publish it in the per-tuple hash and
    /// the story lists, and mark the tuple dirty.
    ///
    /// Used in two scenarios: for a clean tuple already in the space (a
    /// degenerate one-story chain) and for a new tuple about to be
    /// inserted (the chains are then formed with [`TxManager::story_link_top`]).
    /// Either way the story starts as the head of every chain, so every
    /// `in_index` marker is set.
    pub(crate) fn story_new(&mut self, space: SpaceId, tuple: &Tuple) -> StoryId {
        self.must_do_gc_steps += GC_STEPS_PER_STORY;
        assert!(!tuple.is_dirty(), "tuple already has a story");
        let index_count = self.spaces[&space].index_count();
        let links = (0..index_count)
            .map(|_| StoryLink {
                newer: None,
                older: None,
                read_gaps: Vec::new(),
                in_index: true,
            })
            .collect();
        let story = Story {
            tuple: tuple.clone(),
            space,
            add_stmt: None,
            add_psn: Psn::NONE,
            del_stmt: None,
            del_psn: Psn::NONE,
            readers: Vec::new(),
            index_count,
            status: StoryStatus::Used,
            tuple_is_retained: false,
            has_func_key: false,
            links,
            all_prev: None,
            all_next: None,
        };
        let size = story_size(&story);
        let sid = self.stories.alloc(story);
        let replaced = self.history.insert(tuple.addr(), sid);
        debug_assert!(replaced.is_none());
        tuple.set_dirty(true);
        self.stats.collect_story(StoryStatus::Used, size);
        self.all_list_push_tail(sid);
        self.space_stories.entry(space).or_default().insert(sid);
        sid
    }

    /// Delete a story. Expects the story to be fully unlinked.
    pub(crate) fn story_delete(&mut self, sid: StoryId) {
        {
            let story = &self.stories[sid];
            debug_assert!(story.add_stmt.is_none());
            debug_assert!(story.del_stmt.is_none());
            debug_assert!(story.readers.is_empty());
            for link in &story.links {
                debug_assert!(link.newer.is_none());
                debug_assert!(link.older.is_none());
                debug_assert!(link.read_gaps.is_empty());
            }
        }
        if self.stories[sid].has_func_key {
            self.clear_func_keys(sid);
        }
        let story = &self.stories[sid];
        let (status, size) = (story.status, story_size(story));
        self.stats.discard_story(status, size);
        if self.stories[sid].tuple_is_retained {
            self.untrack_retained_tuple(sid);
        }

        if self.gc_cursor == Some(sid) {
            self.gc_cursor = self.stories[sid].all_next;
        }
        self.all_list_remove(sid);
        let space = self.stories[sid].space;
        if let Some(set) = self.space_stories.get_mut(&space) {
            set.remove(&sid);
        }

        let tuple = self.stories[sid].tuple.clone();
        let removed = self.history.remove(&tuple.addr());
        debug_assert_eq!(removed, Some(sid));
        tuple.set_dirty(false);
        self.stories.free(sid);
    }

    /// Find the story of a dirty tuple.
    pub(crate) fn story_get(&self, tuple: &Tuple) -> StoryId {
        debug_assert!(tuple.is_dirty());
        let sid = *self
            .history
            .get(&tuple.addr())
            .expect("dirty tuple has no story");
        #[cfg(debug_assertions)]
        {
            let story = &self.stories[sid];
            if let Some(stmt) = story.add_stmt {
                let owner = self.stmts[stmt].txn;
                debug_assert_eq!(story.add_psn, self.txn_psn(owner));
            }
            if let Some(stmt) = story.del_stmt {
                let owner = self.stmts[stmt].txn;
                debug_assert_eq!(story.del_psn, self.txn_psn(owner));
            }
        }
        sid
    }

    #[cfg(debug_assertions)]
    fn txn_psn(&self, txn: strata_types::TxnId) -> Psn {
        self.txns.get(&txn).map_or(Psn::NONE, |t| t.psn)
    }

    // -- statement linkage --------------------------------------------------

    pub(crate) fn story_link_added_by(&mut self, sid: StoryId, stmt_id: StmtId) {
        debug_assert!(self.stories[sid].add_stmt.is_none());
        debug_assert!(self.stmts[stmt_id].add_story.is_none());
        self.stories[sid].add_stmt = Some(stmt_id);
        self.stmts[stmt_id].add_story = Some(sid);
    }

    pub(crate) fn story_unlink_added_by(&mut self, sid: StoryId, stmt_id: StmtId) {
        debug_assert_eq!(self.stmts[stmt_id].add_story, Some(sid));
        debug_assert_eq!(self.stories[sid].add_stmt, Some(stmt_id));
        self.stmts[stmt_id].add_story = None;
        self.stories[sid].add_stmt = None;
    }

    pub(crate) fn story_link_deleted_by(&mut self, sid: StoryId, stmt_id: StmtId) {
        debug_assert!(self.stmts[stmt_id].del_story.is_none());
        debug_assert!(self.stmts[stmt_id].next_in_del_list.is_none());
        let head = self.stories[sid].del_stmt;
        let stmt = &mut self.stmts[stmt_id];
        stmt.del_story = Some(sid);
        stmt.next_in_del_list = head;
        self.stories[sid].del_stmt = Some(stmt_id);
    }

    pub(crate) fn story_unlink_deleted_by(&mut self, sid: StoryId, stmt_id: StmtId) {
        debug_assert_eq!(self.stmts[stmt_id].del_story, Some(sid));
        if self.stories[sid].del_stmt == Some(stmt_id) {
            self.stories[sid].del_stmt = self.stmts[stmt_id].next_in_del_list;
        } else {
            let mut cur = self.stories[sid].del_stmt.expect("deleter not in list");
            while self.stmts[cur].next_in_del_list != Some(stmt_id) {
                cur = self.stmts[cur].next_in_del_list.expect("deleter not in list");
            }
            self.stmts[cur].next_in_del_list = self.stmts[stmt_id].next_in_del_list;
        }
        let stmt = &mut self.stmts[stmt_id];
        stmt.next_in_del_list = None;
        stmt.del_story = None;
    }

    // -- chain surgery ------------------------------------------------------

    /// Link `sid` above `old` in index `ord` (both directions). `old` is
    /// allowed to be absent.
    pub(crate) fn story_link(&mut self, sid: StoryId, old: Option<StoryId>, ord: u32) {
        debug_assert!(self.stories[sid].link(ord).older.is_none());
        let Some(old) = old else { return };
        debug_assert!(self.stories[old].link(ord).newer.is_none());
        self.stories[sid].link_mut(ord).older = Some(old);
        self.stories[old].link_mut(ord).newer = Some(sid);
    }

    /// Undo [`TxManager::story_link`].
    pub(crate) fn story_unlink(&mut self, sid: StoryId, old: Option<StoryId>, ord: u32) {
        debug_assert_eq!(self.stories[sid].link(ord).older, old);
        let Some(old) = old else { return };
        debug_assert_eq!(self.stories[old].link(ord).newer, Some(sid));
        self.stories[sid].link_mut(ord).older = None;
        self.stories[old].link_mut(ord).newer = None;
    }

    /// Make `new_top` the head of the chain in index `ord`.
    ///
    /// With `is_new_tuple`, `new_top` is a freshly created story whose
    /// tuple was just physically inserted, and `old_top` is the previous
    /// head (or absent for an empty chain). Otherwise `old_top` is the
    /// current head and `new_top` sits right below it; the chain is
    /// reordered and the index physically rebound to `new_top`'s tuple.
    ///
    /// Either way the `in_index` marker and the gap items move from the
    /// old head to the new one, and for the primary index the strong
    /// primary reference follows.
    pub(crate) fn story_link_top(
        &mut self,
        new_top: StoryId,
        old_top: Option<StoryId>,
        ord: u32,
        is_new_tuple: bool,
    ) {
        assert!(old_top.is_some() || is_new_tuple);
        let Some(old_top) = old_top else {
            if ord == 0 {
                self.ref_to_primary(new_top);
            }
            return;
        };
        debug_assert!(self.stories[old_top].link(ord).in_index);
        debug_assert!(self.stories[old_top].link(ord).newer.is_none());
        if is_new_tuple {
            debug_assert!(self.stories[new_top].link(ord).newer.is_none());
            debug_assert!(self.stories[new_top].link(ord).older.is_none());
        } else {
            debug_assert_eq!(self.stories[new_top].link(ord).newer, Some(old_top));
            debug_assert_eq!(self.stories[old_top].link(ord).older, Some(new_top));
        }

        if !is_new_tuple {
            // Rebind the index to the new head's tuple.
            let old_tuple = self.stories[old_top].tuple.clone();
            let new_tuple = self.stories[new_top].tuple.clone();
            let space = self.stories[new_top].space;
            let (removed, _) = self
                .spaces
                .get_mut(&space)
                .expect("space of a live story")
                .index_mut(ord)
                .replace(Some(&old_tuple), Some(&new_tuple));
            debug_assert!(removed.is_some_and(|t| t.same(&old_tuple)));
        }

        if is_new_tuple {
            self.story_link(new_top, Some(old_top), ord);
            debug_assert!(self.stories[new_top].link(ord).in_index);
            self.stories[old_top].link_mut(ord).in_index = false;
        } else {
            let older = self.stories[new_top].link(ord).older;
            self.story_unlink(old_top, Some(new_top), ord);
            self.story_unlink(new_top, older, ord);
            self.story_link(new_top, Some(old_top), ord);
            self.story_link(old_top, older, ord);
            self.stories[new_top].link_mut(ord).in_index = true;
            self.stories[old_top].link_mut(ord).in_index = false;
        }

        // Tuples physically in the primary index carry the strong space
        // reference; it must follow the head.
        if ord == 0 {
            self.ref_to_primary(new_top);
            self.unref_from_primary(old_top);
        }

        // Gap records always live on the head; rebind them.
        let moved: Vec<GapId> = std::mem::take(&mut self.stories[old_top].link_mut(ord).read_gaps);
        for &gid in &moved {
            self.gaps[gid].location = crate::gap::GapLocation::Story {
                story: new_top,
                ord,
            };
        }
        self.stories[new_top].link_mut(ord).read_gaps.extend(moved);
    }

    /// Swap two adjacent stories in a chain (`old_story` moves above
    /// `story`), without changing which tuple the index stores unless
    /// `story` was the head.
    pub(crate) fn story_reorder(&mut self, sid: StoryId, old_story: StoryId, ord: u32) {
        debug_assert_eq!(self.stories[sid].link(ord).older, Some(old_story));
        debug_assert_eq!(self.stories[old_story].link(ord).newer, Some(sid));
        let newer = self.stories[sid].link(ord).newer;
        let older = self.stories[old_story].link(ord).older;

        if let Some(newer) = newer {
            self.story_unlink(newer, Some(sid), ord);
            self.story_unlink(sid, Some(old_story), ord);
            self.story_unlink(old_story, older, ord);

            self.story_link(newer, Some(old_story), ord);
            self.story_link(old_story, Some(sid), ord);
            self.story_link(sid, older, ord);
        } else {
            // `sid` was the head: the swap makes `old_story` the new head.
            self.story_link_top(old_story, Some(sid), ord, false);
        }
    }

    /// The head of the chain containing `sid` in index `ord`.
    pub(crate) fn story_find_top(&self, mut sid: StoryId, ord: u32) -> StoryId {
        while let Some(newer) = self.stories[sid].link(ord).newer {
            sid = newer;
        }
        sid
    }

    // -- primary reference / retained bookkeeping ---------------------------

    /// The story's tuple entered the primary index.
    pub(crate) fn ref_to_primary(&mut self, sid: StoryId) {
        if self.stories[sid].tuple_is_retained {
            self.untrack_retained_tuple(sid);
        }
    }

    /// The story's tuple was displaced from the primary index; the story
    /// now holds the only strong reference.
    pub(crate) fn unref_from_primary(&mut self, sid: StoryId) {
        if !self.stories[sid].tuple_is_retained {
            self.track_retained_tuple(sid);
        }
    }

    pub(crate) fn track_retained_tuple(&mut self, sid: StoryId) {
        let story = &mut self.stories[sid];
        debug_assert!(!story.tuple_is_retained);
        story.tuple_is_retained = true;
        let (status, size) = (story.status, story.tuple.bsize());
        self.stats.collect_retained(status, size);
    }

    pub(crate) fn untrack_retained_tuple(&mut self, sid: StoryId) {
        let story = &mut self.stories[sid];
        debug_assert!(story.tuple_is_retained);
        story.tuple_is_retained = false;
        let (status, size) = (story.status, story.tuple.bsize());
        self.stats.discard_retained(status, size);
    }

    /// Reclassify a story, moving its statistics between buckets.
    pub(crate) fn story_set_status(&mut self, sid: StoryId, new_status: StoryStatus) {
        let story = &self.stories[sid];
        let old_status = story.status;
        if old_status == new_status {
            return;
        }
        let size = story_size(story);
        let tuple_size = story.tuple.bsize();
        let retained = story.tuple_is_retained;
        self.stories[sid].status = new_status;
        self.stats.discard_story(old_status, size);
        self.stats.collect_story(new_status, size);
        if retained {
            self.stats.discard_retained(old_status, tuple_size);
            self.stats.collect_retained(new_status, tuple_size);
        }
    }

    // -- global story list --------------------------------------------------

    pub(crate) fn all_list_push_tail(&mut self, sid: StoryId) {
        self.stories[sid].all_prev = self.all_tail;
        self.stories[sid].all_next = None;
        match self.all_tail {
            Some(tail) => self.stories[tail].all_next = Some(sid),
            None => self.all_head = Some(sid),
        }
        self.all_tail = Some(sid);
    }

    pub(crate) fn all_list_remove(&mut self, sid: StoryId) {
        let (prev, next) = {
            let story = &self.stories[sid];
            (story.all_prev, story.all_next)
        };
        match prev {
            Some(p) => self.stories[p].all_next = next,
            None => self.all_head = next,
        }
        match next {
            Some(n) => self.stories[n].all_prev = prev,
            None => self.all_tail = prev,
        }
        let story = &mut self.stories[sid];
        story.all_prev = None;
        story.all_next = None;
    }

    /// Fully unlink a story when its whole space is being torn down:
    /// chains, statements, gap items and readers all go, with no attempt
    /// to keep the top-of-chain invariant (the index is being rebuilt).
    pub(crate) fn story_full_unlink_on_space_delete(&mut self, sid: StoryId) {
        let index_count = self.stories[sid].index_count;
        for ord in 0..index_count {
            let link_newer = self.stories[sid].link(ord).newer;
            match link_newer {
                None => {
                    debug_assert!(!self.stories[sid].link(ord).in_index);
                    let older = self.stories[sid].link(ord).older;
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

        if let Some(stmt) = self.stories[sid].add_stmt {
            self.story_unlink_added_by(sid, stmt);
        }
        while let Some(stmt) = self.stories[sid].del_stmt {
            self.story_unlink_deleted_by(sid, stmt);
        }

        for ord in 0..index_count {
            while let Some(&gid) = self.stories[sid].link(ord).read_gaps.first() {
                self.delete_gap(gid);
            }
        }

        while let Some(&tid) = self.stories[sid].readers.last() {
            self.remove_tracker(tid);
        }
    }
}
