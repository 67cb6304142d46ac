//! The transaction manager: the process-wide root of all engine state.
//!
//! Owns the spaces, the story/statement/tracker arenas, the per-tuple
//! story hash, the point-hole table, the read-view list and the
//! collector cursor, and drives transactions through
//! begin/prepare/commit/rollback. All mutation flows through `&mut
//! self`; the engine performs no suspension of its own, so every public
//! operation leaves the structures coherent.

use std::collections::{HashMap, HashSet};

use strata_error::{Result, StrataError};
use strata_index::{
    compare_prefix, direction, DupMode, IndexDef, IndexKey, IteratorType, Space,
};
use strata_types::{Psn, SpaceId, Tuple, TupleAddr, TxnId};

use crate::arena::{Arena, GapId, HoleId, StmtId, StoryId, TrackerId};
use crate::gap::{GapItem, PointHole, PointKey};
use crate::stats::{EngineStats, Statistics, ALLOC_CATEGORY_COUNT};
use crate::story::Story;
use crate::tracker::ReadTracker;
use crate::txn::{Isolation, Stmt, Txn, TxnStatus};

/// xxh3-backed hasher for the engine's process-wide tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct Xxh3BuildHasher;

impl std::hash::BuildHasher for Xxh3BuildHasher {
    type Hasher = xxhash_rust::xxh3::Xxh3;

    fn build_hasher(&self) -> Self::Hasher {
        xxhash_rust::xxh3::Xxh3::new()
    }
}

/// The one engine instance everything talks to.
pub struct TxManager {
    /// When off, `clarify` is the identity, trackers are no-ops and
    /// writes apply to the indexes directly.
    pub(crate) enabled: bool,
    pub(crate) spaces: HashMap<SpaceId, Space>,
    pub(crate) txns: HashMap<TxnId, Txn>,
    next_txn_id: u64,
    pub(crate) next_psn: Psn,

    pub(crate) stories: Arena<StoryId, Story>,
    pub(crate) stmts: Arena<StmtId, Stmt>,
    pub(crate) trackers: Arena<TrackerId, ReadTracker>,
    pub(crate) gaps: Arena<GapId, GapItem>,
    pub(crate) holes: Arena<HoleId, PointHole>,

    /// Tuple identity -> its story.
    pub(crate) history: HashMap<TupleAddr, StoryId, Xxh3BuildHasher>,
    /// Full-key misses waiting for a write to land.
    pub(crate) point_holes: HashMap<PointKey, Vec<HoleId>, Xxh3BuildHasher>,
    /// Gap items attached to an index rather than to a story.
    pub(crate) index_gaps: HashMap<(SpaceId, u32), Vec<GapId>>,
    /// Stories per space, for invalidation and in-index walks.
    pub(crate) space_stories: HashMap<SpaceId, HashSet<StoryId>>,
    /// Cached functional keys of dirty tuples.
    pub(crate) func_keys: HashMap<(TupleAddr, SpaceId, u32), IndexKey, Xxh3BuildHasher>,

    /// Global story list the collector crawls, in creation order.
    pub(crate) all_head: Option<StoryId>,
    pub(crate) all_tail: Option<StoryId>,
    pub(crate) gc_cursor: Option<StoryId>,
    pub(crate) must_do_gc_steps: usize,

    /// Transactions in a read view, ascending by `rv_psn`.
    pub(crate) read_view_txns: Vec<TxnId>,

    pub(crate) stats: EngineStats,
}

impl TxManager {
    /// A manager with the MVCC engine enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::with_mvcc(true)
    }

    /// A manager with the MVCC engine disabled: reads are identity,
    /// trackers are no-ops, writes go straight to the indexes.
    #[must_use]
    pub fn disabled() -> Self {
        Self::with_mvcc(false)
    }

    fn with_mvcc(enabled: bool) -> Self {
        Self {
            enabled,
            spaces: HashMap::new(),
            txns: HashMap::new(),
            next_txn_id: 1,
            next_psn: Psn::MIN_REAL,
            stories: Arena::new(),
            stmts: Arena::new(),
            trackers: Arena::new(),
            gaps: Arena::new(),
            holes: Arena::new(),
            history: HashMap::default(),
            point_holes: HashMap::default(),
            index_gaps: HashMap::new(),
            space_stories: HashMap::new(),
            func_keys: HashMap::default(),
            all_head: None,
            all_tail: None,
            gc_cursor: None,
            must_do_gc_steps: 0,
            read_view_txns: Vec::new(),
            stats: EngineStats::default(),
        }
    }

    /// Whether the MVCC engine is on.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // -- spaces -------------------------------------------------------------

    /// Register a space. The first definition is the primary index.
    pub fn create_space(
        &mut self,
        id: SpaceId,
        name: impl Into<String>,
        defs: Vec<IndexDef>,
    ) -> Result<()> {
        let space = Space::new(id, name, defs)?;
        self.spaces.insert(id, space);
        self.space_stories.entry(id).or_default();
        Ok(())
    }

    /// Register a system space: readers of it always see prepared data.
    pub fn create_system_space(
        &mut self,
        id: SpaceId,
        name: impl Into<String>,
        defs: Vec<IndexDef>,
    ) -> Result<()> {
        let space = Space::new_system(id, name, defs)?;
        self.spaces.insert(id, space);
        self.space_stories.entry(id).or_default();
        Ok(())
    }

    #[inline]
    pub fn space(&self, id: SpaceId) -> Option<&Space> {
        self.spaces.get(&id)
    }

    fn check_space(&self, id: SpaceId) -> Result<()> {
        if self.spaces.contains_key(&id) {
            Ok(())
        } else {
            Err(StrataError::UnknownSpace)
        }
    }

    // -- transactions -------------------------------------------------------

    /// Start a transaction with the default isolation level.
    pub fn begin(&mut self) -> TxnId {
        self.begin_with_isolation(Isolation::default())
    }

    /// Start a transaction with an explicit isolation level.
    pub fn begin_with_isolation(&mut self, isolation: Isolation) -> TxnId {
        let id = TxnId::new(self.next_txn_id);
        self.next_txn_id += 1;
        self.txns.insert(id, Txn::new(id, isolation));
        id
    }

    /// Mark the transaction as performing DDL.
    pub fn acquire_ddl(&mut self, txn: TxnId) -> Result<()> {
        self.txns
            .get_mut(&txn)
            .ok_or(StrataError::UnknownTransaction)?
            .is_schema_changed = true;
        Ok(())
    }

    #[inline]
    pub(crate) fn txn_status(&self, txn: TxnId) -> Option<TxnStatus> {
        self.txns.get(&txn).map(|t| t.status)
    }

    /// Current status of a transaction, if it is still registered.
    #[must_use]
    pub fn transaction_status(&self, txn: TxnId) -> Option<TxnStatus> {
        self.txn_status(txn)
    }

    /// The read-view PSN of a demoted transaction.
    #[must_use]
    pub fn read_view_psn(&self, txn: TxnId) -> Option<Psn> {
        self.txns
            .get(&txn)
            .map(|t| t.rv_psn)
            .filter(|p| p.is_some())
    }

    fn check_txn_operable(&self, txn: TxnId) -> Result<()> {
        match self.txns.get(&txn) {
            None => Err(StrataError::UnknownTransaction),
            Some(t) => match t.status {
                TxnStatus::InProgress | TxnStatus::InReadView => Ok(()),
                TxnStatus::Aborted => Err(StrataError::TransactionConflict),
                other => Err(StrataError::InvalidTransactionState {
                    expected: "in progress",
                    actual: other.name(),
                }),
            },
        }
    }

    /// Assign the transaction its PSN and prepare every statement in
    /// order. Fails with a conflict if the transaction was aborted, or
    /// if it was demoted to a read view and has writes — its
    /// observations are stale and its writes cannot serialize.
    pub fn prepare(&mut self, txn: TxnId) -> Result<Psn> {
        let t = self.txns.get(&txn).ok_or(StrataError::UnknownTransaction)?;
        match t.status {
            TxnStatus::InProgress => {}
            TxnStatus::InReadView => {
                if t.has_writes() {
                    return Err(StrataError::TransactionConflict);
                }
            }
            TxnStatus::Aborted => return Err(StrataError::TransactionConflict),
            other => {
                return Err(StrataError::InvalidTransactionState {
                    expected: "in progress",
                    actual: other.name(),
                })
            }
        }

        let psn = self.next_psn;
        self.next_psn = psn.next();
        let stmts = {
            let t = self.txns.get_mut(&txn).expect("live txn");
            t.psn = psn;
            t.stmts.clone()
        };
        for stmt in stmts {
            self.history_prepare_stmt(stmt);
        }
        // The read, gap and point-hole lists can no longer fire.
        self.clear_txn_read_lists(txn);
        self.txns.get_mut(&txn).expect("live txn").status = TxnStatus::Prepared;
        Ok(psn)
    }

    /// Commit the transaction, preparing it first if necessary.
    pub fn commit(&mut self, txn: TxnId) -> Result<()> {
        match self.txn_status(txn) {
            None => return Err(StrataError::UnknownTransaction),
            Some(TxnStatus::InProgress | TxnStatus::InReadView) => {
                self.prepare(txn)?;
            }
            Some(TxnStatus::Prepared) => {}
            Some(TxnStatus::Aborted) => return Err(StrataError::TransactionConflict),
            Some(other) => {
                return Err(StrataError::InvalidTransactionState {
                    expected: "prepared",
                    actual: other.name(),
                })
            }
        }
        let stmts = self.txns[&txn].stmts.clone();
        for stmt in stmts {
            self.history_commit_stmt(stmt);
        }
        self.txns.get_mut(&txn).expect("live txn").status = TxnStatus::Committed;
        self.finish_txn(txn);
        Ok(())
    }

    /// Roll the transaction back, newest statement first.
    pub fn rollback(&mut self, txn: TxnId) -> Result<()> {
        let t = self.txns.get(&txn).ok_or(StrataError::UnknownTransaction)?;
        if t.status == TxnStatus::Committed {
            return Err(StrataError::InvalidTransactionState {
                expected: "not committed",
                actual: t.status.name(),
            });
        }
        let stmts = t.stmts.clone();
        for stmt in stmts.into_iter().rev() {
            self.history_rollback_stmt(stmt);
        }
        self.clean_txn(txn);
        self.txns.get_mut(&txn).expect("live txn").status = TxnStatus::Aborted;
        self.finish_txn(txn);
        Ok(())
    }

    /// Clear every read-side record of the transaction: point holes,
    /// gap items, read trackers, read-view membership.
    pub(crate) fn clear_txn_read_lists(&mut self, txn: TxnId) {
        while let Some(&hid) = self.txns[&txn].point_holes.last() {
            self.remove_hole(hid);
        }
        while let Some(&gid) = self.txns[&txn].gap_list.last() {
            self.delete_gap(gid);
        }
        while let Some(&tid) = self.txns[&txn].read_set.last() {
            self.remove_tracker(tid);
        }
        if let Some(pos) = self.read_view_txns.iter().position(|&t| t == txn) {
            self.read_view_txns.remove(pos);
        }
    }

    /// End-of-transaction cleanup of the engine's per-transaction state.
    pub(crate) fn clean_txn(&mut self, txn: TxnId) {
        self.clear_txn_read_lists(txn);
        self.story_gc();
    }

    fn finish_txn(&mut self, txn: TxnId) {
        let stmts = self.txns[&txn].stmts.clone();
        for stmt in stmts {
            debug_assert!(self.stmts[stmt].add_story.is_none());
            debug_assert!(self.stmts[stmt].del_story.is_none());
            self.stmts.free(stmt);
        }
        self.txns.remove(&txn);
        self.story_gc();
    }

    // -- writes -------------------------------------------------------------

    /// Insert a tuple; the key must not be visibly taken.
    pub fn insert(&mut self, txn: TxnId, space: SpaceId, tuple: Tuple) -> Result<()> {
        self.execute_dml(txn, space, None, Some(tuple), DupMode::Insert)
            .map(|_| ())
    }

    /// Insert or overwrite; returns the visible tuple that was replaced.
    pub fn replace(&mut self, txn: TxnId, space: SpaceId, tuple: Tuple) -> Result<Option<Tuple>> {
        self.execute_dml(txn, space, None, Some(tuple), DupMode::ReplaceOrInsert)
    }

    /// Delete by full primary key; returns the deleted tuple, if any was
    /// visible.
    pub fn delete(&mut self, txn: TxnId, space: SpaceId, key: &IndexKey) -> Result<Option<Tuple>> {
        self.check_txn_operable(txn)?;
        self.check_space(space)?;
        let physical = self.spaces[&space].index(0).get(key);
        if !self.enabled {
            if let Some(t) = &physical {
                for ord in 0..self.spaces[&space].index_count() {
                    self.spaces
                        .get_mut(&space)
                        .expect("live space")
                        .index_mut(ord)
                        .replace(Some(t), None);
                }
            }
            return Ok(physical);
        }
        match physical {
            None => {
                self.track_point(Some(txn), space, 0, key.clone());
                Ok(None)
            }
            Some(t) => match self.clarify(Some(txn), space, 0, &t) {
                None => Ok(None),
                Some(old) => {
                    self.execute_dml(txn, space, Some(old), None, DupMode::ReplaceOrInsert)
                }
            },
        }
    }

    fn execute_dml(
        &mut self,
        txn: TxnId,
        space: SpaceId,
        old: Option<Tuple>,
        new: Option<Tuple>,
        mode: DupMode,
    ) -> Result<Option<Tuple>> {
        self.check_txn_operable(txn)?;
        self.check_space(space)?;

        if !self.enabled {
            return self.apply_physical(space, old.as_ref(), new.as_ref(), mode);
        }

        let stmt = self.stmts.alloc(Stmt::new(txn, space));
        match self.history_add_stmt(stmt, old, new.clone(), mode) {
            Ok(result_old) => {
                {
                    let s = &mut self.stmts[stmt];
                    s.rollback_old = result_old.clone();
                    s.rollback_new = new;
                }
                self.txns
                    .get_mut(&txn)
                    .expect("live txn")
                    .stmts
                    .push(stmt);
                Ok(result_old)
            }
            Err(err) => {
                self.stmts.free(stmt);
                Err(err)
            }
        }
    }

    /// The engine-off write path: apply straight to the indexes.
    fn apply_physical(
        &mut self,
        space: SpaceId,
        old: Option<&Tuple>,
        new: Option<&Tuple>,
        mode: DupMode,
    ) -> Result<Option<Tuple>> {
        let displaced = match new {
            Some(t) => {
                let k = self.spaces[&space].index(0).cmp_key_of(t);
                self.spaces[&space].index(0).get(&k)
            }
            None => old.cloned(),
        };
        self.spaces[&space]
            .index(0)
            .check_dup(old, displaced.as_ref(), mode)?;
        for ord in 0..self.spaces[&space].index_count() {
            self.spaces
                .get_mut(&space)
                .expect("live space")
                .index_mut(ord)
                .replace(displaced.as_ref().or(old), new);
        }
        Ok(displaced)
    }

    // -- reads --------------------------------------------------------------

    fn check_txn_readable(&self, txn: Option<TxnId>) -> Result<()> {
        match txn {
            None => Ok(()),
            Some(t) => self.check_txn_operable(t),
        }
    }

    /// Full-key lookup in a unique index; a miss installs a point hole.
    pub fn get(
        &mut self,
        txn: Option<TxnId>,
        space: SpaceId,
        ord: u32,
        key: &IndexKey,
    ) -> Result<Option<Tuple>> {
        self.check_space(space)?;
        self.check_txn_readable(txn)?;
        debug_assert!(self.spaces[&space].index(ord).def().unique);
        debug_assert_eq!(key.len(), self.spaces[&space].index(ord).cmp_part_count());
        let physical = self.spaces[&space].index(ord).get(key);
        match physical {
            None => {
                self.track_point(txn, space, ord, key.clone());
                Ok(None)
            }
            Some(t) => Ok(self.clarify(txn, space, ord, &t)),
        }
    }

    /// Ranged or equality scan of an ordered index, in iterator order.
    /// Installs the point, nearby-gap and read trackers an iterator
    /// would: one at the start position, one per crossed interval, one
    /// at the end of the scanned range.
    pub fn select(
        &mut self,
        txn: Option<TxnId>,
        space: SpaceId,
        ord: u32,
        iter: IteratorType,
        key: Option<&IndexKey>,
    ) -> Result<Vec<Tuple>> {
        self.check_space(space)?;
        self.check_txn_readable(txn)?;

        if !self.spaces[&space].index(ord).def().is_ordered() {
            return match (iter, key) {
                (IteratorType::Eq, Some(k)) => {
                    Ok(self.get(txn, space, ord, k)?.into_iter().collect())
                }
                (IteratorType::Ge | IteratorType::Le, None) => self.full_scan(txn, space, ord),
                _ => panic!("unordered index supports only equality scans"),
            };
        }

        let (matches, successor, declared_parts, cmp_parts) = {
            let index = self.spaces[&space].index(ord);
            (
                index.scan(iter, key),
                index.ascending_bound(iter, key),
                index.def().part_count(),
                index.cmp_part_count(),
            )
        };
        let cropped = key.map(|k| {
            IndexKey::new(k.parts().iter().take(declared_parts as usize).cloned())
        });

        if self.enabled && txn.is_some() {
            let key_is_full = key.is_some_and(|k| k.len() == cmp_parts);
            let equals = match (key, matches.first()) {
                (Some(k), Some(first)) => {
                    let first_key = self.tuple_cmp_key(space, ord, first);
                    compare_prefix(&first_key, k) == std::cmp::Ordering::Equal
                }
                _ => false,
            };
            if key_is_full && iter.is_eq() && !equals {
                self.track_point(txn, space, ord, key.expect("full key").clone());
            } else if !key_is_full
                || ((iter == IteratorType::Ge || iter == IteratorType::Le) && !equals)
                || iter == IteratorType::Gt
                || iter == IteratorType::Lt
            {
                self.track_gap(txn, space, ord, successor.as_ref(), iter, cropped.as_ref());
            }
        }

        let dir = direction(iter);
        let mut out = Vec::new();
        for (i, t) in matches.iter().enumerate() {
            if let Some(visible) = self.clarify(txn, space, ord, t) {
                out.push(visible);
            }
            match matches.get(i + 1) {
                Some(next) => {
                    // Any write into the interval between two returned
                    // positions must conflict; no key needed.
                    let succ = if dir > 0 { next } else { t };
                    let step_iter = if dir > 0 {
                        IteratorType::Ge
                    } else {
                        IteratorType::Le
                    };
                    self.track_gap(txn, space, ord, Some(succ), step_iter, None);
                }
                None => {
                    if iter.is_eq() {
                        // End of the equality class: the gap from the
                        // last match to the key boundary.
                        if dir > 0 {
                            let last_key = self.tuple_cmp_key(space, ord, t);
                            let boundary =
                                self.spaces[&space].index(ord).next_ascending_after(&last_key);
                            self.track_gap(
                                txn,
                                space,
                                ord,
                                boundary.as_ref(),
                                IteratorType::Eq,
                                cropped.as_ref(),
                            );
                        } else {
                            self.track_gap(
                                txn,
                                space,
                                ord,
                                Some(t),
                                IteratorType::Req,
                                cropped.as_ref(),
                            );
                        }
                    } else {
                        // Ran off the end of the index.
                        let succ = if dir > 0 { None } else { Some(t) };
                        let step_iter = if dir > 0 {
                            IteratorType::Ge
                        } else {
                            IteratorType::Le
                        };
                        self.track_gap(txn, space, ord, succ, step_iter, None);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Count tuples matching (`iter`, `key`) as visible to `txn`,
    /// recording the count observation.
    pub fn count(
        &mut self,
        txn: Option<TxnId>,
        space: SpaceId,
        ord: u32,
        iter: IteratorType,
        key: Option<&IndexKey>,
    ) -> Result<u64> {
        self.check_space(space)?;
        self.check_txn_readable(txn)?;
        let physical = self.spaces[&space].index(ord).count_matching(iter, key, None);
        let invisible = self.track_count_until(txn, space, ord, iter, key, None);
        Ok(physical - invisible)
    }

    /// Enumerate an entire index, recording the full-scan observation.
    pub fn full_scan(&mut self, txn: Option<TxnId>, space: SpaceId, ord: u32) -> Result<Vec<Tuple>> {
        self.check_space(space)?;
        self.check_txn_readable(txn)?;
        let all = self.spaces[&space].index(ord).scan(IteratorType::Ge, None);
        let mut out = Vec::new();
        for t in &all {
            if let Some(visible) = self.clarify(txn, space, ord, t) {
                out.push(visible);
            }
        }
        self.track_full_scan(txn, space, ord);
        Ok(out)
    }

    // -- space invalidation (DDL hook) --------------------------------------

    /// Abort every concurrent reader, gap holder, writer and point-hole
    /// waiter of `space`, except the DDL owner.
    fn abort_space_schema_readers(&mut self, space: SpaceId, ddl_owner: TxnId) {
        let sids: Vec<StoryId> = self
            .space_stories
            .get(&space)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for sid in sids {
            let readers: Vec<TrackerId> = self.stories[sid].readers.to_vec();
            for tid in readers {
                let reader = self.trackers[tid].reader;
                if reader != ddl_owner {
                    self.abort_with_conflict(reader);
                }
            }
            for ord in 0..self.stories[sid].index_count {
                if self.stories[sid].link(ord).newer.is_some() {
                    continue;
                }
                let items: Vec<GapId> = self.stories[sid].link(ord).read_gaps.to_vec();
                for gid in items {
                    let owner = self.gaps[gid].txn;
                    if owner != ddl_owner {
                        self.abort_with_conflict(owner);
                    }
                }
            }
        }

        let index_count = self.spaces[&space].index_count();
        for ord in 0..index_count {
            let items: Vec<GapId> = self
                .index_gaps
                .get(&(space, ord))
                .map(|l| l.to_vec())
                .unwrap_or_default();
            for gid in items {
                let owner = self.gaps[gid].txn;
                if owner != ddl_owner {
                    self.abort_with_conflict(owner);
                }
            }
        }

        // Writers into the space, and point-hole waiters on its keys.
        let candidates: Vec<TxnId> = self
            .txns
            .values()
            .filter(|t| {
                matches!(t.status, TxnStatus::InProgress | TxnStatus::InReadView)
                    && t.id != ddl_owner
            })
            .map(|t| t.id)
            .collect();
        for txn in candidates {
            let writes_here = self.txns[&txn]
                .stmts
                .iter()
                .any(|&s| self.stmts[s].space == space);
            let waits_here = self.txns[&txn]
                .point_holes
                .iter()
                .any(|&h| self.holes[h].key.space == space);
            if writes_here || waits_here {
                self.abort_with_conflict(txn);
            }
        }
    }

    /// DDL hook: tear down every story of `space`, leaving the physical
    /// indexes holding exactly the versions visible to `ddl_owner`.
    /// Concurrent transactions are aborted first — the primitives their
    /// isolation relies on are about to disappear.
    pub fn invalidate_space(&mut self, space: SpaceId, ddl_owner: TxnId) -> Result<()> {
        self.check_space(space)?;
        tracing::debug!(space = %space, owner = %ddl_owner, "invalidating space");
        self.abort_space_schema_readers(space, ddl_owner);

        // Bake the owner-visible version of every chain into the index.
        let sids: Vec<StoryId> = self
            .space_stories
            .get(&space)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for sid in sids {
            debug_assert_eq!(
                self.stories[sid].index_count,
                self.spaces[&space].index_count()
            );
            for ord in 0..self.stories[sid].index_count {
                if !self.stories[sid].link(ord).in_index {
                    continue;
                }
                self.stories[sid].link_mut(ord).in_index = false;

                let (visible, _) = self.find_visible_tuple(sid, Some(ddl_owner), ord, true);
                let story_tuple = self.stories[sid].tuple.clone();
                if visible.as_ref().is_some_and(|v| v.same(&story_tuple)) {
                    continue;
                }
                self.spaces
                    .get_mut(&space)
                    .expect("live space")
                    .index_mut(ord)
                    .replace(Some(&story_tuple), visible.as_ref());
                if ord == 0 {
                    if let Some(v) = &visible {
                        if v.is_dirty() {
                            let vs = self.story_get(v);
                            self.ref_to_primary(vs);
                        }
                    }
                    self.unref_from_primary(sid);
                }
            }
        }

        // Destroy the stories; they are unlinked from the indexes now.
        loop {
            let Some(&sid) = self
                .space_stories
                .get(&space)
                .and_then(|s| s.iter().next())
            else {
                break;
            };
            self.story_full_unlink_on_space_delete(sid);
            self.story_delete(sid);
        }

        // Drop index-level gap items; their holders are aborted already.
        let index_count = self.spaces[&space].index_count();
        for ord in 0..index_count {
            loop {
                let Some(&gid) = self.index_gaps.get(&(space, ord)).and_then(|l| l.first())
                else {
                    break;
                };
                self.delete_gap(gid);
            }
        }
        Ok(())
    }

    // -- statistics ---------------------------------------------------------

    /// A point-in-time statistics snapshot.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        let mut out = Statistics {
            stories: self.stats.stories,
            retained: self.stats.retained,
            txn_count: self.txns.len() as u64,
            read_view_count: self.read_view_txns.len() as u64,
            ..Statistics::default()
        };
        for txn in self.txns.values() {
            for cat in 0..ALLOC_CATEGORY_COUNT {
                out.txn_alloc_total[cat] += txn.alloc_stats[cat];
                out.txn_alloc_max[cat] = out.txn_alloc_max[cat].max(txn.alloc_stats[cat]);
            }
        }
        out
    }
}

impl Default for TxManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::Value;

    fn tuple(vals: &[i64]) -> Tuple {
        Tuple::new(vals.iter().map(|&v| Value::Int(v)).collect::<Vec<_>>())
    }

    fn key(v: i64) -> IndexKey {
        IndexKey::new([Value::Int(v)])
    }

    fn setup() -> (TxManager, SpaceId) {
        let mut m = TxManager::new();
        let sid = SpaceId::new(1);
        m.create_space(sid, "t", vec![IndexDef::tree("pk", [0], true)])
            .unwrap();
        (m, sid)
    }

    #[test]
    fn test_commit_makes_writes_visible() {
        let (mut m, space) = setup();
        let tx = m.begin();
        m.insert(tx, space, tuple(&[1, 10])).unwrap();
        m.commit(tx).unwrap();

        let reader = m.begin();
        let seen = m.get(Some(reader), space, 0, &key(1)).unwrap().unwrap();
        assert_eq!(seen.field(1), Some(&Value::Int(10)));
    }

    #[test]
    fn test_write_after_abort_fails() {
        let (mut m, space) = setup();
        let tx = m.begin();
        m.abort_with_conflict(tx);
        let err = m.insert(tx, space, tuple(&[1])).unwrap_err();
        assert_eq!(err, StrataError::TransactionConflict);
    }

    #[test]
    fn test_demoted_writer_fails_at_commit() {
        let (mut m, space) = setup();
        let tx = m.begin();
        m.insert(tx, space, tuple(&[1])).unwrap();
        m.send_to_read_view(tx, Psn::new(5));
        let err = m.commit(tx).unwrap_err();
        assert_eq!(err, StrataError::TransactionConflict);
        m.rollback(tx).unwrap();
    }

    #[test]
    fn test_demoted_reader_commits_read_only() {
        let (mut m, _space) = setup();
        let tx = m.begin();
        m.send_to_read_view(tx, Psn::new(5));
        m.commit(tx).unwrap();
    }

    #[test]
    fn test_select_range_and_gap_tracking() {
        let (mut m, space) = setup();
        let tx = m.begin();
        for v in [1, 3, 5] {
            m.insert(tx, space, tuple(&[v])).unwrap();
        }
        m.commit(tx).unwrap();

        let reader = m.begin();
        let got = m
            .select(Some(reader), space, 0, IteratorType::Ge, Some(&key(2)))
            .unwrap();
        let vals: Vec<i64> = got
            .iter()
            .map(|t| match t.field(0) {
                Some(Value::Int(v)) => *v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(vals, vec![3, 5]);
        assert!(
            !m.txns[&reader].gap_list.is_empty(),
            "ranged scan records nearby gaps"
        );
    }

    #[test]
    fn test_count_subtracts_invisible() {
        let (mut m, space) = setup();
        let tx = m.begin();
        for v in [1, 2, 3] {
            m.insert(tx, space, tuple(&[v])).unwrap();
        }
        m.commit(tx).unwrap();

        // An in-progress insert is counted physically but invisible to
        // a fresh reader.
        let writer = m.begin();
        m.insert(writer, space, tuple(&[4])).unwrap();

        let reader = m.begin();
        let n = m
            .count(Some(reader), space, 0, IteratorType::Ge, Some(&key(1)))
            .unwrap();
        assert_eq!(n, 3);
        m.rollback(writer).unwrap();
    }

    #[test]
    fn test_disabled_engine_is_passthrough() {
        let mut m = TxManager::disabled();
        let space = SpaceId::new(1);
        m.create_space(space, "t", vec![IndexDef::tree("pk", [0], true)])
            .unwrap();
        let tx = m.begin();
        m.insert(tx, space, tuple(&[1, 10])).unwrap();
        // Visible immediately, to anyone: there is no versioning.
        let other = m.begin();
        let seen = m.get(Some(other), space, 0, &key(1)).unwrap().unwrap();
        assert_eq!(seen.field(1), Some(&Value::Int(10)));
        assert!(!seen.is_dirty(), "no stories with the engine off");
        assert_eq!(m.txns[&other].read_set.len(), 0);
    }

    #[test]
    fn test_functional_secondary_index_versions() {
        use std::sync::Arc;
        let mut m = TxManager::new();
        let space = SpaceId::new(1);
        let doubled: strata_index::KeyFn = Arc::new(|t| match t.field(1) {
            Some(Value::Int(v)) => Some(IndexKey::new([Value::Int(v * 2)])),
            _ => None,
        });
        m.create_space(
            space,
            "t",
            vec![
                IndexDef::tree("pk", [0], true),
                IndexDef::func("dbl", doubled, 1, true),
            ],
        )
        .unwrap();

        let tx = m.begin();
        m.insert(tx, space, tuple(&[1, 10])).unwrap();
        m.commit(tx).unwrap();

        let reader = m.begin();
        let got = m
            .select(Some(reader), space, 1, IteratorType::Eq, Some(&key(20)))
            .unwrap();
        assert_eq!(got.len(), 1);
        m.rollback(reader).unwrap();

        // A replace moves the row to a new functional key; during the
        // transition both keys are physically present and visibility
        // sorts it out.
        let writer = m.begin();
        m.replace(writer, space, tuple(&[1, 11])).unwrap();
        m.commit(writer).unwrap();

        let reader = m.begin();
        let at_new = m
            .select(Some(reader), space, 1, IteratorType::Eq, Some(&key(22)))
            .unwrap();
        assert_eq!(at_new.len(), 1);
        let at_old = m
            .select(Some(reader), space, 1, IteratorType::Eq, Some(&key(20)))
            .unwrap();
        assert!(at_old.is_empty(), "the old functional key is history");
        m.rollback(reader).unwrap();
    }

    #[test]
    fn test_invalidate_space_aborts_concurrent_readers() {
        let (mut m, space) = setup();
        let seed = m.begin();
        m.insert(seed, space, tuple(&[1])).unwrap();
        m.commit(seed).unwrap();

        let reader = m.begin();
        m.get(Some(reader), space, 0, &key(1)).unwrap();

        let writer = m.begin();
        m.insert(writer, space, tuple(&[2])).unwrap();

        let ddl = m.begin();
        m.acquire_ddl(ddl).unwrap();
        m.invalidate_space(space, ddl).unwrap();

        assert_eq!(m.txns[&reader].status, TxnStatus::Aborted);
        assert_eq!(m.txns[&writer].status, TxnStatus::Aborted);
        // No stories of the space remain.
        assert!(m.space_stories[&space].is_empty());
        // The physical index reflects the DDL owner's view: the
        // committed {1} present, the writer's in-progress {2} gone.
        assert!(m.spaces[&space].index(0).get(&key(1)).is_some());
        assert!(m.spaces[&space].index(0).get(&key(2)).is_none());

        // The aborted writer's rollback is storyless and must not touch
        // the rebuilt space.
        m.rollback(writer).unwrap();
        assert!(m.spaces[&space].index(0).get(&key(1)).is_some());
    }
}
