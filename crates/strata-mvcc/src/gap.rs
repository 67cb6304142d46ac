//! Gap items and point holes: the record that a transaction observed the
//! *absence* of matching tuples.
//!
//! Four flavors share one record with a kind tag — the set is closed and
//! small, so a tagged variant beats open dispatch:
//!
//! - *Inplace*: a visibility walk skipped a pending version; commit of
//!   that version, or any overwrite, invalidates the observation.
//! - *Nearby*: an ordered scan crossed the interval between two adjacent
//!   tuples; writes landing in the interval invalidate it.
//! - *Count*: a range was counted; any matching insert or delete
//!   invalidates the count.
//! - *Full scan*: an unordered index was enumerated wholesale.
//!
//! A gap item lives either on the head story of some chain ("between this
//! successor and its predecessor") or on the index itself ("the region
//! with no successor"), never on a non-head story. Point holes — full-key
//! misses in unique indexes — live in their own hash table until a write
//! lands on the key or the transaction ends.

use strata_index::{IndexKey, IteratorType};
use strata_types::{SpaceId, Tuple, TxnId};

use crate::arena::{GapId, HoleId, StoryId};
use crate::manager::TxManager;
use crate::txn::TxnStatus;

/// Per-flavor state of a gap item.
#[derive(Debug, Clone)]
pub enum GapKind {
    Inplace,
    Nearby {
        iter: IteratorType,
        /// Search key; absent for unkeyed interval crossings.
        key: Option<IndexKey>,
    },
    Count {
        iter: IteratorType,
        key: Option<IndexKey>,
        /// Upper bound of the counted range, exclusive in iteration order.
        until: Option<Tuple>,
    },
    FullScan,
}

/// Where a gap item is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapLocation {
    /// On the head story of a chain, in one index.
    Story { story: StoryId, ord: u32 },
    /// On the index directly.
    Index { space: SpaceId, ord: u32 },
}

/// One gap observation of one transaction.
pub struct GapItem {
    pub txn: TxnId,
    pub kind: GapKind,
    pub location: GapLocation,
}

/// Identity of a full-key miss: which index, which key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PointKey {
    pub space: SpaceId,
    pub ord: u32,
    pub key: IndexKey,
}

/// The record that a transaction looked up a full key in a unique index
/// and found nothing.
pub struct PointHole {
    pub txn: TxnId,
    pub key: PointKey,
}

impl TxManager {
    fn gap_list_mut(&mut self, location: GapLocation) -> &mut Vec<GapId> {
        match location {
            GapLocation::Story { story, ord } => &mut self.stories[story].link_mut(ord).read_gaps,
            GapLocation::Index { space, ord } => {
                self.index_gaps.entry((space, ord)).or_default()
            }
        }
    }

    /// Allocate a gap item and register it on its location list and the
    /// owning transaction. `at_tail` appends instead of prepending — used
    /// by full-index count items so a later full count finds them without
    /// scanning the whole list.
    pub(crate) fn gap_new(
        &mut self,
        txn: TxnId,
        kind: GapKind,
        location: GapLocation,
        at_tail: bool,
    ) -> GapId {
        let gid = self.gaps.alloc(GapItem {
            txn,
            kind,
            location,
        });
        let list = self.gap_list_mut(location);
        if at_tail {
            list.push(gid);
        } else {
            list.insert(0, gid);
        }
        self.txns
            .get_mut(&txn)
            .expect("live txn")
            .gap_list
            .push(gid);
        gid
    }

    /// Detach a gap item from its location list and its transaction, and
    /// free it.
    pub(crate) fn delete_gap(&mut self, gid: GapId) {
        let (txn, location) = {
            let item = &self.gaps[gid];
            (item.txn, item.location)
        };
        let list = self.gap_list_mut(location);
        if let Some(pos) = list.iter().position(|&g| g == gid) {
            list.remove(pos);
        }
        if let Some(txn) = self.txns.get_mut(&txn) {
            if let Some(pos) = txn.gap_list.iter().position(|&g| g == gid) {
                txn.gap_list.remove(pos);
            }
        }
        self.gaps.free(gid);
    }

    /// Record that `txn` observed the absence of a visible version at
    /// `story` (which must be a chain head) in index `ord`.
    pub(crate) fn track_story_gap(&mut self, txn: TxnId, story: StoryId, ord: u32) {
        debug_assert!(self.stories[story].link(ord).newer.is_none());
        if !self.txns.contains_key(&txn) {
            return;
        }
        self.gap_new(
            txn,
            GapKind::Inplace,
            GapLocation::Story { story, ord },
            false,
        );
    }

    /// Record a near miss of an ordered scan: `txn` read the interval
    /// between some predecessor and `successor` (absent when the scan ran
    /// off the end of the index).
    pub fn track_gap(
        &mut self,
        txn: Option<TxnId>,
        space: SpaceId,
        ord: u32,
        successor: Option<&Tuple>,
        iter: IteratorType,
        key: Option<&IndexKey>,
    ) {
        if !self.enabled {
            return;
        }
        let Some(txn) = txn else { return };
        if self.txn_status(txn) != Some(TxnStatus::InProgress) {
            return;
        }
        let kind = GapKind::Nearby {
            iter,
            key: key.cloned(),
        };
        match successor {
            Some(successor) => {
                let story = if successor.is_dirty() {
                    self.story_get(successor)
                } else {
                    self.story_new(space, successor)
                };
                debug_assert!(self.stories[story].link(ord).in_index);
                self.gap_new(txn, kind, GapLocation::Story { story, ord }, false);
            }
            None => {
                self.gap_new(txn, kind, GapLocation::Index { space, ord }, false);
            }
        }
    }

    /// Record a full-key miss in a unique index.
    pub fn track_point(&mut self, txn: Option<TxnId>, space: SpaceId, ord: u32, key: IndexKey) {
        if !self.enabled {
            return;
        }
        let Some(txn) = txn else { return };
        if self.txn_status(txn) != Some(TxnStatus::InProgress) {
            return;
        }
        let key = PointKey { space, ord, key };
        let hid = self.holes.alloc(PointHole {
            txn,
            key: key.clone(),
        });
        self.point_holes.entry(key).or_default().push(hid);
        self.txns
            .get_mut(&txn)
            .expect("live txn")
            .point_holes
            .push(hid);
    }

    /// Record that `txn` enumerated the whole of an unordered index.
    pub fn track_full_scan(&mut self, txn: Option<TxnId>, space: SpaceId, ord: u32) {
        if !self.enabled {
            return;
        }
        let Some(txn) = txn else { return };
        if self.txn_status(txn) != Some(TxnStatus::InProgress) {
            return;
        }
        self.gap_new(
            txn,
            GapKind::FullScan,
            GapLocation::Index { space, ord },
            false,
        );
    }

    /// Whether `txn` already recorded a full-index, no-bound count on
    /// this index. Such items are appended at the tail of the index gap
    /// list, so probing from the tail stops at the first non-count item.
    pub(crate) fn full_count_recorded_already(
        &self,
        space: SpaceId,
        ord: u32,
        txn: TxnId,
    ) -> bool {
        let Some(list) = self.index_gaps.get(&(space, ord)) else {
            return false;
        };
        for &gid in list.iter().rev() {
            let item = &self.gaps[gid];
            let GapKind::Count { key, until, .. } = &item.kind else {
                return false;
            };
            if item.txn != txn {
                continue;
            }
            if key.is_some() || until.is_some() {
                return false;
            }
            return true;
        }
        false
    }

    /// Record a count observation and return the number of matching
    /// tuples that are physically present but invisible to `txn`.
    ///
    /// The counting transaction becomes a reader of every counted story
    /// and a gap reader of every matching story it could not see, so a
    /// rollback of counted versions drags it down and a commit of unseen
    /// matching versions conflicts with it.
    pub fn track_count_until(
        &mut self,
        txn: Option<TxnId>,
        space: SpaceId,
        ord: u32,
        iter: IteratorType,
        key: Option<&IndexKey>,
        until: Option<&Tuple>,
    ) -> u64 {
        if !self.enabled {
            return 0;
        }

        // A repeated full count by the same transaction needs no second
        // item; only the invisible tally.
        if let Some(t) = txn {
            if key.is_none()
                && until.is_none()
                && self.full_count_recorded_already(space, ord, t)
            {
                return self.invisible_count_matching_until(txn, space, ord, iter, key, until);
            }
        }

        if let Some(t) = txn {
            if self.txn_status(t) == Some(TxnStatus::InProgress) {
                let kind = GapKind::Count {
                    iter,
                    key: key.cloned(),
                    until: until.cloned(),
                };
                let at_tail = key.is_none() && until.is_none();
                self.gap_new(t, kind, GapLocation::Index { space, ord }, at_tail);
            }
        }

        let until_key = until.map(|u| self.tuple_cmp_key(space, ord, u));
        let stories = self.stories_in_index(space, ord);
        let mut invisible = 0;
        for sid in stories {
            let tuple = self.stories[sid].tuple.clone();
            let tuple_key = self.tuple_cmp_key(space, ord, &tuple);
            if !strata_index::key_matches_until(&tuple_key, iter, key, until_key.as_ref()) {
                continue;
            }
            // Track the story as read or gap-read, and conflict with the
            // prepared transactions whose changes are invisible to us.
            let prepared_ok = self.detect_prepared_ok(txn, space);
            if self.clarify_story(txn, space, sid, ord, prepared_ok).is_none() {
                invisible += 1;
            }
        }
        invisible
    }

    /// Count matching stories with no version visible to `txn`, without
    /// installing any tracker.
    pub fn invisible_count_matching_until(
        &mut self,
        txn: Option<TxnId>,
        space: SpaceId,
        ord: u32,
        iter: IteratorType,
        key: Option<&IndexKey>,
        until: Option<&Tuple>,
    ) -> u64 {
        if !self.enabled {
            return 0;
        }
        let until_key = until.map(|u| self.tuple_cmp_key(space, ord, u));
        let prepared_ok = self.detect_prepared_ok(txn, space);
        let stories = self.stories_in_index(space, ord);
        let mut invisible = 0;
        for sid in stories {
            let tuple = self.stories[sid].tuple.clone();
            let tuple_key = self.tuple_cmp_key(space, ord, &tuple);
            if !strata_index::key_matches_until(&tuple_key, iter, key, until_key.as_ref()) {
                continue;
            }
            let (visible, _) = self.find_visible_tuple(sid, txn, ord, prepared_ok);
            if visible.is_none() {
                invisible += 1;
            }
        }
        invisible
    }

    /// Stories of `space` whose tuple is physically present in index
    /// `ord` (chain heads). All versions of a chain share one key, so
    /// these heads stand for every key the index holds a story for.
    pub(crate) fn stories_in_index(&self, space: SpaceId, ord: u32) -> Vec<StoryId> {
        let Some(set) = self.space_stories.get(&space) else {
            return Vec::new();
        };
        set.iter()
            .copied()
            .filter(|&sid| {
                let link = self.stories[sid].link(ord);
                if !link.in_index {
                    debug_assert!(link.newer.is_some());
                    return false;
                }
                debug_assert!(link.newer.is_none());
                true
            })
            .collect()
    }

    /// Drop a point hole from its hash bucket and its transaction.
    pub(crate) fn remove_hole(&mut self, hid: HoleId) {
        let (txn, key) = {
            let hole = &self.holes[hid];
            (hole.txn, hole.key.clone())
        };
        if let Some(bucket) = self.point_holes.get_mut(&key) {
            if let Some(pos) = bucket.iter().position(|&h| h == hid) {
                bucket.remove(pos);
            }
            if bucket.is_empty() {
                self.point_holes.remove(&key);
            }
        }
        if let Some(txn) = self.txns.get_mut(&txn) {
            if let Some(pos) = txn.point_holes.iter().position(|&h| h == hid) {
                txn.point_holes.remove(pos);
            }
        }
        self.holes.free(hid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_index::IndexDef;
    use strata_types::Value;

    fn setup() -> (TxManager, SpaceId) {
        let mut m = TxManager::new();
        let sid = SpaceId::new(1);
        m.create_space(sid, "t", vec![IndexDef::tree("pk", [0], true)])
            .unwrap();
        (m, sid)
    }

    fn key(v: i64) -> IndexKey {
        IndexKey::new([Value::Int(v)])
    }

    #[test]
    fn test_track_gap_attaches_to_successor_story() {
        let (mut m, space) = setup();
        let tx = m.begin();
        let succ = Tuple::new(vec![Value::Int(5)]);
        m.track_gap(
            Some(tx),
            space,
            0,
            Some(&succ),
            IteratorType::Ge,
            Some(&key(2)),
        );
        assert!(succ.is_dirty());
        let story = m.story_get(&succ);
        assert_eq!(m.stories[story].link(0).read_gaps.len(), 1);
        assert_eq!(m.txns[&tx].gap_list.len(), 1);
    }

    #[test]
    fn test_track_gap_without_successor_goes_to_index() {
        let (mut m, space) = setup();
        let tx = m.begin();
        m.track_gap(Some(tx), space, 0, None, IteratorType::Ge, None);
        assert_eq!(m.index_gaps[&(space, 0)].len(), 1);
    }

    #[test]
    fn test_point_holes_collide_on_one_key() {
        let (mut m, space) = setup();
        let tx1 = m.begin();
        let tx2 = m.begin();
        m.track_point(Some(tx1), space, 0, key(1));
        m.track_point(Some(tx2), space, 0, key(1));
        let bucket = &m.point_holes[&PointKey {
            space,
            ord: 0,
            key: key(1),
        }];
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn test_full_count_dedup_probe() {
        let (mut m, space) = setup();
        let tx = m.begin();
        assert!(!m.full_count_recorded_already(space, 0, tx));
        m.track_count_until(Some(tx), space, 0, IteratorType::Ge, None, None);
        assert!(m.full_count_recorded_already(space, 0, tx));
        // A second full count installs no second item.
        m.track_count_until(Some(tx), space, 0, IteratorType::Ge, None, None);
        assert_eq!(m.index_gaps[&(space, 0)].len(), 1);
        // A keyed count is a different observation and gets its own item,
        // prepended so the tail probe still sees the full-count item.
        m.track_count_until(Some(tx), space, 0, IteratorType::Ge, Some(&key(1)), None);
        assert_eq!(m.index_gaps[&(space, 0)].len(), 2);
        assert!(m.full_count_recorded_already(space, 0, tx));
    }

    #[test]
    fn test_delete_gap_detaches_everywhere() {
        let (mut m, space) = setup();
        let tx = m.begin();
        m.track_full_scan(Some(tx), space, 0);
        let gid = m.txns[&tx].gap_list[0];
        m.delete_gap(gid);
        assert!(m.index_gaps[&(space, 0)].is_empty());
        assert!(m.txns[&tx].gap_list.is_empty());
    }
}
