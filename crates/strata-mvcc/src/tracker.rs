//! Read trackers: the record that a transaction read a tuple version.
//!
//! Installing a tracker commits the engine to demoting or aborting the
//! reader if the version is later ended by another transaction. Trackers
//! sit in two lists at once — the story's reader list and the reader's
//! read set — both kept in most-recently-used order, which makes the
//! deduplicating lookup effectively constant time whenever either side
//! is short.

use strata_types::{SpaceId, Tuple, TxnId};

use crate::arena::{StoryId, TrackerId};
use crate::manager::TxManager;
use crate::stats::AllocCategory;

/// Links a reader transaction with a story it has read.
pub struct ReadTracker {
    pub reader: TxnId,
    pub story: StoryId,
}

impl TxManager {
    fn tracker_new(&mut self, reader: TxnId, story: StoryId) -> TrackerId {
        if let Some(txn) = self.txns.get_mut(&reader) {
            txn.alloc_stats[AllocCategory::Trackers as usize] +=
                std::mem::size_of::<ReadTracker>() as u64;
        }
        self.trackers.alloc(ReadTracker { reader, story })
    }

    /// Record that `txn` has read `story`. Deduplicated by walking the
    /// story's reader list and the transaction's read set in parallel
    /// from their most-recently-used ends; a hit moves the tracker back
    /// to the MRU position of both lists.
    pub(crate) fn track_read_story(&mut self, txn: Option<TxnId>, story: StoryId) {
        if !self.enabled {
            return;
        }
        let Some(txn) = txn else { return };
        if !self.txns.contains_key(&txn) {
            return;
        }

        let mut found: Option<TrackerId> = None;
        {
            let readers = &self.stories[story].readers;
            let read_set = &self.txns[&txn].read_set;
            let mut r1 = readers.iter().rev();
            let mut r2 = read_set.iter().rev();
            loop {
                let (a, b) = (r1.next(), r2.next());
                if a.is_none() && b.is_none() {
                    break;
                }
                if let Some(&tid) = a {
                    debug_assert_eq!(self.trackers[tid].story, story);
                    if self.trackers[tid].reader == txn {
                        found = Some(tid);
                        break;
                    }
                }
                if let Some(&tid) = b {
                    debug_assert_eq!(self.trackers[tid].reader, txn);
                    if self.trackers[tid].story == story {
                        found = Some(tid);
                        break;
                    }
                }
            }
        }

        let tid = match found {
            Some(tid) => {
                // Move to the MRU end of both lists.
                let readers = &mut self.stories[story].readers;
                if let Some(pos) = readers.iter().position(|&t| t == tid) {
                    readers.remove(pos);
                }
                let read_set = &mut self.txns.get_mut(&txn).expect("live txn").read_set;
                if let Some(pos) = read_set.iter().position(|&t| t == tid) {
                    read_set.remove(pos);
                }
                tid
            }
            None => self.tracker_new(txn, story),
        };
        self.stories[story].readers.push(tid);
        self.txns
            .get_mut(&txn)
            .expect("live txn")
            .read_set
            .push(tid);
    }

    /// Record that `txn` has read `tuple` in `space`. A clean tuple gets
    /// a degenerate one-story chain created for it on the spot.
    pub(crate) fn track_read(&mut self, txn: Option<TxnId>, space: SpaceId, tuple: Option<&Tuple>) {
        if !self.enabled {
            return;
        }
        let Some(tuple) = tuple else { return };
        let Some(txn) = txn else { return };
        if !self.txns.contains_key(&txn) {
            return;
        }

        if tuple.is_dirty() {
            let story = self.story_get(tuple);
            self.track_read_story(Some(txn), story);
        } else {
            let story = self.story_new(space, tuple);
            let tid = self.tracker_new(txn, story);
            self.stories[story].readers.push(tid);
            self.txns
                .get_mut(&txn)
                .expect("live txn")
                .read_set
                .push(tid);
        }
    }

    /// Detach a tracker from both lists and free it.
    pub(crate) fn remove_tracker(&mut self, tid: TrackerId) {
        let (reader, story) = {
            let t = &self.trackers[tid];
            (t.reader, t.story)
        };
        let readers = &mut self.stories[story].readers;
        if let Some(pos) = readers.iter().position(|&t| t == tid) {
            readers.remove(pos);
        }
        if let Some(txn) = self.txns.get_mut(&reader) {
            if let Some(pos) = txn.read_set.iter().position(|&t| t == tid) {
                txn.read_set.remove(pos);
            }
        }
        self.trackers.free(tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_index::IndexDef;
    use strata_types::Value;

    fn setup() -> (TxManager, SpaceId, Tuple) {
        let mut m = TxManager::new();
        let sid = SpaceId::new(1);
        m.create_space(sid, "t", vec![IndexDef::tree("pk", [0], true)])
            .unwrap();
        (m, sid, Tuple::new(vec![Value::Int(1)]))
    }

    #[test]
    fn test_track_read_creates_story_for_clean_tuple() {
        let (mut m, space, t) = setup();
        let tx = m.begin();
        m.track_read(Some(tx), space, Some(&t));
        assert!(t.is_dirty());
        let story = m.story_get(&t);
        assert_eq!(m.stories[story].readers.len(), 1);
        assert_eq!(m.txns[&tx].read_set.len(), 1);
    }

    #[test]
    fn test_track_read_story_deduplicates() {
        let (mut m, space, t) = setup();
        let tx = m.begin();
        let story = m.story_new(space, &t);
        m.track_read_story(Some(tx), story);
        m.track_read_story(Some(tx), story);
        m.track_read_story(Some(tx), story);
        assert_eq!(m.stories[story].readers.len(), 1);
        assert_eq!(m.txns[&tx].read_set.len(), 1);
    }

    #[test]
    fn test_two_readers_two_trackers() {
        let (mut m, space, t) = setup();
        let tx1 = m.begin();
        let tx2 = m.begin();
        let story = m.story_new(space, &t);
        m.track_read_story(Some(tx1), story);
        m.track_read_story(Some(tx2), story);
        assert_eq!(m.stories[story].readers.len(), 2);
        // MRU order: tx2's tracker is at the back.
        let last = *m.stories[story].readers.last().unwrap();
        assert_eq!(m.trackers[last].reader, tx2);
    }

    #[test]
    fn test_remove_tracker_detaches_both_sides() {
        let (mut m, space, t) = setup();
        let tx = m.begin();
        let story = m.story_new(space, &t);
        m.track_read_story(Some(tx), story);
        let tid = *m.stories[story].readers.last().unwrap();
        m.remove_tracker(tid);
        assert!(m.stories[story].readers.is_empty());
        assert!(m.txns[&tx].read_set.is_empty());
    }
}
