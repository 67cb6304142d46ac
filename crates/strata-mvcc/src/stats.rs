//! Engine statistics.
//!
//! Stories and retained tuples are accounted per story status, so the
//! operator can tell memory pinned by active transactions apart from
//! memory pinned by read views and by gap tracking. Per-transaction
//! allocations are tracked by category.

use crate::story::{Story, StoryStatus, STORY_STATUS_COUNT};

/// Per-transaction allocation categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocCategory {
    /// Read, gap and point-hole trackers.
    Trackers = 0,
    /// Conflict bookkeeping.
    Conflicts = 1,
}

pub const ALLOC_CATEGORY_COUNT: usize = 2;

/// Count plus approximate bytes of a class of objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatBucket {
    pub count: u64,
    pub bytes: u64,
}

impl StatBucket {
    pub(crate) fn collect(&mut self, size: usize) {
        self.count += 1;
        self.bytes += size as u64;
    }

    pub(crate) fn discard(&mut self, size: usize) {
        debug_assert!(self.count > 0);
        self.count = self.count.saturating_sub(1);
        self.bytes = self.bytes.saturating_sub(size as u64);
    }
}

/// Aggregate counters owned by the manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    /// Stories by status.
    pub stories: [StatBucket; STORY_STATUS_COUNT],
    /// Retained tuples (displaced from the primary index but still alive)
    /// by the status of their story.
    pub retained: [StatBucket; STORY_STATUS_COUNT],
}

/// A point-in-time statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    pub stories: [StatBucket; STORY_STATUS_COUNT],
    pub retained: [StatBucket; STORY_STATUS_COUNT],
    pub txn_count: u64,
    pub read_view_count: u64,
    /// Sum of tracker bytes across live transactions, by category.
    pub txn_alloc_total: [u64; ALLOC_CATEGORY_COUNT],
    /// Largest per-transaction tracker bytes, by category.
    pub txn_alloc_max: [u64; ALLOC_CATEGORY_COUNT],
}

/// Approximate in-memory size of a story with its link array.
pub(crate) fn story_size(story: &Story) -> usize {
    std::mem::size_of::<Story>()
        + story.links.len() * std::mem::size_of::<crate::story::StoryLink>()
}

impl EngineStats {
    pub(crate) fn collect_story(&mut self, status: StoryStatus, size: usize) {
        self.stories[status as usize].collect(size);
    }

    pub(crate) fn discard_story(&mut self, status: StoryStatus, size: usize) {
        self.stories[status as usize].discard(size);
    }

    pub(crate) fn collect_retained(&mut self, status: StoryStatus, size: usize) {
        self.retained[status as usize].collect(size);
    }

    pub(crate) fn discard_retained(&mut self, status: StoryStatus, size: usize) {
        self.retained[status as usize].discard(size);
    }
}
