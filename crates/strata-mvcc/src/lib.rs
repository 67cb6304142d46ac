//! The transaction history manager of the strata store.
//!
//! Every concurrent transaction gets a consistent view of the shared
//! in-memory dataset through version records called *stories*: per-tuple,
//! per-index chains ordered newest to oldest, with the invariant that the
//! version physically present in an index is always the head of its chain.
//! Reads are recorded precisely — including reads that found *nothing* —
//! so that a write by one transaction can conflict or demote another whose
//! observations it invalidates.
//!
//! The engine is single-threaded-cooperative: all mutation goes through
//! `&mut TxManager` and there is no internal locking. Isolation comes
//! entirely from visibility rules and the conflict cascade.

pub mod arena;
pub mod func_key;
pub mod gap;
pub mod gc;
pub mod history;
pub mod manager;
pub mod read_view;
pub mod snapshot;
pub mod stats;
pub mod story;
pub mod tracker;
pub mod txn;
pub mod visibility;

pub use arena::{Arena, GapId, HoleId, StmtId, StoryId, TrackerId};
pub use gap::{GapItem, GapKind, GapLocation, PointHole, PointKey};
pub use gc::GC_STEPS_PER_STORY;
pub use manager::TxManager;
pub use snapshot::SnapshotCleaner;
pub use stats::{AllocCategory, StatBucket, Statistics};
pub use story::{Story, StoryLink, StoryStatus};
pub use tracker::ReadTracker;
pub use txn::{Isolation, Stmt, Txn, TxnStatus};
