//! Transactions and statements, as the engine sees them.
//!
//! The engine reads and writes only the fields below; driving a
//! transaction through begin/prepare/commit/rollback is the manager's
//! concern (`manager.rs`).

use strata_types::{Psn, SpaceId, Tuple, TxnId};

use crate::arena::{GapId, HoleId, StmtId, StoryId, TrackerId};
use crate::stats::ALLOC_CATEGORY_COUNT;

/// Isolation level of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// Sees prepared but unconfirmed changes.
    ReadCommitted,
    /// Sees only confirmed changes.
    ReadConfirmed,
    /// Like `ReadConfirmed`, plus a linearizability fence above the engine.
    Linearizable,
    /// Read-only so far: confirmed view; has written: sees prepared, which
    /// avoids trivial write-write conflicts.
    #[default]
    BestEffort,
}

/// Lifecycle status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    InProgress,
    /// Still executing, but sees state frozen at `rv_psn`.
    InReadView,
    Prepared,
    Committed,
    Aborted,
}

impl TxnStatus {
    pub const fn name(self) -> &'static str {
        match self {
            TxnStatus::InProgress => "in progress",
            TxnStatus::InReadView => "in read view",
            TxnStatus::Prepared => "prepared",
            TxnStatus::Committed => "committed",
            TxnStatus::Aborted => "aborted",
        }
    }
}

/// One transaction registered with the engine.
pub struct Txn {
    pub id: TxnId,
    /// Zero until prepared.
    pub psn: Psn,
    /// Zero unless the transaction is in a read view; otherwise the PSN
    /// beyond which it must not see changes.
    pub rv_psn: Psn,
    pub isolation: Isolation,
    pub status: TxnStatus,
    /// Read trackers of this transaction, most recently used at the back.
    pub read_set: Vec<TrackerId>,
    /// Gap items of this transaction.
    pub gap_list: Vec<GapId>,
    /// Point holes of this transaction.
    pub point_holes: Vec<HoleId>,
    /// Statements in execution order.
    pub stmts: Vec<StmtId>,
    /// Set when the transaction performs DDL.
    pub is_schema_changed: bool,
    /// Bytes allocated for this transaction, by category.
    pub alloc_stats: [u64; ALLOC_CATEGORY_COUNT],
}

impl Txn {
    pub(crate) fn new(id: TxnId, isolation: Isolation) -> Self {
        Self {
            id,
            psn: Psn::NONE,
            rv_psn: Psn::NONE,
            isolation,
            status: TxnStatus::InProgress,
            read_set: Vec::new(),
            gap_list: Vec::new(),
            point_holes: Vec::new(),
            stmts: Vec::new(),
            is_schema_changed: false,
            alloc_stats: [0; ALLOC_CATEGORY_COUNT],
        }
    }

    /// Whether the transaction has performed any write.
    #[inline]
    pub fn has_writes(&self) -> bool {
        !self.stmts.is_empty()
    }
}

/// One write statement of a transaction.
///
/// `next_in_del_list` chains the statements of different transactions
/// that all intend to delete the same story; the head of the chain is the
/// story's `del_stmt`.
pub struct Stmt {
    pub txn: TxnId,
    pub space: SpaceId,
    pub add_story: Option<StoryId>,
    pub del_story: Option<StoryId>,
    pub next_in_del_list: Option<StmtId>,
    /// The tuple this statement displaced (or failed to find) was this
    /// transaction's own change, so no precondition tracking is needed.
    pub is_own_change: bool,
    /// Saved for the storyless rollback path: what the statement removed
    /// and inserted, physically.
    pub rollback_old: Option<Tuple>,
    pub rollback_new: Option<Tuple>,
}

impl Stmt {
    pub(crate) fn new(txn: TxnId, space: SpaceId) -> Self {
        Self {
            txn,
            space,
            add_story: None,
            del_story: None,
            next_in_del_list: None,
            is_own_change: false,
            rollback_old: None,
            rollback_new: None,
        }
    }
}
