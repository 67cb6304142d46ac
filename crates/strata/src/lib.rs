//! strata: an in-memory transactional key-value store.
//!
//! This facade re-exports the public surface of the workspace crates and
//! hosts the process-wide engine instance. Embedders that manage their
//! own [`TxManager`] can ignore the global and construct one directly;
//! everyone else calls [`init`] once (or not at all, for defaults) and
//! goes through [`with_manager`].

use std::sync::OnceLock;

use parking_lot::Mutex;

pub use strata_error::{Result, StrataError};
pub use strata_index::{
    DupMode, Index, IndexDef, IndexKey, IndexKind, IteratorType, KeyDef, KeyFn, Space, SpaceStat,
};
pub use strata_mvcc::{Isolation, SnapshotCleaner, Statistics, TxManager, TxnStatus};
pub use strata_types::{IndexOrd, Psn, SpaceId, Tuple, TupleAddr, TxnId, Value};

/// Engine configuration, fixed at initialization.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// With the engine off, reads return their input unchanged, trackers
    /// are no-ops and writes apply to the indexes directly.
    pub mvcc_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { mvcc_enabled: true }
    }
}

static MANAGER: OnceLock<Mutex<TxManager>> = OnceLock::new();

/// Initialize the process-wide engine. Returns `false` if it was already
/// initialized (the configuration is then left as it was).
pub fn init(config: EngineConfig) -> bool {
    let manager = if config.mvcc_enabled {
        TxManager::new()
    } else {
        TxManager::disabled()
    };
    MANAGER.set(Mutex::new(manager)).is_ok()
}

/// Run `f` against the process-wide engine, initializing it with the
/// default configuration on first use.
pub fn with_manager<R>(f: impl FnOnce(&mut TxManager) -> R) -> R {
    let manager = MANAGER.get_or_init(|| Mutex::new(TxManager::new()));
    f(&mut manager.lock())
}
