//! Index definitions.

use std::fmt;
use std::sync::Arc;

use strata_types::Tuple;

use crate::key::{IndexKey, KeyDef};

/// User function of a functional index: computes a single key for a tuple,
/// or `None` if the key cannot be produced (which the engine treats as
/// fatal — chain identity depends on the key being computable).
pub type KeyFn = Arc<dyn Fn(&Tuple) -> Option<IndexKey> + Send + Sync>;

/// Kind of index storage and key derivation.
#[derive(Clone)]
pub enum IndexKind {
    /// Ordered index over positional key fields.
    Tree,
    /// Unordered unique index over positional key fields.
    Hash,
    /// Ordered index whose key is produced by a user function.
    /// `part_count` is the number of parts the function produces.
    Func { func: KeyFn, part_count: u32 },
}

impl fmt::Debug for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Tree => write!(f, "Tree"),
            IndexKind::Hash => write!(f, "Hash"),
            IndexKind::Func { part_count, .. } => {
                write!(f, "Func {{ part_count: {part_count} }}")
            }
        }
    }
}

/// Physical update mode of `replace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DupMode {
    /// The key must not be taken by a visible tuple.
    Insert,
    /// A visible tuple with the key must already exist.
    Replace,
    /// Either way.
    ReplaceOrInsert,
}

/// Definition of one index of a space.
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub unique: bool,
    /// Multikey indexes produce several keys per tuple; the transaction
    /// engine does not support them and refuses the space at creation.
    pub multikey: bool,
    pub kind: IndexKind,
    pub key: KeyDef,
}

impl IndexDef {
    /// An ordered index over `parts`.
    pub fn tree(name: impl Into<String>, parts: impl IntoIterator<Item = u32>, unique: bool) -> Self {
        Self {
            name: name.into(),
            unique,
            multikey: false,
            kind: IndexKind::Tree,
            key: KeyDef::new(parts),
        }
    }

    /// An unordered index over `parts`. Hash indexes are always unique.
    pub fn hash(name: impl Into<String>, parts: impl IntoIterator<Item = u32>) -> Self {
        Self {
            name: name.into(),
            unique: true,
            multikey: false,
            kind: IndexKind::Hash,
            key: KeyDef::new(parts),
        }
    }

    /// An ordered functional index; `func` produces `part_count` key parts
    /// per tuple.
    pub fn func(name: impl Into<String>, func: KeyFn, part_count: u32, unique: bool) -> Self {
        Self {
            name: name.into(),
            unique,
            multikey: false,
            kind: IndexKind::Func { func, part_count },
            key: KeyDef::new([]),
        }
    }

    /// Number of declared key parts.
    pub fn part_count(&self) -> u32 {
        match &self.kind {
            IndexKind::Func { part_count, .. } => *part_count,
            _ => self.key.part_count(),
        }
    }

    /// Whether the index supports ordered iteration.
    pub fn is_ordered(&self) -> bool {
        !matches!(self.kind, IndexKind::Hash)
    }
}
