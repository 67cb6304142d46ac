//! Reference-counted immutable tuples.
//!
//! A tuple is owned jointly by version records, by the primary index when
//! physically present, and transiently by readers; `Arc` covers all of
//! them. The `dirty` flag marks tuples that have at least one version
//! record attached — the engine branches on it on every lookup, so it
//! lives inside the shared allocation rather than in a side table.
//!
//! Tuples compare by identity, not by content: two separately allocated
//! tuples with equal fields are different tuples, exactly like two rows
//! that happen to carry the same values.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::value::Value;

struct TupleInner {
    fields: Box<[Value]>,
    dirty: AtomicBool,
}

/// An immutable, reference-counted, schema-conformant row.
#[derive(Clone)]
pub struct Tuple(Arc<TupleInner>);

/// Identity of a tuple allocation. Stable for the lifetime of the tuple;
/// used as the key of the version-record hash and the snapshot cleaner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TupleAddr(usize);

impl Tuple {
    /// Allocate a new clean tuple from its field values.
    pub fn new(fields: impl Into<Vec<Value>>) -> Self {
        Self(Arc::new(TupleInner {
            fields: fields.into().into_boxed_slice(),
            dirty: AtomicBool::new(false),
        }))
    }

    /// All fields of the tuple.
    #[inline]
    pub fn fields(&self) -> &[Value] {
        &self.0.fields
    }

    /// Field at `pos`, if present.
    #[inline]
    pub fn field(&self, pos: u32) -> Option<&Value> {
        self.0.fields.get(pos as usize)
    }

    /// Identity of this tuple's allocation.
    #[inline]
    pub fn addr(&self) -> TupleAddr {
        TupleAddr(Arc::as_ptr(&self.0) as usize)
    }

    /// Whether at least one version record references this tuple.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.0.dirty.load(Ordering::Relaxed)
    }

    /// Mark the tuple as having a version record attached.
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.0.dirty.store(dirty, Ordering::Relaxed);
    }

    /// Whether `self` and `other` are the same tuple allocation.
    #[inline]
    pub fn same(&self, other: &Tuple) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Approximate in-memory size, used for statistics.
    pub fn bsize(&self) -> usize {
        self.0.fields.iter().map(Value::bsize).sum::<usize>()
    }
}

impl PartialEq for Tuple {
    /// Identity comparison.
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Tuple {}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for v in self.fields() {
            list.entry(&format_args!("{v}"));
        }
        list.finish()
    }
}
