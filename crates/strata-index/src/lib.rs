//! The index layer the transaction engine sits beneath.
//!
//! A space is a typed table with a primary key and zero or more secondary
//! keys. This crate owns the physical index storage (ordered, unordered and
//! functional), key extraction and comparison, and the small set of
//! primitives the MVCC engine consumes: `replace`, lookups, range scans,
//! range counts and duplicate-key checking. Everything transactional —
//! version chains, visibility, conflict tracking — lives above, in
//! `strata-mvcc`.

pub mod def;
pub mod index;
pub mod iterator;
pub mod key;
pub mod space;

pub use def::{DupMode, IndexDef, IndexKind, KeyFn};
pub use index::Index;
pub use iterator::{direction, key_matches, key_matches_until, tuple_key_is_before, IteratorType};
pub use key::{compare_prefix, IndexKey, KeyDef};
pub use space::{Space, SpaceStat};
