//! Foundation types for the strata in-memory transactional store.
//!
//! This crate defines the cross-cutting identifiers (spaces, indexes,
//! transactions, prepare sequence numbers), the scalar [`Value`] model and
//! the reference-counted [`Tuple`] that every other crate builds on.

pub mod ids;
pub mod tuple;
pub mod value;

pub use ids::{IndexOrd, Psn, SpaceId, TxnId};
pub use tuple::{Tuple, TupleAddr};
pub use value::Value;
