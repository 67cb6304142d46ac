//! Identifier newtypes.
//!
//! All of these are plain integers with a dedicated type so that a space id
//! can never be passed where a transaction id is expected. Construction is
//! `const` and infallible; domains that need validation (index ordinals
//! against a space's index count) validate at the point of use.

use std::fmt;

/// Identifier of a space (a typed table with a primary key and zero or more
/// secondary keys).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct SpaceId(u32);

impl SpaceId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "space#{}", self.0)
    }
}

/// Ordinal of an index within its space. Ordinal 0 is always the primary
/// index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct IndexOrd(u32);

impl IndexOrd {
    /// The primary index.
    pub const PRIMARY: Self = Self(0);

    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Whether this is the primary index ordinal.
    #[inline]
    pub const fn is_primary(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for IndexOrd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "index#{}", self.0)
    }
}

/// Monotonically increasing transaction identifier. Never reused within a
/// process lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// Prepare sequence number.
///
/// Assigned to a transaction when it is prepared; induces the serialization
/// order of prepared writes. `Psn::NONE` (zero) means "not prepared".
/// [`Psn::ROLLBACKED`] is a synthetic value below every real PSN, stamped as
/// the delete PSN of rolled-back version records so that no reader can ever
/// see them; real PSNs start at [`Psn::MIN_REAL`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Psn(u64);

impl Psn {
    /// "No PSN assigned."
    pub const NONE: Self = Self(0);

    /// Synthetic PSN stamped on rolled-back version records. Below every
    /// PSN a transaction can be assigned.
    pub const ROLLBACKED: Self = Self(1);

    /// The first PSN the manager hands out to a prepared transaction.
    pub const MIN_REAL: Self = Self(2);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether a PSN has been assigned.
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }

    /// Whether no PSN has been assigned.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// The next PSN in sequence.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Psn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "psn#{}", self.0)
    }
}
