//! Spaces: typed tables with a primary key and zero or more secondary keys.

use strata_error::{Result, StrataError};
use strata_types::{SpaceId, Tuple};

use crate::def::{IndexDef, IndexKind};
use crate::index::Index;

/// Per-space tuple statistic, updated when statements commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceStat {
    /// Number of committed tuples.
    pub tuple_count: u64,
    /// Approximate committed payload bytes.
    pub bytes: u64,
}

/// A space and its physical indexes.
#[derive(Debug)]
pub struct Space {
    pub id: SpaceId,
    pub name: String,
    /// System spaces are always read with prepared changes visible.
    pub is_system: bool,
    indexes: Vec<Index>,
    pub stat: SpaceStat,
}

impl Space {
    /// Build a space from its index definitions. The first definition is
    /// the primary index.
    pub fn new(id: SpaceId, name: impl Into<String>, defs: Vec<IndexDef>) -> Result<Self> {
        let name = name.into();
        let Some(pk_def) = defs.first() else {
            return Err(StrataError::InvalidSpaceDef {
                reason: format!("space '{name}' has no primary index"),
            });
        };
        if !pk_def.unique {
            return Err(StrataError::InvalidSpaceDef {
                reason: format!("primary index '{}' must be unique", pk_def.name),
            });
        }
        if matches!(pk_def.kind, IndexKind::Func { .. }) {
            return Err(StrataError::InvalidSpaceDef {
                reason: format!("primary index '{}' cannot be functional", pk_def.name),
            });
        }
        if pk_def.key.part_count() == 0 {
            return Err(StrataError::InvalidSpaceDef {
                reason: format!("primary index '{}' has an empty key", pk_def.name),
            });
        }
        for def in &defs {
            if def.multikey {
                return Err(StrataError::MultikeyUnsupported {
                    index: def.name.clone(),
                });
            }
        }
        let pk_parts: Vec<u32> = pk_def.key.parts().to_vec();
        let indexes = defs
            .into_iter()
            .map(|def| Index::new(def, &pk_parts))
            .collect();
        Ok(Self {
            id,
            name,
            is_system: false,
            indexes,
            stat: SpaceStat::default(),
        })
    }

    /// Same as [`Space::new`] but marks the space as a system space.
    pub fn new_system(id: SpaceId, name: impl Into<String>, defs: Vec<IndexDef>) -> Result<Self> {
        let mut space = Self::new(id, name, defs)?;
        space.is_system = true;
        Ok(space)
    }

    #[inline]
    pub fn index_count(&self) -> u32 {
        self.indexes.len() as u32
    }

    #[inline]
    pub fn index(&self, ord: u32) -> &Index {
        &self.indexes[ord as usize]
    }

    #[inline]
    pub fn index_mut(&mut self, ord: u32) -> &mut Index {
        &mut self.indexes[ord as usize]
    }

    #[inline]
    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    /// Fold a committed replacement into the space statistic.
    pub fn update_stat(&mut self, old: Option<&Tuple>, new: Option<&Tuple>) {
        if let Some(t) = old {
            self.stat.tuple_count = self.stat.tuple_count.saturating_sub(1);
            self.stat.bytes = self.stat.bytes.saturating_sub(t.bsize() as u64);
        }
        if let Some(t) = new {
            self.stat.tuple_count += 1;
            self.stat.bytes += t.bsize() as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::Value;

    #[test]
    fn test_space_requires_unique_primary() {
        let err = Space::new(
            SpaceId::new(1),
            "s",
            vec![IndexDef::tree("pk", [0], false)],
        )
        .unwrap_err();
        assert!(matches!(err, StrataError::InvalidSpaceDef { .. }));
    }

    #[test]
    fn test_space_refuses_multikey() {
        let mut def = IndexDef::tree("sk", [1], false);
        def.multikey = true;
        let err = Space::new(
            SpaceId::new(1),
            "s",
            vec![IndexDef::tree("pk", [0], true), def],
        )
        .unwrap_err();
        assert!(matches!(err, StrataError::MultikeyUnsupported { .. }));
    }

    #[test]
    fn test_stat_tracks_commits() {
        let mut space = Space::new(
            SpaceId::new(1),
            "s",
            vec![IndexDef::tree("pk", [0], true)],
        )
        .unwrap();
        let t = Tuple::new(vec![Value::Int(1)]);
        space.update_stat(None, Some(&t));
        assert_eq!(space.stat.tuple_count, 1);
        space.update_stat(Some(&t), None);
        assert_eq!(space.stat.tuple_count, 0);
    }
}
