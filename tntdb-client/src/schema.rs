//! Client-side schema snapshot.
//!
//! Maps space and index names to the numeric ids the protocol speaks.
//! Populated by [`crate::Client::parse_schema`]; request traffic only
//! reads it.

use std::collections::HashMap;

/// Per-space metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceMeta {
    /// Numeric space id.
    pub id: u32,
    /// Index name to index id.
    pub indexes: HashMap<String, u32>,
}

/// Snapshot of the server-side schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    spaces: HashMap<String, SpaceMeta>,
}

impl Schema {
    pub(crate) fn insert(&mut self, name: String, meta: SpaceMeta) {
        self.spaces.insert(name, meta);
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn space(&self, name: &str) -> Option<&SpaceMeta> {
        self.spaces.get(name)
    }

    pub fn space_id(&self, name: &str) -> Option<u32> {
        self.spaces.get(name).map(|meta| meta.id)
    }

    pub fn index_id(&self, space: &str, index: &str) -> Option<u32> {
        self.spaces.get(space)?.indexes.get(index).copied()
    }

    /// Resolves an index name against whichever space carries the given
    /// numeric id.
    pub fn index_id_in(&self, space_id: u32, index: &str) -> Option<u32> {
        self.spaces
            .values()
            .find(|meta| meta.id == space_id)?
            .indexes
            .get(index)
            .copied()
    }
}

/// A space given as numeric id or name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceRef<'a> {
    Id(u32),
    Name(&'a str),
}

impl From<u32> for SpaceRef<'_> {
    fn from(id: u32) -> Self {
        SpaceRef::Id(id)
    }
}

impl<'a> From<&'a str> for SpaceRef<'a> {
    fn from(name: &'a str) -> Self {
        SpaceRef::Name(name)
    }
}

impl<'a> From<&'a String> for SpaceRef<'a> {
    fn from(name: &'a String) -> Self {
        SpaceRef::Name(name)
    }
}

/// An index given as numeric id or name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexRef<'a> {
    Id(u32),
    Name(&'a str),
}

impl From<u32> for IndexRef<'_> {
    fn from(id: u32) -> Self {
        IndexRef::Id(id)
    }
}

impl<'a> From<&'a str> for IndexRef<'a> {
    fn from(name: &'a str) -> Self {
        IndexRef::Name(name)
    }
}

impl<'a> From<&'a String> for IndexRef<'a> {
    fn from(name: &'a String) -> Self {
        IndexRef::Name(name)
    }
}
