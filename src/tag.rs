//! Relation and block identities
//!
//! A [`RelTag`] names a relation, a [`ForkNumber`] selects one of its block
//! streams, and a [`BufferTag`] pins down a single block. `BufferTag` is the
//! hash key of the prefetch index: equality and hashing are bitwise over the
//! tuple.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PageStoreError, Result};

/// Identity of a relation: tablespace, database, and relation oids.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RelTag {
    /// Tablespace oid
    pub spc_node: u32,
    /// Database oid; zero for shared catalogs
    pub db_node: u32,
    /// Relation oid
    pub rel_node: u32,
}

impl RelTag {
    /// Create a new relation tag.
    pub fn new(spc_node: u32, db_node: u32, rel_node: u32) -> Self {
        Self {
            spc_node,
            db_node,
            rel_node,
        }
    }

    /// The all-zeros tag some catalog paths probe existence with.
    pub fn is_zero(&self) -> bool {
        *self == RelTag::default()
    }
}

impl fmt::Display for RelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spc_node, self.db_node, self.rel_node)
    }
}

/// A named stream of blocks within a relation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ForkNumber {
    /// The main data fork
    Main = 0,
    /// Free space map
    Fsm = 1,
    /// Visibility map
    VisibilityMap = 2,
    /// Init fork of unlogged relations
    Init = 3,
}

impl ForkNumber {
    /// All forks, in fork-number order.
    pub const ALL: [ForkNumber; 4] = [
        ForkNumber::Main,
        ForkNumber::Fsm,
        ForkNumber::VisibilityMap,
        ForkNumber::Init,
    ];

    /// The fork's wire encoding.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a fork number from its wire encoding.
    pub fn from_u8(value: u8) -> Option<ForkNumber> {
        match value {
            0 => Some(ForkNumber::Main),
            1 => Some(ForkNumber::Fsm),
            2 => Some(ForkNumber::VisibilityMap),
            3 => Some(ForkNumber::Init),
            _ => None,
        }
    }
}

impl fmt::Display for ForkNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Identity of a single block: the hash key used throughout the prefetch
/// pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferTag {
    /// The relation the block belongs to
    pub rel: RelTag,
    /// The fork within the relation
    pub fork: ForkNumber,
    /// Block number within the fork
    pub block: u32,
}

impl BufferTag {
    /// Create a new buffer tag.
    pub fn new(rel: RelTag, fork: ForkNumber, block: u32) -> Self {
        Self { rel, fork, block }
    }
}

impl fmt::Display for BufferTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} blk {}", self.rel, self.fork, self.block)
    }
}

/// Persistence class of a relation, as recorded on the storage handle.
///
/// `Unknown` means the handle was opened without the catalog at hand, which
/// happens on buffer eviction and transaction-end unlink. Only a few
/// operations are permitted in that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Persistence {
    /// Not resolved yet; only write/unlink/exists/close are permitted
    Unknown,
    /// Ordinary WAL-logged relation, stored on the page server
    Permanent,
    /// Session-local temporary relation, stored on local disk
    Temp,
    /// Unlogged relation, stored on local disk
    Unlogged,
}

impl Persistence {
    /// Decode the catalog's persistence byte. Zero means unresolved.
    pub fn from_byte(value: u8) -> Result<Persistence> {
        match value {
            0 => Ok(Persistence::Unknown),
            b'p' => Ok(Persistence::Permanent),
            b't' => Ok(Persistence::Temp),
            b'u' => Ok(Persistence::Unlogged),
            other => Err(PageStoreError::UnknownPersistence {
                value: other as char,
            }),
        }
    }
}

/// A relation as seen by the storage layer: its identity plus the
/// persistence class the caller opened it with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    /// The relation's identity
    pub tag: RelTag,
    /// Persistence class; may be `Unknown` for handles opened without the
    /// catalog
    pub persistence: Persistence,
}

impl Relation {
    /// Open a relation handle with a known persistence class.
    pub fn new(tag: RelTag, persistence: Persistence) -> Self {
        Self { tag, persistence }
    }

    /// Open a permanent relation handle.
    pub fn permanent(tag: RelTag) -> Self {
        Self::new(tag, Persistence::Permanent)
    }

    /// Open a handle without resolving persistence.
    pub fn unresolved(tag: RelTag) -> Self {
        Self::new(tag, Persistence::Unknown)
    }
}
