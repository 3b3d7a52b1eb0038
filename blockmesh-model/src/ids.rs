use std::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An opaque identifier for a block, globally unique within its collection.
/// Equality is bytewise; the core does not interpret the contents (a
/// content-addressed hash and a locally-allocated uuid are both valid
/// producers of a BlockId, see [`BlockId::generate`] and
/// [`BlockId::from_content_hash`]).
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct BlockId(pub String);

impl BlockId {
    pub fn generate() -> Self {
        BlockId(Uuid::new_v4().to_string())
    }

    pub fn from_content_hash(hash: u64) -> Self {
        BlockId(format!("{hash:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlockId {
    fn from(s: &str) -> Self {
        BlockId(s.to_owned())
    }
}

/// A unique identifier for a single transaction attempt. Generated fresh
/// per attempt; a retried transaction gets a new TrxId.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TrxId(pub String);

impl TrxId {
    pub fn generate() -> Self {
        TrxId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TrxId {
    fn from(s: &str) -> Self {
        TrxId(s.to_owned())
    }
}

/// Identifies which collection (chain, log, b-tree, ...) a block belongs to.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct CollectionId(pub String);

impl CollectionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CollectionId {
    fn from(s: &str) -> Self {
        CollectionId(s.to_owned())
    }
}

/// A block's monotonically increasing revision counter. Rev 0 means "no
/// committed revision yet".
pub type Rev = u64;

pub const NO_REV: Rev = 0;
