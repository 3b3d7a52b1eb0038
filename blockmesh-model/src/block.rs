use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use crate::ids::{BlockId, CollectionId};
use crate::value::{FieldName, FieldValue};

/// A 3-letter tag plus a human-readable name, e.g. `("CHN", "chain header")`.
/// BlockType is immutable once registered; see [`crate::registry::BlockTypeRegistry`].
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct BlockType {
    pub tag: [u8; 3],
    pub name: String,
}

impl BlockType {
    pub fn new(tag: [u8; 3], name: impl Into<String>) -> Self {
        BlockType { tag, name: name.into() }
    }

    pub fn tag_str(&self) -> String {
        String::from_utf8_lossy(&self.tag).into_owned()
    }
}

/// Immutable once created. A block's identity is its header's id.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct BlockHeader {
    pub id: BlockId,
    pub block_type: BlockType,
    pub collection_id: CollectionId,
}

/// The unit of state, mutation, and composition. A block's value is its
/// full field record; its identity is `header.id`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub fields: BTreeMap<FieldName, FieldValue>,
}

impl Block {
    pub fn new(header: BlockHeader) -> Self {
        Block { header, fields: BTreeMap::new() }
    }

    pub fn with_field(mut self, name: impl Into<FieldName>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn id(&self) -> &BlockId {
        &self.header.id
    }
}
