use std::collections::BTreeMap;

use blockmesh_base::{invariant_err, Result};

use crate::block::BlockType;

/// Process-wide registry of known block types, mapped to an explicit value
/// threaded through construction rather than a lazily-initialized global
/// (spec.md §9's "Global mutable state" note: either mapping is acceptable;
/// an explicit value is easier to test and to run several independent
/// realms in one process).
#[derive(Clone, Debug, Default)]
pub struct BlockTypeRegistry {
    by_tag: BTreeMap<[u8; 3], BlockType>,
}

impl BlockTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, block_type: BlockType) -> Result<()> {
        if self.by_tag.contains_key(&block_type.tag) {
            return Err(invariant_err(format!(
                "block type tag {:?} already registered",
                block_type.tag_str()
            )));
        }
        self.by_tag.insert(block_type.tag, block_type);
        Ok(())
    }

    pub fn get(&self, tag: &[u8; 3]) -> Option<&BlockType> {
        self.by_tag.get(tag)
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut reg = BlockTypeRegistry::new();
        reg.register(BlockType::new(*b"CHN", "chain header")).unwrap();
        assert_eq!(reg.get(b"CHN").unwrap().name, "chain header");
        assert!(reg.get(b"DAT").is_none());
    }

    #[test]
    fn duplicate_registration_is_an_invariant_error() {
        let mut reg = BlockTypeRegistry::new();
        reg.register(BlockType::new(*b"CHN", "chain header")).unwrap();
        assert!(reg.register(BlockType::new(*b"CHN", "dup")).is_err());
    }
}
