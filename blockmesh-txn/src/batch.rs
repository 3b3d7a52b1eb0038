use std::collections::{BTreeMap, BTreeSet};

use blockmesh_base::Result;
use blockmesh_model::{BlockId, Transforms};
use blockmesh_net::{IKeyNetwork, PeerId};

/// Groups `ids` by their coordinating peer (spec.md §4.4 "Batching"). Each
/// id is looked up independently with the same `excluded_peers` set, so
/// blocks sharing a coordinator naturally land in the same batch.
pub async fn group_by_coordinator(
    network: &dyn IKeyNetwork,
    ids: &[BlockId],
    excluded_peers: &BTreeSet<PeerId>,
) -> Result<BTreeMap<PeerId, Vec<BlockId>>> {
    let mut out: BTreeMap<PeerId, Vec<BlockId>> = BTreeMap::new();
    for id in ids {
        let peer = network.find_coordinator(id.as_str().as_bytes(), excluded_peers).await?;
        out.entry(peer).or_default().push(id.clone());
    }
    Ok(out)
}

/// Restricts a `Transforms` bundle to just the given block ids — the
/// per-batch payload-merge function spec.md §4.4 calls for, specialized to
/// the pend/commit transform shape.
pub fn sub_transforms(transforms: &Transforms, ids: &[BlockId]) -> Transforms {
    let id_set: BTreeSet<&BlockId> = ids.iter().collect();
    Transforms {
        inserts: transforms
            .inserts
            .iter()
            .filter(|(id, _)| id_set.contains(id))
            .map(|(id, b)| (id.clone(), b.clone()))
            .collect(),
        updates: transforms
            .updates
            .iter()
            .filter(|(id, _)| id_set.contains(id))
            .map(|(id, ops)| (id.clone(), ops.clone()))
            .collect(),
        deletes: transforms.deletes.iter().filter(|id| id_set.contains(id)).cloned().collect(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use blockmesh_model::{empty_transforms, Block, BlockHeader, BlockType, CollectionId};

    #[cfg(test)]
    use test_log::test;

    fn block(id: &str) -> Block {
        Block::new(BlockHeader {
            id: BlockId::from(id),
            block_type: BlockType::new(*b"TST", "test"),
            collection_id: CollectionId::from("c1"),
        })
    }

    #[test]
    fn sub_transforms_keeps_only_requested_ids() {
        let mut t = empty_transforms();
        t.insert_block(block("a")).unwrap();
        t.insert_block(block("b")).unwrap();
        let sub = sub_transforms(&t, &[BlockId::from("a")]);
        assert_eq!(sub.inserts.len(), 1);
        assert!(sub.inserts.contains_key(&BlockId::from("a")));
    }
}
