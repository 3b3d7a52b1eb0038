use std::sync::Arc;

use async_trait::async_trait;

use blockmesh_base::Result;
use blockmesh_model::{Block, BlockHeader, BlockId, BlockOperation, BlockType, CollectionId};
use blockmesh_repo::{BlockGets, BlockStore, GetContext, IRepo};

/// Bridges an [`IRepo`] — a local [`blockmesh_repo::Repo`] or any RPC stub
/// reaching one — into the [`BlockStore`] contract `Chain` is generic
/// over. Reads go straight to the repo; writes are unreachable, the same
/// way `blockmesh_repo::store`'s `FixedUnderlying` test double treats its
/// inner store — this type only ever sits as the `inner` of an `Atomic`,
/// which stages mutations itself.
pub struct RepoBackedStore {
    repo: Arc<dyn IRepo>,
    collection_id: CollectionId,
    context: Option<GetContext>,
}

impl RepoBackedStore {
    pub fn new(repo: Arc<dyn IRepo>, collection_id: CollectionId) -> Self {
        RepoBackedStore { repo, collection_id, context: None }
    }

    /// Reads through a specific transaction's or revision's view instead
    /// of latest-committed (spec.md §4.3's `GetContext`).
    pub fn with_context(mut self, context: GetContext) -> Self {
        self.context = Some(context);
        self
    }
}

#[async_trait]
impl BlockStore for RepoBackedStore {
    fn create_block_header(&self, block_type: BlockType, new_id: Option<BlockId>) -> BlockHeader {
        BlockHeader {
            id: new_id.unwrap_or_else(BlockId::generate),
            block_type,
            collection_id: self.collection_id.clone(),
        }
    }

    fn generate_id(&self) -> BlockId {
        BlockId::generate()
    }

    async fn try_get(&self, id: &BlockId) -> Result<Option<Block>> {
        let mut results = self
            .repo
            .get(BlockGets { block_ids: vec![id.clone()], context: self.context.clone() })
            .await?;
        Ok(results.remove(id).and_then(|r| r.block))
    }

    fn insert(&self, _block: Block) -> Result<()> {
        unreachable!("RepoBackedStore is read-only; mutate through an Atomic wrapper")
    }

    fn update(&self, _id: BlockId, _op: BlockOperation) -> Result<()> {
        unreachable!("RepoBackedStore is read-only; mutate through an Atomic wrapper")
    }

    fn delete(&self, _id: BlockId) -> Result<()> {
        unreachable!("RepoBackedStore is read-only; mutate through an Atomic wrapper")
    }
}
