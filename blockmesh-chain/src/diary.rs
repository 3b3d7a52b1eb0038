use blockmesh_base::Result;
use blockmesh_model::{BlockId, Value};
use blockmesh_repo::BlockStore;

use crate::chain::{Chain, ChainEdit, Path};

/// An append-only `Chain`: exposes `append`/`select`/`get_head`/
/// `get_tail` but not `pop`/`dequeue` — deletion is refused at the type
/// level, not just by convention.
pub struct Diary<S: BlockStore> {
    chain: Chain<S>,
}

impl<S: BlockStore> Diary<S> {
    pub fn create(store: S) -> (Diary<S>, ChainEdit) {
        let (chain, edit) = Chain::create(store);
        (Diary { chain }, edit)
    }

    pub async fn open(store: S, id: BlockId) -> Result<(Diary<S>, Option<ChainEdit>)> {
        let (chain, edit) = Chain::open(store, id).await?;
        Ok((Diary { chain }, edit))
    }

    pub fn header_id(&self) -> &BlockId {
        self.chain.header_id()
    }

    pub fn chain(&self) -> &Chain<S> {
        &self.chain
    }

    pub async fn append(&self, entries: Vec<Value>) -> Result<ChainEdit> {
        self.chain.add(entries).await
    }

    pub async fn select(
        &self,
        starting_path: Option<Path>,
        forward: bool,
        limit: usize,
    ) -> Result<Vec<Path>> {
        self.chain.select(starting_path, forward, limit).await
    }

    pub async fn get_head(&self) -> Result<BlockId> {
        self.chain.get_head().await
    }

    pub async fn get_tail(&self) -> Result<BlockId> {
        self.chain.get_tail().await
    }
}
