use std::sync::Mutex;

use async_trait::async_trait;
use blockmesh_base::Result;
use blockmesh_model::{
    apply_transform, block_ids_for_transforms, empty_transforms, transform_for_block_id, Block,
    BlockHeader, BlockId, BlockOperation, BlockType, CollectionId, Transforms,
};

/// The contract every block-backed store satisfies, per spec.md §4.2.
/// `insert`/`update`/`delete` stage mutations against an implicit
/// transaction scope owned by the implementor; `try_get` resolves reads
/// against that same implicit scope.
#[async_trait]
pub trait BlockStore: Send + Sync {
    fn create_block_header(&self, block_type: BlockType, new_id: Option<BlockId>) -> BlockHeader;
    fn generate_id(&self) -> BlockId;
    async fn try_get(&self, id: &BlockId) -> Result<Option<Block>>;
    fn insert(&self, block: Block) -> Result<()>;
    fn update(&self, id: BlockId, op: BlockOperation) -> Result<()>;
    fn delete(&self, id: BlockId) -> Result<()>;
}

/// Lets a caller hand out `&S` to build several independent `Atomic<&S>`
/// edits without moving `S` itself (e.g. `Chain`'s mutators, each of which
/// wants its own short-lived `Atomic` over the same backing store).
#[async_trait]
impl<'a, T: BlockStore + ?Sized> BlockStore for &'a T {
    fn create_block_header(&self, block_type: BlockType, new_id: Option<BlockId>) -> BlockHeader {
        (**self).create_block_header(block_type, new_id)
    }

    fn generate_id(&self) -> BlockId {
        (**self).generate_id()
    }

    async fn try_get(&self, id: &BlockId) -> Result<Option<Block>> {
        (**self).try_get(id).await
    }

    fn insert(&self, block: Block) -> Result<()> {
        (**self).insert(block)
    }

    fn update(&self, id: BlockId, op: BlockOperation) -> Result<()> {
        (**self).update(id, op)
    }

    fn delete(&self, id: BlockId) -> Result<()> {
        (**self).delete(id)
    }
}

fn create_header(collection_id: &CollectionId, block_type: BlockType, new_id: Option<BlockId>) -> BlockHeader {
    BlockHeader {
        id: new_id.unwrap_or_else(BlockId::generate),
        block_type,
        collection_id: collection_id.clone(),
    }
}

/// A `BlockStore` that buffers all mutations into a [`Transforms`] without
/// reaching the network. `commit()`/`reset()` let a higher layer (Chain)
/// construct an atomic multi-block mutation and hand it to the Repo or
/// NetworkTransactor as one `pend`+`commit`.
pub struct Tracker {
    collection_id: CollectionId,
    transforms: Mutex<Transforms>,
}

impl Tracker {
    pub fn new(collection_id: CollectionId) -> Self {
        Tracker { collection_id, transforms: Mutex::new(empty_transforms()) }
    }

    /// Hand back the accumulated Transforms and clear the buffer.
    pub fn commit(&self) -> Transforms {
        let mut guard = self.transforms.lock().expect("tracker mutex poisoned");
        std::mem::replace(&mut *guard, empty_transforms())
    }

    pub fn reset(&self) {
        let mut guard = self.transforms.lock().expect("tracker mutex poisoned");
        *guard = empty_transforms();
    }

    pub fn peek(&self) -> Transforms {
        self.transforms.lock().expect("tracker mutex poisoned").clone()
    }
}

#[async_trait]
impl BlockStore for Tracker {
    fn create_block_header(&self, block_type: BlockType, new_id: Option<BlockId>) -> BlockHeader {
        create_header(&self.collection_id, block_type, new_id)
    }

    fn generate_id(&self) -> BlockId {
        BlockId::generate()
    }

    async fn try_get(&self, id: &BlockId) -> Result<Option<Block>> {
        let guard = self.transforms.lock().expect("tracker mutex poisoned");
        let t = transform_for_block_id(&guard, id);
        apply_transform(None, &t).or(Ok(None))
    }

    fn insert(&self, block: Block) -> Result<()> {
        self.transforms.lock().expect("tracker mutex poisoned").insert_block(block)
    }

    fn update(&self, id: BlockId, op: BlockOperation) -> Result<()> {
        self.transforms.lock().expect("tracker mutex poisoned").update_block(id, op)
    }

    fn delete(&self, id: BlockId) -> Result<()> {
        self.transforms.lock().expect("tracker mutex poisoned").delete_block(id)
    }
}

/// Wraps a real [`BlockStore`], buffers mutations while allowing reads that
/// see staged writes superimposed on the underlying store, and exposes the
/// buffered [`Transforms`] at `commit()` for a caller (typically a Chain)
/// to submit as one transaction.
pub struct Atomic<S: BlockStore> {
    inner: S,
    staged: Mutex<Transforms>,
}

impl<S: BlockStore> Atomic<S> {
    pub fn new(inner: S) -> Self {
        Atomic { inner, staged: Mutex::new(empty_transforms()) }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn commit(&self) -> Transforms {
        let mut guard = self.staged.lock().expect("atomic mutex poisoned");
        std::mem::replace(&mut *guard, empty_transforms())
    }

    pub fn reset(&self) {
        let mut guard = self.staged.lock().expect("atomic mutex poisoned");
        *guard = empty_transforms();
    }

    fn staged_ids(&self) -> Vec<BlockId> {
        block_ids_for_transforms(&self.staged.lock().expect("atomic mutex poisoned"))
            .into_iter()
            .collect()
    }
}

#[async_trait]
impl<S: BlockStore> BlockStore for Atomic<S> {
    fn create_block_header(&self, block_type: BlockType, new_id: Option<BlockId>) -> BlockHeader {
        self.inner.create_block_header(block_type, new_id)
    }

    fn generate_id(&self) -> BlockId {
        self.inner.generate_id()
    }

    async fn try_get(&self, id: &BlockId) -> Result<Option<Block>> {
        let staged_transform = {
            let guard = self.staged.lock().expect("atomic mutex poisoned");
            transform_for_block_id(&guard, id)
        };
        if staged_transform.delete {
            return Ok(None);
        }
        if staged_transform.insert.is_some() {
            return apply_transform(None, &staged_transform);
        }
        let underlying = self.inner.try_get(id).await?;
        if staged_transform.updates.is_empty() {
            return Ok(underlying);
        }
        apply_transform(underlying, &staged_transform)
    }

    fn insert(&self, block: Block) -> Result<()> {
        self.staged.lock().expect("atomic mutex poisoned").insert_block(block)
    }

    fn update(&self, id: BlockId, op: BlockOperation) -> Result<()> {
        self.staged.lock().expect("atomic mutex poisoned").update_block(id, op)
    }

    fn delete(&self, id: BlockId) -> Result<()> {
        self.staged.lock().expect("atomic mutex poisoned").delete_block(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use blockmesh_model::{FieldValue, Value};

    fn block(id: &str, n: i64) -> Block {
        Block::new(BlockHeader {
            id: BlockId::from(id),
            block_type: BlockType::new(*b"TST", "test"),
            collection_id: CollectionId::from("c1"),
        })
        .with_field("n", FieldValue::Scalar(Value::I64(n)))
    }

    #[tokio::test]
    async fn tracker_read_after_write_sees_own_insert() {
        let tracker = Tracker::new(CollectionId::from("c1"));
        tracker.insert(block("b1", 1)).unwrap();
        let got = tracker.try_get(&BlockId::from("b1")).await.unwrap().unwrap();
        assert_eq!(got.field("n").unwrap().as_scalar().unwrap().as_i64(), Some(1));
    }

    #[tokio::test]
    async fn tracker_commit_drains_and_resets() {
        let tracker = Tracker::new(CollectionId::from("c1"));
        tracker.insert(block("b1", 1)).unwrap();
        let t = tracker.commit();
        assert_eq!(t.inserts.len(), 1);
        assert!(tracker.peek().is_empty());
    }

    struct FixedUnderlying(Block);

    #[async_trait]
    impl BlockStore for FixedUnderlying {
        fn create_block_header(&self, block_type: BlockType, new_id: Option<BlockId>) -> BlockHeader {
            create_header(&CollectionId::from("c1"), block_type, new_id)
        }
        fn generate_id(&self) -> BlockId {
            BlockId::generate()
        }
        async fn try_get(&self, id: &BlockId) -> Result<Option<Block>> {
            if *id == self.0.id().clone() { Ok(Some(self.0.clone())) } else { Ok(None) }
        }
        fn insert(&self, _block: Block) -> Result<()> {
            unreachable!("underlying store should not be written through directly in this test")
        }
        fn update(&self, _id: BlockId, _op: BlockOperation) -> Result<()> {
            unreachable!()
        }
        fn delete(&self, _id: BlockId) -> Result<()> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn atomic_superimposes_staged_update_on_underlying_read() {
        let underlying = FixedUnderlying(block("b1", 1));
        let atomic = Atomic::new(underlying);
        atomic
            .update(BlockId::from("b1"), BlockOperation::replace_scalar("n", Value::I64(42)))
            .unwrap();
        let got = atomic.try_get(&BlockId::from("b1")).await.unwrap().unwrap();
        assert_eq!(got.field("n").unwrap().as_scalar().unwrap().as_i64(), Some(42));
    }

    #[tokio::test]
    async fn atomic_staged_delete_hides_underlying_block() {
        let underlying = FixedUnderlying(block("b1", 1));
        let atomic = Atomic::new(underlying);
        atomic.delete(BlockId::from("b1")).unwrap();
        assert!(atomic.try_get(&BlockId::from("b1")).await.unwrap().is_none());
    }
}
