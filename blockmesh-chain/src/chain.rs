use blockmesh_base::{invariant_err, Result};
use blockmesh_model::{
    empty_transforms, Block, BlockId, BlockOperation, BlockType, FieldValue, Transforms, Value,
};
use blockmesh_repo::{Atomic, BlockStore};

/// A header (type `"CHN"`) plus a doubly-linked list of data blocks (type
/// `"DAT"`), each holding up to [`ENTRIES_PER_BLOCK`] entries.
pub const ENTRIES_PER_BLOCK: usize = 32;

pub fn chain_header_type() -> BlockType {
    BlockType::new(*b"CHN", "chain header")
}

pub fn chain_data_type() -> BlockType {
    BlockType::new(*b"DAT", "chain data block")
}

/// The result of one `Chain` mutator: a `Transforms` bundle plus the two
/// ids a caller passes to `Repo::commit`/`NetworkTransactor::commit` as
/// `tail_id`/`header_id` so the commit becomes visible only once the block
/// that actually gates reachability (usually the chain header) lands.
/// Named distinctly from Chain's own `head_id`/`tail_id` domain fields to
/// avoid confusing the two unrelated "tail" concepts.
#[derive(Debug)]
pub struct ChainEdit {
    pub transforms: Transforms,
    /// Committed last; this is the block whose commit makes the whole
    /// edit visible to other readers.
    pub commit_last: BlockId,
    /// Committed first, if the edit has one — the single block that must
    /// exist before `commit_last` can safely reference it.
    pub commit_first: Option<BlockId>,
}

impl ChainEdit {
    fn noop(commit_last: BlockId) -> Self {
        ChainEdit { transforms: empty_transforms(), commit_last, commit_first: None }
    }
}

/// A doubly-linked, blockstore-backed deque. Stateless beyond its own
/// header id — all reads and writes go through the supplied `BlockStore`
/// (spec.md §3's "Ownership" note).
pub struct Chain<S: BlockStore> {
    store: S,
    header_id: BlockId,
}

/// `{ header: BlockId, block: BlockId, index: usize }` position within a
/// Chain's entries, resumable across block boundaries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Path {
    pub header: BlockId,
    pub block: BlockId,
    pub index: usize,
}

fn opt_ref_field(id: Option<&BlockId>) -> FieldValue {
    FieldValue::Array(id.map(|i| vec![Value::BlockRef(i.clone())]).unwrap_or_default())
}

fn read_opt_ref(block: &Block, field: &str) -> Result<Option<BlockId>> {
    let arr = block
        .field(field)
        .and_then(FieldValue::as_array)
        .ok_or_else(|| invariant_err(format!("{field} missing or not an array field")))?;
    match arr {
        [] => Ok(None),
        [v] => v
            .as_block_ref()
            .cloned()
            .map(Some)
            .ok_or_else(|| invariant_err(format!("{field} entry is not a block reference"))),
        _ => Err(invariant_err(format!("{field} holds more than one reference"))),
    }
}

fn set_opt_ref_op(field: &str, current_len: usize, id: Option<&BlockId>) -> BlockOperation {
    BlockOperation::splice_array(
        field,
        0,
        current_len,
        id.map(|i| vec![Value::BlockRef(i.clone())]).unwrap_or_default(),
    )
}

fn read_ref(block: &Block, field: &str) -> Result<BlockId> {
    block
        .field(field)
        .and_then(FieldValue::as_scalar)
        .and_then(Value::as_block_ref)
        .cloned()
        .ok_or_else(|| invariant_err(format!("missing or invalid {field}")))
}

fn set_ref_op(field: &str, id: &BlockId) -> BlockOperation {
    BlockOperation::replace_scalar(field, Value::BlockRef(id.clone()))
}

fn entries_of(block: &Block) -> Result<Vec<Value>> {
    block
        .field("entries")
        .and_then(FieldValue::as_array)
        .map(|v| v.to_vec())
        .ok_or_else(|| invariant_err("entries field missing or not an array"))
}

fn new_data_block<S: BlockStore>(
    store: &S,
    prior_id: Option<&BlockId>,
    next_id: Option<&BlockId>,
) -> (BlockId, Block) {
    let header = store.create_block_header(chain_data_type(), None);
    let id = header.id.clone();
    let block = Block::new(header)
        .with_field("entries", FieldValue::Array(Vec::new()))
        .with_field("prior_id", opt_ref_field(prior_id))
        .with_field("next_id", opt_ref_field(next_id));
    (id, block)
}

impl<S: BlockStore> Chain<S> {
    pub fn header_id(&self) -> &BlockId {
        &self.header_id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Allocates an empty tail data block and a header pointing head=tail
    /// at it. One `Transforms` with two inserts; the header is the
    /// visibility gate since nothing can reach the data block except
    /// through it.
    pub fn create(store: S) -> (Chain<S>, ChainEdit) {
        let (tail_id, tail_block) = new_data_block(&store, None, None);

        let header_header = store.create_block_header(chain_header_type(), None);
        let header_id = header_header.id.clone();
        let header_block = Block::new(header_header)
            .with_field("head_id", FieldValue::Scalar(Value::BlockRef(tail_id.clone())))
            .with_field("tail_id", FieldValue::Scalar(Value::BlockRef(tail_id.clone())));

        let mut transforms = empty_transforms();
        transforms.insert_block(tail_block).expect("fresh tail id");
        transforms.insert_block(header_block).expect("fresh header id");

        let chain = Chain { store, header_id: header_id.clone() };
        let edit =
            ChainEdit { transforms, commit_last: header_id, commit_first: Some(tail_id) };
        (chain, edit)
    }

    /// Fetches an existing header. A legacy header missing `head_id`/
    /// `tail_id` is upgraded in place: a fresh empty tail is allocated and
    /// the header patched with two updates (spec.md §4.5's "open").
    pub async fn open(store: S, id: BlockId) -> Result<(Chain<S>, Option<ChainEdit>)> {
        let header_block = store
            .try_get(&id)
            .await?
            .ok_or_else(|| invariant_err(format!("no block with id {id}")))?;

        if read_ref(&header_block, "head_id").is_ok() && read_ref(&header_block, "tail_id").is_ok() {
            return Ok((Chain { store, header_id: id }, None));
        }

        let atomic = Atomic::new(&store);
        let (tail_id, tail_block) = new_data_block(&atomic, None, None);
        atomic.insert(tail_block)?;
        atomic.update(id.clone(), set_ref_op("head_id", &tail_id))?;
        atomic.update(id.clone(), set_ref_op("tail_id", &tail_id))?;
        let transforms = atomic.commit();

        let edit = ChainEdit { transforms, commit_last: id.clone(), commit_first: Some(tail_id) };
        Ok((Chain { store, header_id: id }, Some(edit)))
    }

    async fn header(&self) -> Result<Block> {
        self.store
            .try_get(&self.header_id)
            .await?
            .ok_or_else(|| invariant_err("chain header missing"))
    }

    /// Dereferences `tailId`, following `nextId` past any blocks a
    /// concurrent writer has since chained on (spec.md §4.5's "getTail").
    pub async fn get_tail(&self) -> Result<BlockId> {
        let header = self.header().await?;
        let mut id = read_ref(&header, "tail_id")?;
        loop {
            let block = self
                .store
                .try_get(&id)
                .await?
                .ok_or_else(|| invariant_err(format!("dangling tail_id {id}")))?;
            match read_opt_ref(&block, "next_id")? {
                Some(next) => id = next,
                None => return Ok(id),
            }
        }
    }

    /// Dereferences `headId`, following `priorId` (spec.md §4.5's
    /// "getHead").
    pub async fn get_head(&self) -> Result<BlockId> {
        let header = self.header().await?;
        let mut id = read_ref(&header, "head_id")?;
        loop {
            let block = self
                .store
                .try_get(&id)
                .await?
                .ok_or_else(|| invariant_err(format!("dangling head_id {id}")))?;
            match read_opt_ref(&block, "prior_id")? {
                Some(prior) => id = prior,
                None => return Ok(id),
            }
        }
    }

    /// Appends to the tail, filling the current tail block up to
    /// [`ENTRIES_PER_BLOCK`] and chaining new blocks as needed. All
    /// inserts and updates land in one `Transforms`.
    pub async fn add(&self, mut remaining: Vec<Value>) -> Result<ChainEdit> {
        if remaining.is_empty() {
            return Ok(ChainEdit::noop(self.get_tail().await?));
        }

        let atomic = Atomic::new(&self.store);
        let header = atomic
            .try_get(&self.header_id)
            .await?
            .ok_or_else(|| invariant_err("chain header missing"))?;
        let mut tail_id = read_ref(&header, "tail_id")?;
        let mut tail_changed = false;

        loop {
            let block = atomic
                .try_get(&tail_id)
                .await?
                .ok_or_else(|| invariant_err(format!("dangling tail_id {tail_id}")))?;
            let current = entries_of(&block)?;
            let room = ENTRIES_PER_BLOCK - current.len();
            let take = room.min(remaining.len());
            if take > 0 {
                let chunk: Vec<Value> = remaining.drain(..take).collect();
                atomic.update(
                    tail_id.clone(),
                    BlockOperation::splice_array("entries", current.len(), 0, chunk),
                )?;
            }
            if remaining.is_empty() {
                break;
            }

            let (new_id, new_block) = new_data_block(&atomic, Some(&tail_id), None);
            atomic.insert(new_block)?;
            atomic.update(tail_id.clone(), set_opt_ref_op("next_id", 0, Some(&new_id)))?;
            tail_id = new_id;
            tail_changed = true;
        }

        if tail_changed {
            atomic.update(self.header_id.clone(), set_ref_op("tail_id", &tail_id))?;
        }

        let transforms = atomic.commit();
        let edit = if tail_changed {
            ChainEdit { transforms, commit_last: self.header_id.clone(), commit_first: None }
        } else {
            ChainEdit { transforms, commit_last: tail_id, commit_first: None }
        };
        Ok(edit)
    }

    /// Removes up to `n` entries from the tail, returning them in forward
    /// (insertion) order. A partial removal from the current tail is one
    /// splice; removing a whole block chains a `delete` plus a
    /// `nextId=None` update on the block that becomes the new tail.
    pub async fn pop(&self, n: usize) -> Result<(Vec<Value>, ChainEdit)> {
        if n == 0 {
            return Ok((Vec::new(), ChainEdit::noop(self.get_tail().await?)));
        }

        let atomic = Atomic::new(&self.store);
        let header = atomic
            .try_get(&self.header_id)
            .await?
            .ok_or_else(|| invariant_err("chain header missing"))?;
        let original_tail = read_ref(&header, "tail_id")?;
        let mut tail_id = original_tail.clone();
        let mut chunks: Vec<Vec<Value>> = Vec::new();
        let mut to_remove = n;
        let mut tail_changed = false;

        while to_remove > 0 {
            let block = atomic
                .try_get(&tail_id)
                .await?
                .ok_or_else(|| invariant_err(format!("dangling tail_id {tail_id}")))?;
            let entries = entries_of(&block)?;
            let prior_id = read_opt_ref(&block, "prior_id")?;

            let take = to_remove.min(entries.len());
            let split = entries.len() - take;
            if take > 0 {
                chunks.push(entries[split..].to_vec());
            }
            to_remove -= take;

            if split > 0 {
                atomic.update(
                    tail_id.clone(),
                    BlockOperation::splice_array("entries", split, take, Vec::new()),
                )?;
                break;
            }

            match prior_id {
                Some(prior) => {
                    atomic.delete(tail_id.clone())?;
                    atomic.update(prior.clone(), set_opt_ref_op("next_id", 1, None))?;
                    tail_id = prior;
                    tail_changed = true;
                }
                None => {
                    // Sole remaining data block: keep it (a chain always
                    // has at least one), but clear the entries it was just
                    // fully drained of.
                    if take > 0 {
                        atomic.update(
                            tail_id.clone(),
                            BlockOperation::splice_array("entries", 0, take, Vec::new()),
                        )?;
                    }
                    break;
                }
            }
        }

        if tail_changed {
            atomic.update(self.header_id.clone(), set_ref_op("tail_id", &tail_id))?;
        }

        let removed: Vec<Value> = chunks.into_iter().rev().flatten().collect();
        let transforms = atomic.commit();
        let edit = if tail_changed {
            ChainEdit { transforms, commit_last: self.header_id.clone(), commit_first: None }
        } else {
            ChainEdit { transforms, commit_last: original_tail, commit_first: None }
        };
        Ok((removed, edit))
    }

    /// The symmetric operation at the head: consumes `entries[0..]`,
    /// possibly deleting whole blocks and rewriting `headId`.
    pub async fn dequeue(&self, n: usize) -> Result<(Vec<Value>, ChainEdit)> {
        if n == 0 {
            return Ok((Vec::new(), ChainEdit::noop(self.get_head().await?)));
        }

        let atomic = Atomic::new(&self.store);
        let header = atomic
            .try_get(&self.header_id)
            .await?
            .ok_or_else(|| invariant_err("chain header missing"))?;
        let original_head = read_ref(&header, "head_id")?;
        let mut head_id = original_head.clone();
        let mut chunks: Vec<Vec<Value>> = Vec::new();
        let mut to_remove = n;
        let mut head_changed = false;

        while to_remove > 0 {
            let block = atomic
                .try_get(&head_id)
                .await?
                .ok_or_else(|| invariant_err(format!("dangling head_id {head_id}")))?;
            let entries = entries_of(&block)?;
            let next_id = read_opt_ref(&block, "next_id")?;

            let take = to_remove.min(entries.len());
            if take > 0 {
                chunks.push(entries[..take].to_vec());
            }
            let keep = entries.len() - take;
            to_remove -= take;

            if keep > 0 {
                atomic.update(
                    head_id.clone(),
                    BlockOperation::splice_array("entries", 0, take, Vec::new()),
                )?;
                break;
            }

            match next_id {
                Some(next) => {
                    atomic.delete(head_id.clone())?;
                    atomic.update(next.clone(), set_opt_ref_op("prior_id", 1, None))?;
                    head_id = next;
                    head_changed = true;
                }
                None => {
                    // Sole remaining data block: keep it, but clear the
                    // entries it was just fully drained of.
                    if take > 0 {
                        atomic.update(
                            head_id.clone(),
                            BlockOperation::splice_array("entries", 0, take, Vec::new()),
                        )?;
                    }
                    break;
                }
            }
        }

        if head_changed {
            atomic.update(self.header_id.clone(), set_ref_op("head_id", &head_id))?;
        }

        let dequeued: Vec<Value> = chunks.into_iter().flatten().collect();
        let transforms = atomic.commit();
        let edit = if head_changed {
            ChainEdit { transforms, commit_last: self.header_id.clone(), commit_first: None }
        } else {
            ChainEdit { transforms, commit_last: original_head, commit_first: None }
        };
        Ok((dequeued, edit))
    }

    /// `false` once `path` has stepped past either end (a "crack"
    /// position).
    pub async fn path_valid(&self, path: &Path) -> Result<bool> {
        match self.store.try_get(&path.block).await? {
            Some(block) => Ok(path.index < entries_of(&block)?.len()),
            None => Ok(false),
        }
    }

    pub async fn value_at(&self, path: &Path) -> Result<Option<Value>> {
        let block = match self.store.try_get(&path.block).await? {
            Some(b) => b,
            None => return Ok(None),
        };
        Ok(entries_of(&block)?.get(path.index).cloned())
    }

    /// Single-step advance, resuming across block boundaries via
    /// `nextId`. Steps past the last entry land on a crack position
    /// (`index == entries.len()` of the last block).
    pub async fn next(&self, path: &Path) -> Result<Path> {
        let block = self
            .store
            .try_get(&path.block)
            .await?
            .ok_or_else(|| invariant_err(format!("dangling block {}", path.block)))?;
        let len = entries_of(&block)?.len();
        if path.index + 1 < len {
            return Ok(Path { index: path.index + 1, ..path.clone() });
        }
        match read_opt_ref(&block, "next_id")? {
            Some(next) => Ok(Path { header: path.header.clone(), block: next, index: 0 }),
            None => Ok(Path { index: len, ..path.clone() }),
        }
    }

    /// Single-step retreat via `priorId`. A step before the first entry
    /// lands on the crack index `usize::MAX`, guaranteed invalid for any
    /// real block (`ENTRIES_PER_BLOCK` bounds real indices far below it).
    pub async fn prev(&self, path: &Path) -> Result<Path> {
        if path.index > 0 && path.index != usize::MAX {
            return Ok(Path { index: path.index - 1, ..path.clone() });
        }
        let block = self
            .store
            .try_get(&path.block)
            .await?
            .ok_or_else(|| invariant_err(format!("dangling block {}", path.block)))?;
        match read_opt_ref(&block, "prior_id")? {
            Some(prior) => {
                let prior_block = self
                    .store
                    .try_get(&prior)
                    .await?
                    .ok_or_else(|| invariant_err(format!("dangling block {prior}")))?;
                let idx = entries_of(&prior_block)?.len().saturating_sub(1);
                Ok(Path { header: path.header.clone(), block: prior, index: idx })
            }
            None => Ok(Path { index: usize::MAX, ..path.clone() }),
        }
    }

    /// Eagerly walks up to `limit` positions starting from `starting_path`
    /// (or the chain's head/tail), stopping early at a crack.
    pub async fn select(
        &self,
        starting_path: Option<Path>,
        forward: bool,
        limit: usize,
    ) -> Result<Vec<Path>> {
        let mut path = match starting_path {
            Some(p) => p,
            None => {
                let block_id = if forward { self.get_head().await? } else { self.get_tail().await? };
                let index = if forward {
                    0
                } else {
                    let block = self
                        .store
                        .try_get(&block_id)
                        .await?
                        .ok_or_else(|| invariant_err(format!("dangling block {block_id}")))?;
                    entries_of(&block)?.len().saturating_sub(1)
                };
                Path { header: self.header_id.clone(), block: block_id, index }
            }
        };

        let mut out = Vec::new();
        while out.len() < limit {
            if !self.path_valid(&path).await? {
                break;
            }
            out.push(path.clone());
            path = if forward { self.next(&path).await? } else { self.prev(&path).await? };
        }
        Ok(out)
    }
}
