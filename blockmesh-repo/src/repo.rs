use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::instrument;

use blockmesh_base::Result;
use blockmesh_model::{
    apply_transform, block_ids_for_transforms, transform_for_block_id, Block, BlockId, Rev,
    Transform, Transforms, TrxId, NO_REV,
};

/// How a pend should behave when it finds another pending transaction
/// already sitting on one of its blocks (spec.md §4.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PendPolicy {
    /// 'c' — tolerate the other pending transaction, succeed anyway.
    Continue,
    /// 'f' — fail, returning just the conflicting (block, trx) pairs.
    Fail,
    /// 'r' — fail, returning the conflicting pending transforms in full.
    ReturnPending,
    /// 'w' — tolerate, same as Continue (reserved for a future wait-for
    /// semantics; the core spec does not distinguish it from 'c').
    Wait,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum GetContext {
    /// Apply this pending transform on top of latest committed.
    Trx(TrxId),
    /// Return the block as of this rev.
    Rev(Rev),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockGets {
    pub block_ids: Vec<BlockId>,
    pub context: Option<GetContext>,
}

/// What a reader can see about a block beyond its materialized value:
/// which rev/trx produced the latest committed state, and which trxIds
/// currently have a pending transform on it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockVisibleState {
    pub latest: Option<(Rev, TrxId)>,
    pub pendings: Vec<TrxId>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetResult {
    pub block: Option<Block>,
    pub state: BlockVisibleState,
}

/// One entry of the "missing" list returned on staleness: a committed
/// transform the caller needs to replay to catch up to `latestRev`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MissingTransform {
    pub block_id: BlockId,
    pub rev: Rev,
    pub trx_id: TrxId,
    pub transform: Transform,
}

/// One entry of a pending-conflict list. `transform` is populated only
/// under [`PendPolicy::ReturnPending`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingConflict {
    pub block_id: BlockId,
    pub trx_id: TrxId,
    pub transform: Option<Transform>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendRequest {
    pub trx_id: TrxId,
    pub transforms: Transforms,
    pub policy: PendPolicy,
    /// The rev the caller believes is current; a commit that has since
    /// surpassed it makes this pend stale.
    pub rev: Option<Rev>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PendOutcome {
    Success { block_ids: Vec<BlockId> },
    Stale { missing: Vec<MissingTransform> },
    Conflict { pending: Vec<PendingConflict> },
}

impl PendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PendOutcome::Success { .. })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrxBlocks {
    pub trx_id: TrxId,
    pub block_ids: Vec<BlockId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitRequest {
    pub trx_id: TrxId,
    pub rev: Rev,
    pub block_ids: Vec<BlockId>,
    /// The block whose commit makes the whole multi-block transaction
    /// visible (spec.md §4.4/§5's "tail-last commit" rule).
    pub tail_id: BlockId,
    /// Present only on a first-time insert: the header block to commit
    /// before the tail.
    pub header_id: Option<BlockId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CommitOutcome {
    Success,
    Stale { missing: Vec<MissingTransform> },
    /// Non-fatal diagnostic: the block does not have `trxId` pending.
    NotPending { block_id: BlockId },
}

impl CommitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommitOutcome::Success)
    }
}

/// Per-block state a Repo owns exclusively.
#[derive(Default)]
struct BlockState {
    materialized: BTreeMap<Rev, Block>,
    latest_rev: Rev,
    revision_trxs: BTreeMap<Rev, TrxId>,
    pending_trxs: BTreeMap<TrxId, Transform>,
    committed_trxs: BTreeMap<TrxId, Transform>,
    deleted: bool,
}

impl BlockState {
    fn latest_block(&self) -> Option<Block> {
        if self.deleted {
            None
        } else {
            self.materialized.get(&self.latest_rev).cloned()
        }
    }

    fn block_at_rev(&self, rev: Rev) -> Option<Block> {
        self.materialized.get(&rev).cloned()
    }

    fn block_with_trx_applied(&self, trx_id: &TrxId) -> Result<Option<Block>> {
        match self.pending_trxs.get(trx_id) {
            Some(t) => apply_transform(self.latest_block(), t),
            None => Ok(self.latest_block()),
        }
    }

    fn missing_since(&self, block_id: &BlockId, from_rev: Rev) -> Vec<MissingTransform> {
        self.revision_trxs
            .range(from_rev..=self.latest_rev)
            .filter_map(|(&rev, trx_id)| {
                self.committed_trxs.get(trx_id).map(|t| MissingTransform {
                    block_id: block_id.clone(),
                    rev,
                    trx_id: trx_id.clone(),
                    transform: t.clone(),
                })
            })
            .collect()
    }
}

/// Single-node custodian of a set of blocks: per-block materialized
/// revisions, pending transactions, committed transactions; `get`/`pend`/
/// `cancel`/`commit` with per-block lock discipline and stale-revision
/// detection (spec.md §4.3).
#[derive(Default)]
pub struct Repo {
    blocks: RwLock<BTreeMap<BlockId, Arc<Mutex<BlockState>>>>,
}

impl Repo {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, id: &BlockId) -> Arc<Mutex<BlockState>> {
        if let Some(e) = self.blocks.read().await.get(id) {
            return e.clone();
        }
        let mut w = self.blocks.write().await;
        w.entry(id.clone()).or_insert_with(|| Arc::new(Mutex::new(BlockState::default()))).clone()
    }

    async fn existing_entry(&self, id: &BlockId) -> Option<Arc<Mutex<BlockState>>> {
        self.blocks.read().await.get(id).cloned()
    }

    #[instrument(skip(self, req))]
    pub async fn get(&self, req: BlockGets) -> Result<BTreeMap<BlockId, GetResult>> {
        let mut out = BTreeMap::new();
        for id in &req.block_ids {
            let result = match self.existing_entry(id).await {
                None => GetResult::default(),
                Some(entry) => {
                    let state = entry.lock().await;
                    let block = match &req.context {
                        None => state.latest_block(),
                        Some(GetContext::Rev(rev)) => state.block_at_rev(*rev),
                        Some(GetContext::Trx(trx_id)) => state.block_with_trx_applied(trx_id)?,
                    };
                    let latest = (state.latest_rev != NO_REV)
                        .then(|| state.revision_trxs.get(&state.latest_rev).cloned())
                        .flatten()
                        .map(|trx| (state.latest_rev, trx));
                    GetResult {
                        block,
                        state: BlockVisibleState {
                            latest,
                            pendings: state.pending_trxs.keys().cloned().collect(),
                        },
                    }
                }
            };
            out.insert(id.clone(), result);
        }
        Ok(out)
    }

    #[instrument(skip(self, req))]
    pub async fn pend(&self, req: PendRequest) -> Result<PendOutcome> {
        let ids = block_ids_for_transforms(&req.transforms);
        let mut conflicts = Vec::new();
        let mut missing = Vec::new();
        let mut entries = Vec::new();

        for id in &ids {
            let is_insert = req.transforms.inserts.contains_key(id);
            let entry = self.entry(id).await;
            let state = entry.lock().await;

            // (b) for an insert, the block already existing is treated as
            // the rev=0 case of (c): the caller expected an empty slot.
            if is_insert {
                if state.latest_rev != NO_REV {
                    missing.extend(state.missing_since(id, NO_REV + 1));
                }
            } else if let Some(rev) = req.rev {
                if state.latest_rev >= rev {
                    missing.extend(state.missing_since(id, rev));
                }
            }

            for (trx_id, transform) in &state.pending_trxs {
                if *trx_id == req.trx_id {
                    continue;
                }
                conflicts.push(PendingConflict {
                    block_id: id.clone(),
                    trx_id: trx_id.clone(),
                    transform: matches!(req.policy, PendPolicy::ReturnPending).then(|| transform.clone()),
                });
            }
            drop(state);
            entries.push((id.clone(), entry));
        }

        if !missing.is_empty() {
            return Ok(PendOutcome::Stale { missing });
        }
        if !conflicts.is_empty() && matches!(req.policy, PendPolicy::Fail | PendPolicy::ReturnPending) {
            return Ok(PendOutcome::Conflict { pending: conflicts });
        }

        for (id, entry) in &entries {
            let transform = transform_for_block_id(&req.transforms, id);
            let mut state = entry.lock().await;
            state.pending_trxs.insert(req.trx_id.clone(), transform);
        }

        Ok(PendOutcome::Success { block_ids: ids.into_iter().collect() })
    }

    #[instrument(skip(self, req))]
    pub async fn cancel(&self, req: TrxBlocks) -> Result<()> {
        for id in &req.block_ids {
            if let Some(entry) = self.existing_entry(id).await {
                let mut state = entry.lock().await;
                state.pending_trxs.remove(&req.trx_id);
            }
        }
        Ok(())
    }

    #[instrument(skip(self, req))]
    pub async fn commit(&self, req: CommitRequest) -> Result<CommitOutcome> {
        let mut sorted_ids = req.block_ids.clone();
        sorted_ids.sort();
        sorted_ids.dedup();

        // Acquire per-id mutexes in sorted-by-BlockId order.
        let mut guards = Vec::with_capacity(sorted_ids.len());
        for id in &sorted_ids {
            let entry = self.entry(id).await;
            let guard = entry.lock_owned().await;
            guards.push((id.clone(), guard));
        }

        let result = Self::commit_under_lock(&req, &mut guards);

        // Release in reverse-of-acquisition order, on every exit path
        // (including an early return above), per spec.md §5.
        while let Some(g) = guards.pop() {
            drop(g);
        }

        result
    }

    fn commit_under_lock(
        req: &CommitRequest,
        guards: &mut [(BlockId, tokio::sync::OwnedMutexGuard<BlockState>)],
    ) -> Result<CommitOutcome> {
        // Re-check staleness under lock.
        let mut missing = Vec::new();
        for (id, state) in guards.iter() {
            if state.latest_rev >= req.rev {
                missing.extend(state.missing_since(id, req.rev));
            }
        }
        if !missing.is_empty() {
            return Ok(CommitOutcome::Stale { missing });
        }

        for (id, state) in guards.iter() {
            if !state.pending_trxs.contains_key(&req.trx_id) {
                return Ok(CommitOutcome::NotPending { block_id: id.clone() });
            }
        }

        // Compute every block's new materialization before mutating any of
        // them, so an invariant violation on one block aborts the whole
        // commit rather than leaving earlier blocks partially applied.
        let mut new_blocks = Vec::with_capacity(guards.len());
        for (_, state) in guards.iter() {
            let pending = &state.pending_trxs[&req.trx_id];
            new_blocks.push(apply_transform(state.latest_block(), pending)?);
        }

        for ((_, state), new_block) in guards.iter_mut().zip(new_blocks) {
            let pending = state
                .pending_trxs
                .remove(&req.trx_id)
                .expect("presence checked above");
            match new_block {
                Some(b) => {
                    state.materialized.insert(req.rev, b);
                    state.deleted = false;
                }
                None => {
                    state.deleted = true;
                }
            }
            state.latest_rev = req.rev;
            state.revision_trxs.insert(req.rev, req.trx_id.clone());
            state.committed_trxs.insert(req.trx_id.clone(), pending);
        }

        Ok(CommitOutcome::Success)
    }
}

#[async_trait]
pub trait IRepo: Send + Sync {
    async fn get(&self, req: BlockGets) -> Result<BTreeMap<BlockId, GetResult>>;
    async fn pend(&self, req: PendRequest) -> Result<PendOutcome>;
    async fn cancel(&self, req: TrxBlocks) -> Result<()>;
    async fn commit(&self, req: CommitRequest) -> Result<CommitOutcome>;
}

#[cfg(test)]
mod test {
    use super::*;
    use blockmesh_model::{
        empty_transforms, Block, BlockHeader, BlockOperation, BlockType, CollectionId, FieldValue,
        Value,
    };

    #[cfg(test)]
    use test_log::test;

    fn block(id: &str, n: i64) -> Block {
        Block::new(BlockHeader {
            id: BlockId::from(id),
            block_type: BlockType::new(*b"TST", "test"),
            collection_id: CollectionId::from("c1"),
        })
        .with_field("n", FieldValue::Scalar(Value::I64(n)))
    }

    async fn insert_and_commit(repo: &Repo, id: &str, n: i64) {
        let mut transforms = empty_transforms();
        transforms.insert_block(block(id, n)).unwrap();
        let trx_id = TrxId::generate();
        let ids: Vec<BlockId> = block_ids_for_transforms(&transforms).into_iter().collect();
        let pend = repo
            .pend(PendRequest { trx_id: trx_id.clone(), transforms, policy: PendPolicy::Fail, rev: None })
            .await
            .unwrap();
        assert!(pend.is_success());
        let outcome = repo
            .commit(CommitRequest {
                trx_id,
                rev: 1,
                block_ids: ids.clone(),
                tail_id: ids[0].clone(),
                header_id: None,
            })
            .await
            .unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn insert_then_get_sees_latest() {
        let repo = Repo::new();
        insert_and_commit(&repo, "b1", 1).await;
        let got = repo
            .get(BlockGets { block_ids: vec![BlockId::from("b1")], context: None })
            .await
            .unwrap();
        let result = &got[&BlockId::from("b1")];
        assert_eq!(result.block.as_ref().unwrap().field("n").unwrap().as_scalar().unwrap().as_i64(), Some(1));
        assert_eq!(result.state.latest.as_ref().map(|(rev, _)| *rev), Some(1));
    }

    #[tokio::test]
    async fn pend_over_stale_rev_reports_missing() {
        let repo = Repo::new();
        insert_and_commit(&repo, "b1", 1).await;

        let mut transforms = empty_transforms();
        transforms.update_block(BlockId::from("b1"), BlockOperation::replace_scalar("n", Value::I64(2))).unwrap();
        let outcome = repo
            .pend(PendRequest { trx_id: TrxId::generate(), transforms, policy: PendPolicy::Fail, rev: Some(0) })
            .await
            .unwrap();
        assert!(matches!(outcome, PendOutcome::Stale { .. }));
    }

    #[tokio::test]
    async fn second_insert_over_existing_block_is_stale() {
        let repo = Repo::new();
        insert_and_commit(&repo, "b1", 1).await;

        let mut transforms = empty_transforms();
        transforms.insert_block(block("b1", 99)).unwrap();
        let outcome = repo
            .pend(PendRequest { trx_id: TrxId::generate(), transforms, policy: PendPolicy::Fail, rev: None })
            .await
            .unwrap();
        assert!(matches!(outcome, PendOutcome::Stale { .. }));
    }

    #[tokio::test]
    async fn commit_aborts_fully_when_one_block_violates_an_invariant() {
        let repo = Repo::new();

        // b1 exists; b2 does not. A transaction pending an update on b2
        // alone (no insert) is an invariant violation once committed,
        // because there is no prior block to apply the update to.
        insert_and_commit(&repo, "b1", 1).await;

        let mut transforms = empty_transforms();
        transforms.update_block(BlockId::from("b1"), BlockOperation::replace_scalar("n", Value::I64(2))).unwrap();
        transforms.update_block(BlockId::from("b2"), BlockOperation::replace_scalar("n", Value::I64(2))).unwrap();

        let trx_id = TrxId::generate();
        let ids = vec![BlockId::from("b1"), BlockId::from("b2")];
        let pend = repo
            .pend(PendRequest { trx_id: trx_id.clone(), transforms, policy: PendPolicy::Fail, rev: Some(1) })
            .await
            .unwrap();
        assert!(pend.is_success());

        let result = repo
            .commit(CommitRequest {
                trx_id,
                rev: 2,
                block_ids: ids,
                tail_id: BlockId::from("b2"),
                header_id: None,
            })
            .await;
        assert!(result.is_err());

        // b1 must still read at rev 1: the commit did not partially apply.
        let got = repo.get(BlockGets { block_ids: vec![BlockId::from("b1")], context: None }).await.unwrap();
        assert_eq!(got[&BlockId::from("b1")].state.latest.as_ref().map(|(rev, _)| *rev), Some(1));
    }
}

#[async_trait]
impl IRepo for Repo {
    async fn get(&self, req: BlockGets) -> Result<BTreeMap<BlockId, GetResult>> {
        Repo::get(self, req).await
    }
    async fn pend(&self, req: PendRequest) -> Result<PendOutcome> {
        Repo::pend(self, req).await
    }
    async fn cancel(&self, req: TrxBlocks) -> Result<()> {
        Repo::cancel(self, req).await
    }
    async fn commit(&self, req: CommitRequest) -> Result<CommitOutcome> {
        Repo::commit(self, req).await
    }
}
