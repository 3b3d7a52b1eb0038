use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{instrument, warn};

use blockmesh_base::{transport_err, Result};
use blockmesh_model::{block_ids_for_transforms, BlockId, Rev, Transforms, TrxId};
use blockmesh_net::{IKeyNetwork, LoopbackTransport, PeerId, RpcKind, RpcOutcome, RpcRequest};
use blockmesh_repo::{
    BlockGets, CommitOutcome, CommitRequest, GetContext, GetResult, IRepo, MissingTransform,
    PendOutcome, PendPolicy, PendRequest, PendingConflict, TrxBlocks,
};

use crate::batch::{group_by_coordinator, sub_transforms};
use crate::config::{now_ms, Config};

/// Distributes Repo operations across peers by per-block coordinator
/// lookup, retrying failed batches against alternate coordinators until a
/// shared expiration, and reconciling partial success per spec.md §4.4.
/// Holds no shared mutable state between calls beyond the sequence counter
/// (spec.md §5's "NetworkTransactor holds per-call state only").
pub struct NetworkTransactor<N: IKeyNetwork> {
    network: N,
    transport: Arc<LoopbackTransport>,
    self_peer: PeerId,
    config: Config,
    sequence: AtomicU64,
}

impl<N: IKeyNetwork> NetworkTransactor<N> {
    pub fn new(network: N, transport: Arc<LoopbackTransport>, self_peer: PeerId, config: Config) -> Self {
        NetworkTransactor { network, transport, self_peer, config, sequence: AtomicU64::new(0) }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, dst: PeerId, expiration_ms: i64, kind: RpcKind) -> Result<RpcOutcome> {
        let req = RpcRequest {
            src: self.self_peer,
            dst,
            sequence: self.next_sequence(),
            expiration_ms,
            kind,
        };
        let res = self.transport.send(req).await?;
        res.result.map_err(|msg| transport_err(msg))
    }

    /// Repeatedly tries `ids` against coordinators, excluding any peer that
    /// fails, until `make_kind` succeeds or `expiration_ms` passes. Boxed as
    /// a trait object (rather than `impl Fn`) because this function and
    /// [`Self::dispatch_multi`] call each other recursively; a generic
    /// closure parameter would force the compiler to monomorphize an
    /// unbounded chain of `&F`, `&&F`, ... instantiations.
    fn dispatch_with_retry<'a>(
        &'a self,
        ids: &'a [BlockId],
        expiration_ms: i64,
        mut excluded: BTreeSet<PeerId>,
        make_kind: &'a (dyn Fn(&[BlockId]) -> RpcKind + Sync),
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<RpcOutcome>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                let groups = group_by_coordinator(&self.network, ids, &excluded).await?;
                // A batch per coordinator; for operations with a single
                // id-set this loop runs once, but an id set spanning peers
                // divides into independent retryable batches by recursing.
                if groups.len() == 1 {
                    let (peer, group_ids) = groups.into_iter().next().expect("checked len == 1");
                    match self.send(peer, expiration_ms, make_kind(&group_ids)).await {
                        Ok(outcome) => return Ok(outcome),
                        Err(e) => {
                            excluded.insert(peer);
                            if now_ms() >= expiration_ms {
                                return Err(e);
                            }
                            continue;
                        }
                    }
                }
                // Multiple coordinators: dispatch each sub-batch
                // independently and merge; any sub-batch failure falls
                // back to a full retry of just that sub-batch's ids.
                return self.dispatch_multi(groups, expiration_ms, excluded, make_kind).await;
            }
        })
    }

    async fn dispatch_multi(
        &self,
        groups: BTreeMap<PeerId, Vec<BlockId>>,
        expiration_ms: i64,
        excluded: BTreeSet<PeerId>,
        make_kind: &(dyn Fn(&[BlockId]) -> RpcKind + Sync),
    ) -> Result<RpcOutcome> {
        let mut outcomes = Vec::with_capacity(groups.len());
        for (peer, ids) in groups {
            let mut peer_excluded = excluded.clone();
            let outcome = loop {
                match self.send(peer, expiration_ms, make_kind(&ids)).await {
                    Ok(o) => break o,
                    Err(e) => {
                        peer_excluded.insert(peer);
                        if now_ms() >= expiration_ms {
                            return Err(e);
                        }
                        let retried = self
                            .dispatch_with_retry(&ids, expiration_ms, peer_excluded.clone(), make_kind)
                            .await?;
                        break retried;
                    }
                }
            };
            outcomes.push(outcome);
        }
        merge_outcomes(outcomes)
    }

    #[instrument(skip(self, context))]
    pub async fn get(
        &self,
        block_ids: Vec<BlockId>,
        context: Option<GetContext>,
    ) -> Result<BTreeMap<BlockId, GetResult>> {
        let expiration_ms = now_ms() + self.config.timeout_ms;
        let make_kind = |ids: &[BlockId]| {
            RpcKind::Get(BlockGets { block_ids: ids.to_vec(), context: context.clone() })
        };
        let outcome = self
            .dispatch_with_retry(&block_ids, expiration_ms, BTreeSet::new(), &make_kind)
            .await?;
        match outcome {
            RpcOutcome::Get(map) => Ok(map),
            _ => Err(transport_err("unexpected RPC outcome for get")),
        }
    }

    #[instrument(skip(self, transforms))]
    pub async fn pend(
        &self,
        trx_id: TrxId,
        transforms: Transforms,
        policy: PendPolicy,
        rev: Option<Rev>,
    ) -> Result<PendOutcome> {
        let ids: Vec<BlockId> = block_ids_for_transforms(&transforms).into_iter().collect();
        let expiration_ms = now_ms() + self.config.timeout_ms;

        let attempted_peers = self.tried_peers(&ids, &BTreeSet::new()).await?;
        let make_kind = |batch_ids: &[BlockId]| {
            RpcKind::Pend(PendRequest {
                trx_id: trx_id.clone(),
                transforms: sub_transforms(&transforms, batch_ids),
                policy,
                rev,
            })
        };
        let outcome = self.dispatch_with_retry(&ids, expiration_ms, BTreeSet::new(), &make_kind).await;

        match outcome {
            Ok(RpcOutcome::Pend(outcome)) => {
                if matches!(outcome, PendOutcome::Stale { .. } | PendOutcome::Conflict { .. }) {
                    self.best_effort_cancel(&attempted_peers, trx_id.clone(), ids).await;
                }
                Ok(outcome)
            }
            Ok(_) => Err(transport_err("unexpected RPC outcome for pend")),
            Err(e) => {
                self.best_effort_cancel(&attempted_peers, trx_id, ids).await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, trx_id: TrxId, block_ids: Vec<BlockId>) -> Result<()> {
        let expiration_ms = now_ms() + self.config.timeout_ms;
        let make_kind = |ids: &[BlockId]| {
            RpcKind::Cancel(TrxBlocks { trx_id: trx_id.clone(), block_ids: ids.to_vec() })
        };
        let outcome = self.dispatch_with_retry(&block_ids, expiration_ms, BTreeSet::new(), &make_kind).await?;
        match outcome {
            RpcOutcome::Cancel => Ok(()),
            _ => Err(transport_err("unexpected RPC outcome for cancel")),
        }
    }

    /// Best-effort cancel to every peer ever tried for this transaction
    /// (spec.md §4.4's "Cancellation of an in-flight pend"). Errors are
    /// logged, never propagated.
    async fn best_effort_cancel(&self, peers: &BTreeSet<PeerId>, trx_id: TrxId, block_ids: Vec<BlockId>) {
        let expiration_ms = now_ms() + self.config.abort_or_cancel_timeout_ms;
        for &peer in peers {
            let kind = RpcKind::Cancel(TrxBlocks { trx_id: trx_id.clone(), block_ids: block_ids.clone() });
            if let Err(e) = self.send(peer, expiration_ms, kind).await {
                warn!(?peer, error = ?e, "best-effort cancel failed");
            }
        }
    }

    /// The set of peers that currently coordinate any of `ids`, used to
    /// know who to best-effort-cancel if the pend subsequently fails.
    async fn tried_peers(&self, ids: &[BlockId], excluded: &BTreeSet<PeerId>) -> Result<BTreeSet<PeerId>> {
        Ok(group_by_coordinator(&self.network, ids, excluded).await?.into_keys().collect())
    }

    /// Commits `tailId` (and `headerId`, for a first-time insert) before
    /// all other blocks, per spec.md §4.4's tail-last visibility rule.
    /// A `headerId == tailId` first commit degenerates to committing that
    /// one id once, not twice.
    #[instrument(skip(self, transforms))]
    pub async fn commit(
        &self,
        trx_id: TrxId,
        rev: Rev,
        transforms: Transforms,
        tail_id: BlockId,
        header_id: Option<BlockId>,
    ) -> Result<CommitOutcome> {
        let mut ids: Vec<BlockId> = block_ids_for_transforms(&transforms).into_iter().collect();
        ids.sort();
        ids.dedup();

        let expiration_ms = now_ms() + self.config.timeout_ms;
        let commit_ids = |batch_ids: &[BlockId]| {
            RpcKind::Commit(CommitRequest {
                trx_id: trx_id.clone(),
                rev,
                block_ids: batch_ids.to_vec(),
                tail_id: tail_id.clone(),
                header_id: header_id.clone(),
            })
        };

        if let Some(header_id) = header_id.clone() {
            if header_id != tail_id {
                let outcome = self
                    .dispatch_with_retry(&[header_id], expiration_ms, BTreeSet::new(), &commit_ids)
                    .await?;
                if let RpcOutcome::Commit(CommitOutcome::Stale { missing }) = outcome {
                    return Ok(CommitOutcome::Stale { missing });
                }
            }
        }

        let tail_outcome = self
            .dispatch_with_retry(&[tail_id.clone()], expiration_ms, BTreeSet::new(), &commit_ids)
            .await?;
        let tail_outcome = match tail_outcome {
            RpcOutcome::Commit(o) => o,
            _ => return Err(transport_err("unexpected RPC outcome for commit")),
        };
        if !tail_outcome.is_success() {
            // Tail failed (or is stale): the transaction never became
            // visible, so the whole operation fails.
            return Ok(tail_outcome);
        }

        // Tail is durable. Remaining blocks commit best-effort: a failure
        // here is a recovery obligation, not a transaction failure.
        let remaining: Vec<BlockId> = ids
            .into_iter()
            .filter(|id| *id != tail_id && Some(id) != header_id.as_ref())
            .collect();
        if !remaining.is_empty() {
            if let Err(e) = self.dispatch_with_retry(&remaining, expiration_ms, BTreeSet::new(), &commit_ids).await {
                warn!(error = ?e, blocks = ?remaining, "post-tail commit failed; recovery obligation recorded");
            }
        }

        Ok(CommitOutcome::Success)
    }
}

/// Exposes a `NetworkTransactor` as a plain [`IRepo`], so callers that only
/// need the four-verb contract (`blockmesh_chain`'s mutators, for one) can
/// target a networked mesh the same way they'd target a local `Repo`.
///
/// `commit` here dispatches `req.block_ids` as a single coordinator-routed
/// batch, carrying `tail_id`/`header_id` along for each remote `Repo`'s own
/// bookkeeping, but it does NOT perform the tail-then-header staged
/// visibility ordering [`NetworkTransactor::commit`] provides when `req`
/// spans multiple peers — that ordering is a property of the orchestrated
/// call, not of the wire-level `CommitRequest` alone. Callers that need the
/// staged guarantee across peers should call `NetworkTransactor::commit`
/// directly; this impl is the thin RPC-level equivalent of `Repo::commit`.
#[async_trait]
impl<N: IKeyNetwork> IRepo for NetworkTransactor<N> {
    async fn get(&self, req: BlockGets) -> Result<BTreeMap<BlockId, GetResult>> {
        NetworkTransactor::get(self, req.block_ids, req.context).await
    }

    async fn pend(&self, req: PendRequest) -> Result<PendOutcome> {
        NetworkTransactor::pend(self, req.trx_id, req.transforms, req.policy, req.rev).await
    }

    async fn cancel(&self, req: TrxBlocks) -> Result<()> {
        NetworkTransactor::cancel(self, req.trx_id, req.block_ids).await
    }

    async fn commit(&self, req: CommitRequest) -> Result<CommitOutcome> {
        let expiration_ms = now_ms() + self.config.timeout_ms;
        let commit_ids = |batch_ids: &[BlockId]| {
            RpcKind::Commit(CommitRequest {
                trx_id: req.trx_id.clone(),
                rev: req.rev,
                block_ids: batch_ids.to_vec(),
                tail_id: req.tail_id.clone(),
                header_id: req.header_id.clone(),
            })
        };
        let outcome =
            self.dispatch_with_retry(&req.block_ids, expiration_ms, BTreeSet::new(), &commit_ids).await?;
        match outcome {
            RpcOutcome::Commit(o) => Ok(o),
            _ => Err(transport_err("unexpected RPC outcome for commit")),
        }
    }
}

fn merge_outcomes(outcomes: Vec<RpcOutcome>) -> Result<RpcOutcome> {
    if outcomes.is_empty() {
        return Err(transport_err("no batches to merge"));
    }
    let mut iter = outcomes.into_iter();
    let first = iter.next().expect("checked non-empty");
    match first {
        RpcOutcome::Get(mut acc) => {
            for o in iter {
                match o {
                    RpcOutcome::Get(m) => acc.extend(m),
                    _ => return Err(transport_err("mixed RPC outcome kinds in merge")),
                }
            }
            Ok(RpcOutcome::Get(acc))
        }
        RpcOutcome::Pend(first_pend) => {
            let mut block_ids = Vec::new();
            let mut missing: Vec<MissingTransform> = Vec::new();
            let mut conflicts: Vec<PendingConflict> = Vec::new();
            let mut fold = |o: PendOutcome| match o {
                PendOutcome::Success { block_ids: ids } => block_ids.extend(ids),
                PendOutcome::Stale { missing: m } => missing.extend(m),
                PendOutcome::Conflict { pending } => conflicts.extend(pending),
            };
            fold(first_pend);
            for o in iter {
                match o {
                    RpcOutcome::Pend(p) => fold(p),
                    _ => return Err(transport_err("mixed RPC outcome kinds in merge")),
                }
            }
            if !missing.is_empty() {
                Ok(RpcOutcome::Pend(PendOutcome::Stale { missing }))
            } else if !conflicts.is_empty() {
                Ok(RpcOutcome::Pend(PendOutcome::Conflict { pending: conflicts }))
            } else {
                Ok(RpcOutcome::Pend(PendOutcome::Success { block_ids }))
            }
        }
        RpcOutcome::Cancel => Ok(RpcOutcome::Cancel),
        RpcOutcome::Commit(first_commit) => {
            let mut missing: Vec<MissingTransform> = Vec::new();
            let mut not_pending: Option<BlockId> = None;
            let mut fold = |o: CommitOutcome| match o {
                CommitOutcome::Success => {}
                CommitOutcome::Stale { missing: m } => missing.extend(m),
                CommitOutcome::NotPending { block_id } => {
                    not_pending.get_or_insert(block_id);
                }
            };
            fold(first_commit);
            for o in iter {
                match o {
                    RpcOutcome::Commit(c) => {
                        fold(c);
                    }
                    _ => return Err(transport_err("mixed RPC outcome kinds in merge")),
                }
            }
            if !missing.is_empty() {
                Ok(RpcOutcome::Commit(CommitOutcome::Stale { missing }))
            } else if let Some(block_id) = not_pending {
                Ok(RpcOutcome::Commit(CommitOutcome::NotPending { block_id }))
            } else {
                Ok(RpcOutcome::Commit(CommitOutcome::Success))
            }
        }
    }
}
