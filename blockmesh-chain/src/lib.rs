#![allow(dead_code)]

mod chain;
mod diary;
mod log;
mod store;

pub use chain::{chain_data_type, chain_header_type, Chain, ChainEdit, Path, ENTRIES_PER_BLOCK};
pub use diary::Diary;
pub use log::{Log, LogAction, LogEntry};
pub use store::RepoBackedStore;

use blockmesh_base::{invariant_err, Result};
use blockmesh_model::{block_ids_for_transforms, Rev, TrxId};
use blockmesh_repo::{CommitOutcome, CommitRequest, IRepo, PendPolicy, PendRequest};

/// Pends then commits one `ChainEdit` directly against an `IRepo` — the
/// non-networked case spec.md §4.5 calls out as an alternative to routing
/// through `blockmesh_txn::NetworkTransactor::commit`.
pub async fn commit_locally(
    repo: &dyn IRepo,
    trx_id: TrxId,
    rev: Rev,
    edit: ChainEdit,
) -> Result<CommitOutcome> {
    if edit.transforms.is_empty() {
        return Ok(CommitOutcome::Success);
    }

    let block_ids: Vec<_> = block_ids_for_transforms(&edit.transforms).into_iter().collect();
    let pend = repo
        .pend(PendRequest {
            trx_id: trx_id.clone(),
            transforms: edit.transforms,
            policy: PendPolicy::Fail,
            rev: None,
        })
        .await?;
    if !pend.is_success() {
        return Err(invariant_err(format!("pend did not succeed: {pend:?}")));
    }

    repo.commit(CommitRequest {
        trx_id,
        rev,
        block_ids,
        tail_id: edit.commit_last,
        header_id: edit.commit_first,
    })
    .await
}
