use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use blockmesh_base::{err, Result};
use blockmesh_model::BlockId;
use blockmesh_repo::{
    BlockGets, CommitOutcome, CommitRequest, GetResult, PendOutcome, PendRequest, TrxBlocks,
};

use crate::peer::PeerId;

/// The four verbs of the Repo RPC surface (spec.md §6). `getStatus` is
/// deliberately absent: the core spec leaves it unspecified.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcKind {
    Get(BlockGets),
    Pend(PendRequest),
    Cancel(TrxBlocks),
    Commit(CommitRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub src: PeerId,
    pub dst: PeerId,
    pub sequence: u64,
    /// Absolute deadline (milliseconds since epoch) the callee must honor:
    /// abandon work whose result cannot be returned before it, per
    /// spec.md §5's cancellation/timeout rules.
    pub expiration_ms: i64,
    pub kind: RpcKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcOutcome {
    Get(BTreeMap<BlockId, GetResult>),
    Pend(PendOutcome),
    Cancel,
    Commit(CommitOutcome),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub sequence: u64,
    /// Wire errors carry only a message: the fatal/transport distinction
    /// that matters locally (`blockmesh_base::Kind`) doesn't need to survive
    /// serialization, since a failed RPC is always treated as a transport
    /// failure by the caller (`NetworkTransactor` re-batches and retries).
    pub result: std::result::Result<RpcOutcome, String>,
}

pub fn encode_request(req: &RpcRequest) -> Result<Vec<u8>> {
    rmp_serde::to_vec(req).map_err(|e| err(e.to_string()))
}

pub fn decode_request(buf: &[u8]) -> Result<RpcRequest> {
    rmp_serde::from_slice(buf).map_err(|e| err(e.to_string()))
}

pub fn encode_response(res: &RpcResponse) -> Result<Vec<u8>> {
    rmp_serde::to_vec(res).map_err(|e| err(e.to_string()))
}

pub fn decode_response(buf: &[u8]) -> Result<RpcResponse> {
    rmp_serde::from_slice(buf).map_err(|e| err(e.to_string()))
}
