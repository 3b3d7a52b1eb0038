use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::instrument;

use blockmesh_base::{transport_err, Result};
use blockmesh_repo::IRepo;

use crate::peer::PeerId;
use crate::rpc::{decode_request, encode_request, RpcKind, RpcOutcome, RpcRequest, RpcResponse};

/// An in-process router standing in for a real transport: every `send`
/// round-trips the request through the wire codec (same framing a socket
/// transport would use) and dispatches it to the registered peer's `IRepo`,
/// grounded on the teacher's byte-buffer `Node`/`IOQueues` framing idiom but
/// without the actual queueing, since there is no real network hop to
/// buffer against. Used by tests and the single-process demo.
#[derive(Default)]
pub struct LoopbackTransport {
    handlers: RwLock<BTreeMap<PeerId, Arc<dyn IRepo>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: PeerId, repo: Arc<dyn IRepo>) {
        self.handlers.write().await.insert(id, repo);
    }

    #[instrument(skip(self, req))]
    pub async fn send(&self, req: RpcRequest) -> Result<RpcResponse> {
        let bytes = encode_request(&req)?;
        let decoded = decode_request(&bytes)?;
        let sequence = decoded.sequence;

        let repo = {
            let handlers = self.handlers.read().await;
            handlers
                .get(&decoded.dst)
                .cloned()
                .ok_or_else(|| transport_err(format!("no such peer: {:?}", decoded.dst)))?
        };

        let outcome = match decoded.kind {
            RpcKind::Get(g) => repo.get(g).await.map(RpcOutcome::Get),
            RpcKind::Pend(p) => repo.pend(p).await.map(RpcOutcome::Pend),
            RpcKind::Cancel(c) => repo.cancel(c).await.map(|_| RpcOutcome::Cancel),
            RpcKind::Commit(c) => repo.commit(c).await.map(RpcOutcome::Commit),
        };

        Ok(RpcResponse { sequence, result: outcome.map_err(|e| format!("{e:?}")) })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use blockmesh_model::{empty_transforms, BlockHeader, BlockType, CollectionId, BlockId};
    use blockmesh_repo::{PendPolicy, PendRequest, Repo};
    use blockmesh_model::{Block, TrxId};

    #[cfg(test)]
    use test_log::test;

    #[tokio::test]
    async fn send_dispatches_to_registered_peer() {
        let transport = LoopbackTransport::new();
        let repo: Arc<dyn IRepo> = Arc::new(Repo::new());
        transport.register(PeerId(1), repo).await;

        let mut transforms = empty_transforms();
        let block = Block::new(BlockHeader {
            id: BlockId::from("b1"),
            block_type: BlockType::new(*b"TST", "test"),
            collection_id: CollectionId::from("c1"),
        });
        transforms.insert_block(block).unwrap();

        let req = RpcRequest {
            src: PeerId(2),
            dst: PeerId(1),
            sequence: 1,
            expiration_ms: 10_000,
            kind: RpcKind::Pend(PendRequest {
                trx_id: TrxId::generate(),
                transforms,
                policy: PendPolicy::Fail,
                rev: None,
            }),
        };
        let res = transport.send(req).await.unwrap();
        assert!(matches!(res.result, Ok(RpcOutcome::Pend(_))));
    }

    #[tokio::test]
    async fn send_to_unregistered_peer_is_a_transport_error() {
        let transport = LoopbackTransport::new();
        let req = RpcRequest {
            src: PeerId(2),
            dst: PeerId(99),
            sequence: 1,
            expiration_ms: 10_000,
            kind: RpcKind::Cancel(blockmesh_repo::TrxBlocks { trx_id: TrxId::generate(), block_ids: vec![] }),
        };
        assert!(transport.send(req).await.is_err());
    }
}
