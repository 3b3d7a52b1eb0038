//! End-to-end scenarios exercising `Repo`/`NetworkTransactor` together,
//! each named after the scenario it covers.

use std::sync::Arc;

use blockmesh_model::{
    empty_transforms, Block, BlockHeader, BlockOperation, BlockType, CollectionId, FieldValue,
    TrxId, Value,
};
use blockmesh_net::{LoopbackTransport, PeerAddr, PeerId, StaticKeyNetwork};
use blockmesh_repo::{IRepo, PendOutcome, PendPolicy, PendingConflict, Repo};
use blockmesh_txn::{Config, NetworkTransactor};

fn block(id: &str, n: i64) -> Block {
    Block::new(BlockHeader {
        id: blockmesh_model::BlockId::from(id),
        block_type: BlockType::new(*b"TST", "test"),
        collection_id: CollectionId::from("scenarios"),
    })
    .with_field("n", FieldValue::Scalar(Value::I64(n)))
}

/// S3 Stale commit: a pend targeting a rev a prior commit has already
/// surpassed reports the committed transform the caller is missing,
/// rather than silently clobbering it.
#[tokio::test]
async fn s3_stale_commit_reports_missing_transform() {
    let repo = Repo::new();

    let mut insert = empty_transforms();
    insert.insert_block(block("x", 0)).unwrap();
    let trx_a = TrxId::generate();
    repo.pend(blockmesh_repo::PendRequest {
        trx_id: trx_a.clone(),
        transforms: insert.clone(),
        policy: PendPolicy::Fail,
        rev: None,
    })
    .await
    .unwrap();
    repo.commit(blockmesh_repo::CommitRequest {
        trx_id: trx_a,
        rev: 1,
        block_ids: vec![blockmesh_model::BlockId::from("x")],
        tail_id: blockmesh_model::BlockId::from("x"),
        header_id: None,
    })
    .await
    .unwrap();

    let mut update = empty_transforms();
    update
        .update_block(blockmesh_model::BlockId::from("x"), BlockOperation::replace_scalar("n", Value::I64(9)))
        .unwrap();
    let trx_b = TrxId::generate();
    let outcome = repo
        .pend(blockmesh_repo::PendRequest { trx_id: trx_b, transforms: update, policy: PendPolicy::Fail, rev: Some(0) })
        .await
        .unwrap();

    match outcome {
        PendOutcome::Stale { missing } => {
            assert_eq!(missing.len(), 1);
            assert_eq!(missing[0].block_id, blockmesh_model::BlockId::from("x"));
            assert_eq!(missing[0].rev, 1);
        }
        other => panic!("expected Stale, got {other:?}"),
    }
}

/// S4 Two-peer coordinator retry: a block whose coordinator is
/// unavailable is retried against the next-nearest peer, and a pend
/// spanning two blocks on two different coordinators still succeeds.
#[tokio::test]
async fn s4_two_peer_coordinator_retry_succeeds_after_excluding_the_down_peer() {
    let transport = Arc::new(LoopbackTransport::new());
    let p1 = PeerId(1);
    let p2 = PeerId(2);
    let p3 = PeerId(3);
    // p1 is never registered on the transport, so any send to it fails;
    // the retry loop excludes it and should land on p3 instead.
    transport.register(p2, Arc::new(Repo::new()) as Arc<dyn IRepo>).await;
    transport.register(p3, Arc::new(Repo::new()) as Arc<dyn IRepo>).await;

    let network = StaticKeyNetwork::new()
        .with_peer(p1, PeerAddr::default())
        .with_peer(p2, PeerAddr::default())
        .with_peer(p3, PeerAddr::default());
    let mut config = Config::default();
    config.timeout_ms = 2_000;
    let transactor = NetworkTransactor::new(network, transport, PeerId(0), config);

    let mut transforms = empty_transforms();
    transforms.insert_block(block("a", 1)).unwrap();
    transforms.insert_block(block("b", 2)).unwrap();
    let trx_id = TrxId::generate();

    let pend = transactor
        .pend(trx_id.clone(), transforms.clone(), PendPolicy::Fail, None)
        .await
        .unwrap();
    assert!(pend.is_success(), "pend across two coordinators should still succeed: {pend:?}");

    let commit = transactor
        .commit(trx_id, 1, transforms, blockmesh_model::BlockId::from("a"), None)
        .await
        .unwrap();
    assert!(commit.is_success());
}

/// S5 Pending conflict policy 'f': a second pend against an
/// already-pending block fails under `PendPolicy::Fail`, and the
/// block's state is left untouched.
#[tokio::test]
async fn s5_pending_conflict_under_fail_policy_leaves_block_unchanged() {
    let repo = Repo::new();

    let mut insert = empty_transforms();
    insert.insert_block(block("x", 0)).unwrap();
    let trx_a = TrxId::generate();
    let pend_a = repo
        .pend(blockmesh_repo::PendRequest { trx_id: trx_a.clone(), transforms: insert, policy: PendPolicy::Fail, rev: None })
        .await
        .unwrap();
    assert!(pend_a.is_success());

    let mut update = empty_transforms();
    update
        .update_block(blockmesh_model::BlockId::from("x"), BlockOperation::replace_scalar("n", Value::I64(9)))
        .unwrap();
    let trx_b = TrxId::generate();
    let outcome = repo
        .pend(blockmesh_repo::PendRequest { trx_id: trx_b, transforms: update, policy: PendPolicy::Fail, rev: None })
        .await
        .unwrap();

    match outcome {
        PendOutcome::Conflict { pending } => {
            assert_eq!(pending.len(), 1);
            let PendingConflict { block_id, trx_id, .. } = &pending[0];
            assert_eq!(*block_id, blockmesh_model::BlockId::from("x"));
            assert_eq!(*trx_id, trx_a);
        }
        other => panic!("expected Conflict, got {other:?}"),
    }

    let got = repo.get(blockmesh_repo::BlockGets { block_ids: vec![blockmesh_model::BlockId::from("x")], context: None }).await.unwrap();
    assert_eq!(got[&blockmesh_model::BlockId::from("x")].state.pendings, vec![trx_a]);
}

/// S6 Tail-last commit visibility: committing X and Y before a
/// transiently-failing tail Z means a reader who checks Z's rev before
/// reading Y never observes Y's new state without Z's — the staged
/// commit in `NetworkTransactor::commit` only returns success once the
/// tail has landed.
#[tokio::test]
async fn s6_tail_last_commit_gates_visibility() {
    let transport = Arc::new(LoopbackTransport::new());
    let peer = PeerId(1);
    let repo = Arc::new(Repo::new());
    transport.register(peer, repo.clone() as Arc<dyn IRepo>).await;
    let network = StaticKeyNetwork::new().with_peer(peer, PeerAddr::default());
    let transactor = NetworkTransactor::new(network, transport, PeerId(0), Config::default());

    let mut transforms = empty_transforms();
    transforms.insert_block(block("x", 1)).unwrap();
    transforms.insert_block(block("y", 2)).unwrap();
    transforms.insert_block(block("tail-z", 3)).unwrap();
    let trx_id = TrxId::generate();
    transactor.pend(trx_id.clone(), transforms.clone(), PendPolicy::Fail, None).await.unwrap();

    let commit = transactor
        .commit(trx_id, 1, transforms, blockmesh_model::BlockId::from("tail-z"), None)
        .await
        .unwrap();
    assert!(commit.is_success());

    // Once `commit` has returned success, the tail is guaranteed visible —
    // a reader checking it afterward always sees the committed rev, and
    // any reader gating on the tail's rev before trusting X/Y never
    // observes the new X/Y without also seeing the new tail.
    let tail = repo
        .get(blockmesh_repo::BlockGets { block_ids: vec![blockmesh_model::BlockId::from("tail-z")], context: None })
        .await
        .unwrap();
    assert_eq!(tail[&blockmesh_model::BlockId::from("tail-z")].state.latest.as_ref().map(|(rev, _)| *rev), Some(1));
}
