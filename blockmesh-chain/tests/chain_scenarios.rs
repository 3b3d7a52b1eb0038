//! End-to-end scenarios exercising `Chain`'s add/pop/dequeue ordering,
//! each named after the scenario it covers.

use std::sync::Arc;

use blockmesh_chain::{commit_locally, Chain, ChainEdit, RepoBackedStore};
use blockmesh_model::{CollectionId, Rev, TrxId, Value};
use blockmesh_repo::{IRepo, Repo};

fn store(repo: &Arc<Repo>) -> RepoBackedStore {
    RepoBackedStore::new(repo.clone() as Arc<dyn IRepo>, CollectionId::from("chain-scenarios"))
}

async fn commit(repo: &Repo, rev: Rev, edit: ChainEdit) {
    let outcome = commit_locally(repo, TrxId::generate(), rev, edit).await.unwrap();
    assert!(outcome.is_success(), "commit did not succeed: {outcome:?}");
}

/// S1 Chain add/dequeue FIFO.
#[tokio::test]
async fn s1_chain_add_dequeue_fifo() {
    let repo = Arc::new(Repo::new());
    let (chain, edit) = Chain::create(store(&repo));
    commit(&repo, 1, edit).await;

    let edit = chain.add((1..=5).map(Value::I64).collect()).await.unwrap();
    commit(&repo, 2, edit).await;

    let (dequeued, edit) = chain.dequeue(2).await.unwrap();
    commit(&repo, 3, edit).await;
    assert_eq!(dequeued, vec![Value::I64(1), Value::I64(2)]);

    let (dequeued, edit) = chain.dequeue(10).await.unwrap();
    commit(&repo, 4, edit).await;
    assert_eq!(dequeued, vec![Value::I64(3), Value::I64(4), Value::I64(5)]);

    let (dequeued, edit) = chain.dequeue(1).await.unwrap();
    commit(&repo, 5, edit).await;
    assert!(dequeued.is_empty());
}

/// S2 Chain pop returns removed entries in forward (insertion) order,
/// per the pop operation's own contract — not stack-style reversed.
#[tokio::test]
async fn s2_chain_pop_returns_forward_order() {
    let repo = Arc::new(Repo::new());
    let (chain, edit) = Chain::create(store(&repo));
    commit(&repo, 1, edit).await;

    let edit = chain
        .add(vec![Value::Str("a".into()), Value::Str("b".into()), Value::Str("c".into())])
        .await
        .unwrap();
    commit(&repo, 2, edit).await;

    let (popped, edit) = chain.pop(1).await.unwrap();
    commit(&repo, 3, edit).await;
    assert_eq!(popped, vec![Value::Str("c".into())]);

    let (popped, edit) = chain.pop(5).await.unwrap();
    commit(&repo, 4, edit).await;
    assert_eq!(popped, vec![Value::Str("a".into()), Value::Str("b".into())]);
}
