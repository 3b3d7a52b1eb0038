use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use blockmesh_base::{transport_err, Result};

/// An opaque node identity in the peer keyspace, analogous to the teacher's
/// `NodeID` but addressed by content rather than a small integer — the
/// coordinator oracle is a distance function over this id, not an index.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        PeerId(rapidhash::rapidhash(bytes))
    }

    /// XOR distance in the peer keyspace, per spec's "XOR-distance over a
    /// peer keyspace" routing oracle.
    pub fn xor_distance(&self, key: u64) -> u64 {
        self.0 ^ key
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PeerAddr {
    pub addrs: Vec<String>,
    pub pub_key: Vec<u8>,
}

/// Key-routing oracle (spec.md §6): deterministic XOR-nearest-peer lookup
/// for a given network membership, with no guarantee of stability across
/// membership changes. `excluded_peers` lets a retrying caller route around
/// a peer it already tried.
#[async_trait]
pub trait IKeyNetwork: Send + Sync {
    async fn find_coordinator(
        &self,
        key_bytes: &[u8],
        excluded_peers: &BTreeSet<PeerId>,
    ) -> Result<PeerId>;

    async fn find_cluster(&self, key_bytes: &[u8]) -> Result<BTreeMap<PeerId, PeerAddr>>;
}

/// A fixed-membership `IKeyNetwork` over an explicit peer table, sufficient
/// for tests and the single-process demo. Production deployments would
/// replace this with a gossip- or DHT-backed membership view; the oracle
/// contract is the same either way.
#[derive(Clone, Debug, Default)]
pub struct StaticKeyNetwork {
    peers: BTreeMap<PeerId, PeerAddr>,
}

impl StaticKeyNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(mut self, id: PeerId, addr: PeerAddr) -> Self {
        self.peers.insert(id, addr);
        self
    }

    pub fn peers(&self) -> &BTreeMap<PeerId, PeerAddr> {
        &self.peers
    }
}

#[async_trait]
impl IKeyNetwork for StaticKeyNetwork {
    async fn find_coordinator(
        &self,
        key_bytes: &[u8],
        excluded_peers: &BTreeSet<PeerId>,
    ) -> Result<PeerId> {
        let key = rapidhash::rapidhash(key_bytes);
        self.peers
            .keys()
            .filter(|id| !excluded_peers.contains(id))
            .min_by_key(|id| id.xor_distance(key))
            .copied()
            .ok_or_else(|| transport_err("no coordinator found for key: all peers excluded or empty membership"))
    }

    async fn find_cluster(&self, key_bytes: &[u8]) -> Result<BTreeMap<PeerId, PeerAddr>> {
        let key = rapidhash::rapidhash(key_bytes);
        let mut out: Vec<(u64, PeerId, PeerAddr)> = self
            .peers
            .iter()
            .map(|(id, addr)| (id.xor_distance(key), *id, addr.clone()))
            .collect();
        out.sort_by_key(|(dist, _, _)| *dist);
        Ok(out.into_iter().map(|(_, id, addr)| (id, addr)).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[cfg(test)]
    use test_log::test;

    #[tokio::test]
    async fn find_coordinator_picks_xor_nearest() {
        let net = StaticKeyNetwork::new()
            .with_peer(PeerId(0b0000), PeerAddr::default())
            .with_peer(PeerId(0b1111), PeerAddr::default());
        // rapidhash of the key is unpredictable, but excluding all but one
        // peer must still deterministically select that peer.
        let excluded: BTreeSet<PeerId> = [PeerId(0b1111)].into_iter().collect();
        let chosen = net.find_coordinator(b"block-1", &excluded).await.unwrap();
        assert_eq!(chosen, PeerId(0b0000));
    }

    #[tokio::test]
    async fn find_coordinator_fails_when_all_peers_excluded() {
        let net = StaticKeyNetwork::new().with_peer(PeerId(1), PeerAddr::default());
        let excluded: BTreeSet<PeerId> = [PeerId(1)].into_iter().collect();
        assert!(net.find_coordinator(b"x", &excluded).await.is_err());
    }

    #[tokio::test]
    async fn find_cluster_orders_by_xor_distance() {
        let net = StaticKeyNetwork::new()
            .with_peer(PeerId(0b1111), PeerAddr::default())
            .with_peer(PeerId(0b0000), PeerAddr::default());
        let cluster = net.find_cluster(b"k").await.unwrap();
        let order: Vec<PeerId> = cluster.keys().copied().collect();
        assert_eq!(order.len(), 2);
    }
}
