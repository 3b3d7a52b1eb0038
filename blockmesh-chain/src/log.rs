use serde::{Deserialize, Serialize};

use blockmesh_base::{invariant_err, Result};
use blockmesh_model::{BlockId, Rev, Value};
use blockmesh_repo::BlockStore;

use crate::chain::{Chain, ChainEdit, Path};

/// One entry of a tamper-evident append log: either an application
/// action or a checkpoint marker.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LogAction {
    Action(Value),
    Checkpoint,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub rev: Rev,
    pub action: LogAction,
}

/// What actually gets stored in a `Chain` entry: the logical `LogEntry`
/// plus the rapidhash of the previous stored entry's bytes, chaining each
/// entry to its predecessor for tamper evidence (spec.md §4.5's closing
/// sentence). Hashing the previous entry's own encoded bytes rather than
/// threading a separate per-block hash field keeps `Log` built entirely
/// out of `Chain`'s existing fixed-field data blocks.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
struct StoredLogEntry {
    entry: LogEntry,
    prior_hash: u64,
}

fn encode(stored: &StoredLogEntry) -> Result<Vec<u8>> {
    rmp_serde::to_vec(stored).map_err(|e| invariant_err(format!("log entry encode failed: {e}")))
}

fn decode(bytes: &[u8]) -> Result<StoredLogEntry> {
    rmp_serde::from_slice(bytes).map_err(|e| invariant_err(format!("log entry decode failed: {e}")))
}

fn bytes_of(value: &Value) -> Result<&[u8]> {
    value.as_bytes().ok_or_else(|| invariant_err("log entry is not a byte blob"))
}

/// A `Chain` whose entries are hash-chained `LogEntry` records.
pub struct Log<S: BlockStore> {
    chain: Chain<S>,
    tip_hash: u64,
}

impl<S: BlockStore> Log<S> {
    pub fn create(store: S) -> (Log<S>, ChainEdit) {
        let (chain, edit) = Chain::create(store);
        (Log { chain, tip_hash: 0 }, edit)
    }

    pub async fn open(store: S, id: BlockId) -> Result<(Log<S>, Option<ChainEdit>)> {
        let (chain, edit) = Chain::open(store, id).await?;
        let tip_hash = Self::tail_hash(&chain).await?;
        Ok((Log { chain, tip_hash }, edit))
    }

    async fn tail_hash(chain: &Chain<S>) -> Result<u64> {
        let tail_id = chain.get_tail().await?;
        let block = chain
            .store()
            .try_get(&tail_id)
            .await?
            .ok_or_else(|| invariant_err(format!("dangling tail {tail_id}")))?;
        let entries = block
            .field("entries")
            .and_then(blockmesh_model::FieldValue::as_array)
            .ok_or_else(|| invariant_err("entries field missing or not an array"))?;
        match entries.last() {
            Some(v) => Ok(rapidhash::rapidhash(bytes_of(v)?)),
            None => Ok(0),
        }
    }

    pub fn header_id(&self) -> &BlockId {
        self.chain.header_id()
    }

    pub fn chain(&self) -> &Chain<S> {
        &self.chain
    }

    pub async fn append(&mut self, timestamp: i64, rev: Rev, action: LogAction) -> Result<ChainEdit> {
        let stored = StoredLogEntry { entry: LogEntry { timestamp, rev, action }, prior_hash: self.tip_hash };
        let bytes = encode(&stored)?;
        let hash = rapidhash::rapidhash(&bytes);
        let edit = self.chain.add(vec![Value::Bytes(bytes)]).await?;
        self.tip_hash = hash;
        Ok(edit)
    }

    pub async fn select(
        &self,
        starting_path: Option<Path>,
        forward: bool,
        limit: usize,
    ) -> Result<Vec<(Path, LogEntry)>> {
        let paths = self.chain.select(starting_path, forward, limit).await?;
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let value = self
                .chain
                .value_at(&path)
                .await?
                .ok_or_else(|| invariant_err("path resolved to no value"))?;
            out.push((path, decode(bytes_of(&value)?)?.entry));
        }
        Ok(out)
    }

    /// Walks the whole log verifying each entry's `prior_hash` against the
    /// previous entry's actual encoded bytes. `false` means the log has
    /// been tampered with or corrupted.
    pub async fn verify_integrity(&self) -> Result<bool> {
        let paths = self.chain.select(None, true, usize::MAX).await?;
        let mut expected = 0u64;
        for path in paths {
            let value = self
                .chain
                .value_at(&path)
                .await?
                .ok_or_else(|| invariant_err("path resolved to no value"))?;
            let bytes = bytes_of(&value)?;
            let stored = decode(bytes)?;
            if stored.prior_hash != expected {
                return Ok(false);
            }
            expected = rapidhash::rapidhash(bytes);
        }
        Ok(true)
    }
}
