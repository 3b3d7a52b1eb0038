use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use blockmesh_base::{err, Result};
use blockmesh_model::{Block, BlockId, Rev, Transform, TrxId};

/// Write `bytes` to `path` atomically: write to a sibling `.tmp` file, flush,
/// fsync, then rename over the destination. Readers never observe a
/// partially-written file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(err_io)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let file = File::create(&tmp).map_err(err_io)?;
        let mut w = BufWriter::new(file);
        w.write_all(bytes).map_err(err_io)?;
        w.flush().map_err(err_io)?;
        w.into_inner().map_err(|e| err(e.to_string()))?.sync_all().map_err(err_io)?;
    }
    fs::rename(&tmp, path).map_err(err_io)?;
    Ok(())
}

fn err_io(e: std::io::Error) -> blockmesh_base::Error {
    err(e.to_string())
}

fn read_opt(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(err_io(e)),
    }
}

/// Layout under a per-Repo base directory: one subtree per block, holding
/// its header (`meta`), materialized revisions (`revs/{rev}`), and the
/// committed/pending transforms that produced them (`trx/{trxId}`,
/// `pend/{trxId}`). `block/{trxId}` holds the materialized snapshot a
/// not-yet-committed insert would produce, so a crash between pend and
/// commit leaves nothing ambiguous on replay.
pub struct FileLayout {
    base: PathBuf,
}

impl FileLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        FileLayout { base: base.into() }
    }

    fn block_dir(&self, id: &BlockId) -> PathBuf {
        self.base.join(id.as_str())
    }

    fn meta_path(&self, id: &BlockId) -> PathBuf {
        self.block_dir(id).join("meta")
    }

    fn rev_path(&self, id: &BlockId, rev: Rev) -> PathBuf {
        self.block_dir(id).join("revs").join(rev.to_string())
    }

    fn trx_path(&self, id: &BlockId, trx_id: &TrxId) -> PathBuf {
        self.block_dir(id).join("trx").join(trx_id.as_str())
    }

    fn pend_path(&self, id: &BlockId, trx_id: &TrxId) -> PathBuf {
        self.block_dir(id).join("pend").join(trx_id.as_str())
    }

    fn block_snapshot_path(&self, id: &BlockId, trx_id: &TrxId) -> PathBuf {
        self.block_dir(id).join("block").join(trx_id.as_str())
    }

    pub fn write_meta(&self, id: &BlockId, block_type_tag: [u8; 3]) -> Result<()> {
        write_atomic(&self.meta_path(id), &block_type_tag)
    }

    pub fn read_meta(&self, id: &BlockId) -> Result<Option<[u8; 3]>> {
        Ok(read_opt(&self.meta_path(id))?.map(|bytes| {
            let mut tag = [0u8; 3];
            tag.copy_from_slice(&bytes[..3]);
            tag
        }))
    }

    pub fn write_rev(&self, id: &BlockId, rev: Rev, block: &Block) -> Result<()> {
        let bytes = rmp_serde::to_vec(block).map_err(|e| err(e.to_string()))?;
        write_atomic(&self.rev_path(id, rev), &bytes)
    }

    pub fn read_rev(&self, id: &BlockId, rev: Rev) -> Result<Option<Block>> {
        match read_opt(&self.rev_path(id, rev))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes).map_err(|e| err(e.to_string()))?)),
        }
    }

    pub fn write_committed_trx(&self, id: &BlockId, trx_id: &TrxId, t: &Transform) -> Result<()> {
        let bytes = rmp_serde::to_vec(t).map_err(|e| err(e.to_string()))?;
        write_atomic(&self.trx_path(id, trx_id), &bytes)
    }

    pub fn write_pending_trx(&self, id: &BlockId, trx_id: &TrxId, t: &Transform) -> Result<()> {
        let bytes = rmp_serde::to_vec(t).map_err(|e| err(e.to_string()))?;
        write_atomic(&self.pend_path(id, trx_id), &bytes)
    }

    pub fn remove_pending_trx(&self, id: &BlockId, trx_id: &TrxId) -> Result<()> {
        match fs::remove_file(self.pend_path(id, trx_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(err_io(e)),
        }
    }

    pub fn write_block_snapshot(&self, id: &BlockId, trx_id: &TrxId, block: &Block) -> Result<()> {
        let bytes = rmp_serde::to_vec(block).map_err(|e| err(e.to_string()))?;
        write_atomic(&self.block_snapshot_path(id, trx_id), &bytes)
    }

    /// Every rev committed for `id`, in ascending order, for replaying a
    /// MissingTransform catch-up from cold storage.
    pub fn committed_revs(&self, id: &BlockId) -> Result<Vec<Rev>> {
        let dir = self.block_dir(id).join("revs");
        let entries = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(err_io(e)),
        };
        let mut revs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(err_io)?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(rev) = name.parse::<Rev>() {
                    revs.push(rev);
                }
            }
        }
        revs.sort_unstable();
        Ok(revs)
    }
}
