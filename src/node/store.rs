// Chain snapshot persistence.
//
// The chain file is a JSON snapshot of the full block list plus metadata.
// Writes go through a temp file and rename, so a crash mid-save leaves the
// previous snapshot intact. A file that fails to parse or validate is moved
// aside as `<name>.backup.<unix_ms>` rather than deleted — corruption is
// evidence, not garbage.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consensus::difficulty::DifficultyAlgorithm;
use crate::primitives::block::Block;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chain file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("chain file encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub network_id: String,
    pub difficulty_algorithm: DifficultyAlgorithm,
    pub blocks: Vec<Block>,
}

pub struct ChainStore {
    path: PathBuf,
}

impl ChainStore {
    pub fn new(path: &Path) -> Self {
        ChainStore {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Atomic snapshot write: temp file in the same directory, then rename.
    pub fn save(&self, snapshot: &ChainSnapshot) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Read the snapshot. `Ok(None)` when no file exists yet; a parse error
    /// propagates so the caller can back the file up and bootstrap fresh.
    pub fn load(&self) -> Result<Option<ChainSnapshot>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Move a corrupt or rejected chain file aside.
    pub fn backup_corrupt(&self, now_ms: u64) -> std::io::Result<PathBuf> {
        let backup = self.path.with_extension(format!("json.backup.{now_ms}"));
        std::fs::rename(&self.path, &backup)?;
        Ok(backup)
    }
}
