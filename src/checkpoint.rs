use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::ConvVae;
use crate::optim::Adam;

/// Prefix of every checkpoint file; the global step is appended.
pub const CHECKPOINT_PREFIX: &str = "model.ckpt";
/// Name of the JSON index listing the retained checkpoints.
pub const INDEX_FILE: &str = "checkpoint";

/// Everything needed to resume a run: model weights with batch-norm running
/// statistics, Adam moments and the global step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingState {
    pub global_step: u64,
    pub model: ConvVae,
    pub optimizer: Adam,
}

/// Write `state` to `path` with bincode. The bytes go to a sibling temporary
/// file first and are renamed into place.
pub fn save_checkpoint(path: &Path, state: &TrainingState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let bytes = bincode::serialize(state)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a checkpoint written by [`save_checkpoint`].
pub fn load_checkpoint(path: &Path) -> Result<TrainingState> {
    let bytes = fs::read(path)?;
    let state = bincode::deserialize(&bytes)?;
    Ok(state)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    model_checkpoint_path: Option<String>,
    all_model_checkpoint_paths: Vec<String>,
}

/// Numbered checkpoints in one directory, keeping the newest `max_to_keep`.
#[derive(Clone, Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
}

impl CheckpointManager {
    pub fn new<P: Into<PathBuf>>(dir: P, max_to_keep: usize) -> Self {
        Self {
            dir: dir.into(),
            max_to_keep: max_to_keep.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn read_index(&self) -> Result<CheckpointIndex> {
        let path = self.index_path();
        if !path.is_file() {
            return Ok(CheckpointIndex::default());
        }
        let txt = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&txt)?)
    }

    fn write_index(&self, index: &CheckpointIndex) -> Result<()> {
        let txt = serde_json::to_string_pretty(index)?;
        fs::write(self.index_path(), txt)?;
        Ok(())
    }

    /// Save `state` as `model.ckpt-<step>` and prune old checkpoints.
    pub fn save(&self, state: &TrainingState) -> Result<PathBuf> {
        let name = format!("{CHECKPOINT_PREFIX}-{}", state.global_step);
        let path = self.dir.join(&name);
        save_checkpoint(&path, state)?;

        let mut index = self.read_index()?;
        index.all_model_checkpoint_paths.retain(|p| p != &name);
        index.all_model_checkpoint_paths.push(name.clone());
        while index.all_model_checkpoint_paths.len() > self.max_to_keep {
            let old = index.all_model_checkpoint_paths.remove(0);
            let old_path = self.dir.join(&old);
            if old_path.is_file() {
                fs::remove_file(&old_path)?;
            }
            log::debug!("Removed old checkpoint {}", old_path.display());
        }
        index.model_checkpoint_path = Some(name);
        self.write_index(&index)?;
        Ok(path)
    }

    /// Paths of the retained checkpoints, oldest first.
    pub fn checkpoints(&self) -> Result<Vec<PathBuf>> {
        let index = self.read_index()?;
        Ok(index
            .all_model_checkpoint_paths
            .iter()
            .map(|p| self.dir.join(p))
            .collect())
    }

    /// Path of the most recent checkpoint, if any.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        let index = self.read_index()?;
        Ok(index
            .model_checkpoint_path
            .map(|p| self.dir.join(p))
            .filter(|p| p.is_file()))
    }

    /// Load the most recent checkpoint; `Ok(None)` when there is none.
    pub fn restore_latest(&self) -> Result<Option<TrainingState>> {
        match self.latest()? {
            Some(path) => {
                let state = load_checkpoint(&path)?;
                log::info!("Restored checkpoint {}", path.display());
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }
}
