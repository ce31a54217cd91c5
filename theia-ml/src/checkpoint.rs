//! Checkpoint management for training runs.
//!
//! Each checkpoint is a numbered directory holding the model weights and
//! the optimizer slots, indexed by a JSON manifest:
//!
//! ```text
//! <dir>/checkpoints.json
//! <dir>/ckpt-3/model.safetensors
//! <dir>/ckpt-3/optimizer.safetensors
//! ```

use crate::error::{MlError, Result};
use crate::optim::{OptimizerState, TrainableOptimizer};
use candle_core::Device;
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use theia_core::persistence::{atomic_write_json, load_json};

const MANIFEST_FILE: &str = "checkpoints.json";
const MODEL_FILE: &str = "model.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.safetensors";

/// A saved training checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Monotonic save counter, never reused after pruning.
    pub number: usize,
    /// Zero-based epoch that had just finished.
    pub epoch: usize,
    /// Optimizer updates applied when the checkpoint was taken.
    pub step: usize,
    pub loss: Option<f64>,
    pub dir_name: String,
    pub model_sha256: String,
    pub size_bytes: u64,
    pub optimizer_kind: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    next_number: usize,
    checkpoints: Vec<Checkpoint>,
}

/// Keeps the most recent checkpoints of one run.
pub struct CheckpointManager {
    directory: PathBuf,
    max_to_keep: usize,
}

impl CheckpointManager {
    pub fn new(directory: PathBuf, max_to_keep: usize) -> Self {
        Self {
            directory,
            max_to_keep: max_to_keep.max(1),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Checkpoints still on disk, oldest first.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        Ok(self.manifest()?.checkpoints)
    }

    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.manifest()?.checkpoints.pop())
    }

    /// Directory holding the files of `checkpoint`.
    pub fn path_of(&self, checkpoint: &Checkpoint) -> PathBuf {
        self.directory.join(&checkpoint.dir_name)
    }

    fn manifest(&self) -> Result<Manifest> {
        Ok(load_json(&self.directory.join(MANIFEST_FILE))?.unwrap_or_default())
    }

    /// Write the current weights and optimizer state as a new checkpoint,
    /// pruning the oldest ones beyond `max_to_keep`.
    pub fn save(
        &self,
        epoch: usize,
        varmap: &VarMap,
        optimizer: &TrainableOptimizer,
        loss: Option<f64>,
    ) -> Result<Checkpoint> {
        let mut manifest = self.manifest()?;
        let number = manifest.next_number + 1;
        let dir_name = format!("ckpt-{number}");
        let dir = self.directory.join(&dir_name);
        std::fs::create_dir_all(&dir)?;

        let model_path = dir.join(MODEL_FILE);
        varmap.save(&model_path)?;

        let state = optimizer.state()?;
        if !state.slots.is_empty() {
            candle_core::safetensors::save(&state.slots, dir.join(OPTIMIZER_FILE))?;
        }

        let checkpoint = Checkpoint {
            number,
            epoch,
            step: state.step,
            loss: loss.filter(|l| l.is_finite()),
            dir_name,
            model_sha256: file_sha256(&model_path)?,
            size_bytes: std::fs::metadata(&model_path)?.len(),
            optimizer_kind: state.kind,
            created_at: Utc::now(),
        };

        manifest.next_number = number;
        manifest.checkpoints.push(checkpoint.clone());
        let excess = manifest.checkpoints.len().saturating_sub(self.max_to_keep);
        let pruned: Vec<Checkpoint> = manifest.checkpoints.drain(..excess).collect();

        atomic_write_json(&self.directory.join(MANIFEST_FILE), &manifest)?;

        for old in pruned {
            let old_dir = self.path_of(&old);
            if let Err(e) = std::fs::remove_dir_all(&old_dir) {
                tracing::warn!(path = %old_dir.display(), error = %e, "Failed to prune checkpoint");
            } else {
                tracing::debug!(number = old.number, "Pruned checkpoint");
            }
        }

        tracing::info!(
            number,
            epoch,
            step = checkpoint.step,
            path = %dir.display(),
            "Saved checkpoint"
        );
        Ok(checkpoint)
    }

    /// Load `checkpoint` into the model variables and the optimizer.
    pub fn restore(
        &self,
        checkpoint: &Checkpoint,
        varmap: &mut VarMap,
        optimizer: &mut TrainableOptimizer,
    ) -> Result<()> {
        let dir = self.path_of(checkpoint);
        let model_path = dir.join(MODEL_FILE);
        if !model_path.exists() {
            return Err(MlError::not_found(format!("{}", model_path.display())));
        }

        let hash = file_sha256(&model_path)?;
        if hash != checkpoint.model_sha256 {
            return Err(MlError::checkpoint(format!(
                "{} does not match its recorded hash",
                model_path.display()
            )));
        }
        varmap.load(&model_path)?;

        let optimizer_path = dir.join(OPTIMIZER_FILE);
        let slots = if optimizer_path.exists() {
            candle_core::safetensors::load(&optimizer_path, &Device::Cpu)?
        } else {
            Default::default()
        };
        optimizer.load_state(&OptimizerState {
            kind: checkpoint.optimizer_kind.clone(),
            step: checkpoint.step,
            slots,
        })?;

        tracing::info!(number = checkpoint.number, epoch = checkpoint.epoch, "Restored checkpoint");
        Ok(())
    }

    /// Restore the latest checkpoint if there is one.
    ///
    /// Returns the restored checkpoint, or `None` when training starts
    /// from freshly initialized variables.
    pub fn restore_or_initialize(
        &self,
        varmap: &mut VarMap,
        optimizer: &mut TrainableOptimizer,
    ) -> Result<Option<Checkpoint>> {
        let Some(latest) = self.latest()? else {
            tracing::debug!(dir = %self.directory.display(), "No checkpoint, initializing");
            return Ok(None);
        };
        self.restore(&latest, varmap, optimizer)?;
        Ok(Some(latest))
    }
}

fn file_sha256(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}
