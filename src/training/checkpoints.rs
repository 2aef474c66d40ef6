//! Checkpoint persistence
//!
//! Each checkpoint is one safetensors file `ckp-{step}.safetensors` holding
//! every model variable and the optimizer state. `checkpoint.json` points at
//! the most recent file and records the geometry the weights were trained
//! for. Both the checkpoint file and the pointer are written to a staging
//! file and renamed into place, so a crash mid-save leaves the previous
//! checkpoint intact and reachable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::Geometry;

/// Name of the latest-checkpoint pointer file
pub const POINTER_FILE: &str = "checkpoint.json";

const FILE_PREFIX: &str = "ckp-";
const FILE_EXTENSION: &str = "safetensors";

/// Contents of the latest-checkpoint pointer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointPointer {
    /// File name of the latest checkpoint, relative to the checkpoint directory
    pub latest: String,
    /// Step the checkpoint was saved at
    pub step: usize,
    /// Save time
    pub saved_at: DateTime<Utc>,
    /// Geometry of the saved weights
    pub geometry: Geometry,
}

/// A checkpoint found on disk
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    /// Step embedded in the file name
    pub step: usize,
    /// Full path of the checkpoint file
    pub path: PathBuf,
    /// Recorded geometry, when the pointer describes this checkpoint
    pub geometry: Option<Geometry>,
}

/// Writes, lists, prunes and reads checkpoints in one directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    save_total_limit: Option<usize>,
}

impl CheckpointManager {
    /// Create a manager, creating the directory if needed
    pub fn new(checkpoint_dir: impl AsRef<Path>, save_total_limit: Option<usize>) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&checkpoint_dir).map_err(|e| {
            Error::checkpoint(format!(
                "Cannot create checkpoint directory {}: {e}",
                checkpoint_dir.display()
            ))
        })?;
        Ok(Self {
            checkpoint_dir,
            save_total_limit,
        })
    }

    /// Checkpoint directory
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// File path for the checkpoint of `step`
    pub fn checkpoint_path(&self, step: usize) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{FILE_PREFIX}{step}.{FILE_EXTENSION}"))
    }

    /// Partial file a checkpoint is written to before it replaces the real one
    fn staging_path(&self, step: usize) -> PathBuf {
        self.checkpoint_dir
            .join(format!("{FILE_PREFIX}{step}.{FILE_EXTENSION}.tmp"))
    }

    /// Step embedded in a checkpoint file name
    pub fn step_from_path(path: &Path) -> Option<usize> {
        if path.extension()?.to_str()? != FILE_EXTENSION {
            return None;
        }
        path.file_stem()?
            .to_str()?
            .strip_prefix(FILE_PREFIX)?
            .parse()
            .ok()
    }

    /// Every checkpoint in the directory, oldest step first
    pub fn list_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut checkpoints: Vec<(usize, PathBuf)> = std::fs::read_dir(&self.checkpoint_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter_map(|path| Self::step_from_path(&path).map(|step| (step, path)))
            .collect();
        checkpoints.sort_by_key(|(step, _)| *step);
        Ok(checkpoints)
    }

    /// Write a checkpoint for `step` and make it the latest
    pub fn save(
        &self,
        step: usize,
        geometry: Geometry,
        tensors: &HashMap<String, Tensor>,
    ) -> Result<PathBuf> {
        let path = self.checkpoint_path(step);
        let staging = self.staging_path(step);
        candle_core::safetensors::save(tensors, &staging).map_err(|e| {
            Error::checkpoint(format!("Failed to write {}: {e}", staging.display()))
        })?;
        std::fs::rename(&staging, &path).map_err(|e| {
            Error::checkpoint(format!(
                "Failed to move {} into place: {e}",
                staging.display()
            ))
        })?;

        let pointer = CheckpointPointer {
            latest: path
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)
                .ok_or_else(|| Error::internal("Checkpoint path has no file name"))?,
            step,
            saved_at: Utc::now(),
            geometry,
        };
        self.write_pointer(&pointer)?;
        self.enforce_limit()?;

        debug!("Saved checkpoint {} ({} tensors)", path.display(), tensors.len());
        Ok(path)
    }

    fn write_pointer(&self, pointer: &CheckpointPointer) -> Result<()> {
        let target = self.checkpoint_dir.join(POINTER_FILE);
        let staging = self.checkpoint_dir.join(format!("{POINTER_FILE}.tmp"));
        std::fs::write(&staging, serde_json::to_vec_pretty(pointer)?)?;
        std::fs::rename(&staging, &target)?;
        Ok(())
    }

    fn read_pointer(&self) -> Option<CheckpointPointer> {
        let content = std::fs::read(self.checkpoint_dir.join(POINTER_FILE)).ok()?;
        match serde_json::from_slice(&content) {
            Ok(pointer) => Some(pointer),
            Err(e) => {
                warn!("Ignoring unreadable checkpoint pointer: {}", e);
                None
            }
        }
    }

    /// Delete the oldest checkpoints beyond the retention limit
    fn enforce_limit(&self) -> Result<()> {
        let Some(limit) = self.save_total_limit else {
            return Ok(());
        };
        let checkpoints = self.list_checkpoints()?;
        if checkpoints.len() <= limit {
            return Ok(());
        }
        let excess = checkpoints.len() - limit;
        for (step, path) in checkpoints.into_iter().take(excess) {
            std::fs::remove_file(&path)?;
            debug!("Removed checkpoint for step {}", step);
        }
        Ok(())
    }

    /// The most recent checkpoint, if any.
    ///
    /// The pointer is trusted when the file it names exists; otherwise the
    /// directory is scanned for the highest step.
    pub fn latest(&self) -> Result<Option<CheckpointInfo>> {
        if let Some(pointer) = self.read_pointer() {
            let path = self.checkpoint_dir.join(&pointer.latest);
            if let Some(step) = Self::step_from_path(&path).filter(|_| path.is_file()) {
                return Ok(Some(CheckpointInfo {
                    step,
                    path,
                    geometry: Some(pointer.geometry),
                }));
            }
            warn!("Checkpoint pointer names missing file {}", pointer.latest);
        }

        Ok(self
            .list_checkpoints()?
            .pop()
            .map(|(step, path)| CheckpointInfo {
                step,
                path,
                geometry: None,
            }))
    }

    /// Read a checkpoint after checking that it holds every `expected` tensor
    /// with the expected shape. Nothing is returned unless the whole file
    /// matches.
    pub fn load(
        &self,
        path: &Path,
        expected: &[(String, Vec<usize>)],
        device: &Device,
    ) -> Result<HashMap<String, Tensor>> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::checkpoint(format!("Cannot read {}: {e}", path.display()))
        })?;

        {
            let header = SafeTensors::deserialize(&bytes).map_err(|e| {
                Error::checkpoint(format!("{} is not a safetensors file: {e}", path.display()))
            })?;
            for (name, shape) in expected {
                let view = header.tensor(name).map_err(|_| {
                    Error::checkpoint(format!("{} has no tensor '{name}'", path.display()))
                })?;
                if view.shape() != shape.as_slice() {
                    return Err(Error::checkpoint(format!(
                        "Tensor '{name}' in {} has shape {:?}, expected {:?}",
                        path.display(),
                        view.shape(),
                        shape
                    )));
                }
            }
        }

        let tensors = candle_core::safetensors::load_buffer(&bytes, device)?;
        info!("Read checkpoint {} ({} tensors)", path.display(), tensors.len());
        Ok(tensors)
    }
}
