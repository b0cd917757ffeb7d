// Checkpoint management
//
// A checkpoint is a directory holding everything needed to reload the model
// for inference:
//   <id>/
//     model.safetensors
//     model.json
//     tokenizer.json
//     checkpoint.json     (CheckpointMeta)
// Publication is atomic: the artifact is staged under a hidden directory in
// the same parent and renamed into place, so a crash mid-write never leaves
// a directory that looks like a checkpoint.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::HyperParams;
use crate::errors::ConfigError;
use crate::models::Backbone;

/// Checkpoint metadata, written alongside the weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Checkpoint ID (timestamp plus epoch)
    pub id: String,
    /// Timestamp of creation
    pub created_at: DateTime<Utc>,
    /// Schema version the model was trained against
    pub schema_version: String,
    /// Epoch this checkpoint was taken after (1-based)
    pub epoch: usize,
    /// Mean training loss over that epoch
    pub epoch_loss: f32,
    /// Hyperparameters of the run that produced it
    pub hyperparameters: HyperParams,
}

impl CheckpointMeta {
    /// Reject a checkpoint trained against a different schema version.
    pub fn check_schema(&self, active: &str) -> Result<(), ConfigError> {
        if self.schema_version != active {
            return Err(ConfigError::SchemaVersionMismatch {
                checkpoint: self.schema_version.clone(),
                active: active.to_string(),
            });
        }
        Ok(())
    }
}

/// Manages checkpoint directories: atomic writes, listing, pruning.
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(checkpoint_dir: PathBuf, max_checkpoints: usize) -> Result<Self> {
        fs::create_dir_all(&checkpoint_dir).with_context(|| {
            format!("Failed to create checkpoint directory {}", checkpoint_dir.display())
        })?;

        Ok(Self { checkpoint_dir, max_checkpoints })
    }

    pub fn dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Write a checkpoint and publish it atomically.
    pub fn create_checkpoint(
        &self,
        backbone: &dyn Backbone,
        schema_version: &str,
        epoch: usize,
        epoch_loss: f32,
        hyperparameters: &HyperParams,
    ) -> Result<CheckpointMeta> {
        let created_at = Utc::now();
        let id = format!("{}_epoch{epoch}", created_at.format("%Y%m%d_%H%M%S"));

        // Stage in the same parent so the final rename stays on one filesystem.
        let staging = self.checkpoint_dir.join(format!(".staging-{id}"));
        if staging.exists() {
            fs::remove_dir_all(&staging).with_context(|| {
                format!("Failed to clear stale staging directory {}", staging.display())
            })?;
        }
        fs::create_dir_all(&staging).with_context(|| {
            format!("Failed to create staging directory {}", staging.display())
        })?;

        let meta = CheckpointMeta {
            id: id.clone(),
            created_at,
            schema_version: schema_version.to_string(),
            epoch,
            epoch_loss,
            hyperparameters: hyperparameters.clone(),
        };

        let result = self.stage_checkpoint(&staging, backbone, &meta);
        if let Err(e) = result {
            // Best-effort cleanup; the hidden name keeps a leftover invisible
            // to list_checkpoints either way.
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let final_dir = self.checkpoint_dir.join(&id);
        fs::rename(&staging, &final_dir).with_context(|| {
            format!("Failed to publish checkpoint {}", final_dir.display())
        })?;

        tracing::info!(
            checkpoint_id = %id,
            epoch = epoch,
            epoch_loss = epoch_loss,
            "Created checkpoint"
        );

        self.cleanup_old_checkpoints()?;

        Ok(meta)
    }

    fn stage_checkpoint(
        &self,
        staging: &Path,
        backbone: &dyn Backbone,
        meta: &CheckpointMeta,
    ) -> Result<()> {
        backbone.save(staging).context("Failed to save model into checkpoint")?;

        let metadata_path = staging.join("checkpoint.json");
        let metadata_json = serde_json::to_string_pretty(meta)
            .context("Failed to serialize checkpoint metadata")?;
        fs::write(&metadata_path, metadata_json).with_context(|| {
            format!("Failed to write checkpoint metadata {}", metadata_path.display())
        })?;

        Ok(())
    }

    /// List all published checkpoints, newest first.
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointMeta>> {
        let mut checkpoints = Vec::new();

        if !self.checkpoint_dir.exists() {
            return Ok(checkpoints);
        }

        for entry in fs::read_dir(&self.checkpoint_dir).with_context(|| {
            format!("Failed to read checkpoint directory {}", self.checkpoint_dir.display())
        })? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            // Staging directories are not checkpoints.
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }

            let metadata_path = path.join("checkpoint.json");
            if !metadata_path.exists() {
                continue;
            }
            match load_checkpoint_meta(&metadata_path) {
                Ok(meta) => checkpoints.push(meta),
                Err(e) => {
                    tracing::warn!(
                        path = %metadata_path.display(),
                        error = %e,
                        "Failed to load checkpoint metadata"
                    );
                }
            }
        }

        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(checkpoints)
    }

    /// Most recent checkpoint, if any.
    pub fn latest(&self) -> Result<Option<CheckpointMeta>> {
        Ok(self.list_checkpoints()?.into_iter().next())
    }

    /// Resolve a checkpoint ID to its directory, verifying it exists.
    pub fn checkpoint_path(&self, checkpoint_id: &str) -> Result<PathBuf> {
        let dir = self.checkpoint_dir.join(checkpoint_id);
        if !dir.join("checkpoint.json").exists() {
            anyhow::bail!("Checkpoint not found: {checkpoint_id}");
        }
        Ok(dir)
    }

    pub fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        let dir = self.checkpoint_dir.join(checkpoint_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| {
                format!("Failed to delete checkpoint directory {}", dir.display())
            })?;
            tracing::info!(checkpoint_id = %checkpoint_id, "Deleted checkpoint");
        }
        Ok(())
    }

    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let checkpoints = self.list_checkpoints()?;

        if checkpoints.len() > self.max_checkpoints {
            let to_delete = &checkpoints[self.max_checkpoints..];
            for checkpoint in to_delete {
                self.delete_checkpoint(&checkpoint.id)?;
            }
            tracing::info!(
                deleted = to_delete.len(),
                kept = self.max_checkpoints,
                "Cleaned up old checkpoints"
            );
        }

        Ok(())
    }
}

/// Read checkpoint metadata from a published checkpoint directory.
pub fn load_checkpoint_meta(path: &Path) -> Result<CheckpointMeta> {
    let metadata_json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read checkpoint metadata {}", path.display()))?;
    let meta: CheckpointMeta =
        serde_json::from_str(&metadata_json).context("Failed to parse checkpoint metadata")?;
    Ok(meta)
}
