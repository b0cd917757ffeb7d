// Async extraction facade
//
// Owns a checkpoint-loaded inference engine behind a tokio mutex and runs
// the candle forward passes on the blocking pool, so async callers never
// stall the runtime on model compute.

use anyhow::{Context, Result};
use candle_core::Device;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::ExtractError;
use crate::models::LocalBackbone;
use crate::schema::{Codec, Schema, TraitRecord};
use crate::training::{load_checkpoint_meta, CheckpointMeta};

use super::engine::InferenceEngine;

pub struct Extractor {
    engine: Arc<Mutex<InferenceEngine<LocalBackbone>>>,
    meta: CheckpointMeta,
}

impl Extractor {
    /// Load an extractor from a published checkpoint directory.
    ///
    /// The checkpoint must have been trained against the active schema
    /// version; decoding settings come from the checkpoint's own
    /// hyperparameters.
    pub fn load(checkpoint_dir: &Path, schema: Schema, device: Device) -> Result<Self> {
        let meta = load_checkpoint_meta(&checkpoint_dir.join("checkpoint.json"))
            .with_context(|| format!("Failed to load checkpoint {}", checkpoint_dir.display()))?;
        meta.check_schema(&schema.version)?;

        let backbone = LocalBackbone::load(checkpoint_dir, device)?;
        if meta.hyperparameters.max_seq_len > backbone.lm_config().max_seq_len {
            return Err(crate::errors::ConfigError::Invalid {
                key: "max_seq_len",
                reason: format!(
                    "checkpoint hyperparameters allow {} tokens but the model supports {}",
                    meta.hyperparameters.max_seq_len,
                    backbone.lm_config().max_seq_len
                ),
            }
            .into());
        }
        let engine = InferenceEngine::new(backbone, Codec::new(schema), &meta.hyperparameters);

        tracing::info!(
            checkpoint_id = %meta.id,
            epoch = meta.epoch,
            schema_version = %meta.schema_version,
            "Loaded extractor"
        );

        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
            meta,
        })
    }

    pub fn meta(&self) -> &CheckpointMeta {
        &self.meta
    }

    /// Extract trait records from one input text.
    pub async fn extract(&self, text: &str) -> Result<Vec<TraitRecord>, ExtractError> {
        let engine = Arc::clone(&self.engine);
        let text = text.to_string();

        tokio::task::spawn_blocking(move || {
            let mut engine = engine.blocking_lock();
            engine.extract(&text)
        })
        .await
        .map_err(|e| ExtractError::Backbone(format!("extraction task failed: {e}")))?
    }
}
