// Error taxonomy for the extraction pipeline
//
// Configuration problems are fatal and surface immediately; data problems are
// skipped and counted; decode problems are handled by validation/repair and
// only reach the caller as NoValidExtraction.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal configuration problems. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to read config file {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error(
        "checkpoint was trained against schema `{checkpoint}` but the active schema is `{active}`"
    )]
    SchemaVersionMismatch { checkpoint: String, active: String },
}

/// Fatal training-run failures. Recoverable per-row problems are counted in
/// `BuildStats` instead of raised here.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("loss diverged at epoch {epoch}, step {step}: {loss}")]
    Diverged { epoch: usize, step: usize, loss: f32 },

    #[error("run finished but no checkpoint could be persisted")]
    NoCheckpointPersisted,

    #[error("no usable training examples after dataset build")]
    EmptyDataset,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("backbone failure: {0}")]
    Backbone(String),
}

/// Per-request inference failures.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("input is {tokens} tokens, over the {max} token limit")]
    InputTooLong { tokens: usize, max: usize },

    #[error("no decode candidate produced a valid linearization")]
    NoValidExtraction,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("backbone failure: {0}")]
    Backbone(String),
}

impl From<anyhow::Error> for TrainError {
    fn from(err: anyhow::Error) -> Self {
        TrainError::Backbone(format!("{err:#}"))
    }
}

impl From<anyhow::Error> for ExtractError {
    fn from(err: anyhow::Error) -> Self {
        ExtractError::Backbone(format!("{err:#}"))
    }
}
