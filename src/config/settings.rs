// Hyperparameter configuration
//
// Loaded once at process start and passed by reference; never mutated during
// a run. Unknown keys are a configuration error, missing keys fall back to
// the defaults below.

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Decoding strategy for inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecodeStrategy {
    #[default]
    Greedy,
    Beam,
}

/// What to do with a source text longer than `max_seq_len` tokens at dataset
/// build time. Inference never truncates; this only applies to training rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    /// Keep the longest clean token prefix and the gold records it still
    /// covers.
    #[default]
    Truncate,
    /// Skip the row entirely.
    Drop,
}

/// Hyperparameters for training and inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HyperParams {
    /// Directory holding the backbone to start from (model.json,
    /// tokenizer.json, optional model.safetensors).
    #[serde(default = "default_backbone")]
    pub backbone: String,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum source length in backbone tokens, for both training rows and
    /// inference inputs.
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,

    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default)]
    pub decode_strategy: DecodeStrategy,

    #[serde(default = "default_beam_width")]
    pub beam_width: usize,

    /// Generation budget for one linearization.
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Checkpoint every N epochs; the final epoch always checkpoints.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,

    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,

    /// Seed for the per-epoch example shuffle.
    #[serde(default = "default_shuffle_seed")]
    pub shuffle_seed: u64,

    #[serde(default)]
    pub oversize_policy: OversizePolicy,
}

fn default_backbone() -> String {
    "models/base".to_string()
}
fn default_learning_rate() -> f64 {
    5e-5
}
fn default_batch_size() -> usize {
    8
}
fn default_max_seq_len() -> usize {
    256
}
fn default_epochs() -> usize {
    3
}
fn default_beam_width() -> usize {
    4
}
fn default_max_new_tokens() -> usize {
    128
}
fn default_checkpoint_every() -> usize {
    1
}
fn default_max_checkpoints() -> usize {
    5
}
fn default_shuffle_seed() -> u64 {
    42
}

impl Default for HyperParams {
    fn default() -> Self {
        // An empty TOML document deserializes to all defaults.
        toml::from_str("").expect("defaults must deserialize")
    }
}

impl HyperParams {
    /// Validate value ranges. Run once at load time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(invalid("learning_rate", "must be a positive finite number"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be greater than zero"));
        }
        if self.max_seq_len == 0 {
            return Err(invalid("max_seq_len", "must be greater than zero"));
        }
        if self.epochs == 0 {
            return Err(invalid("epochs", "must be greater than zero"));
        }
        if self.beam_width == 0 {
            return Err(invalid("beam_width", "must be at least 1"));
        }
        if self.max_new_tokens == 0 {
            return Err(invalid("max_new_tokens", "must be greater than zero"));
        }
        if self.checkpoint_every == 0 {
            return Err(invalid("checkpoint_every", "must be at least 1"));
        }
        if self.max_checkpoints == 0 {
            return Err(invalid("max_checkpoints", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid { key, reason: reason.to_string() }
}
