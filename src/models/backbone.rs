// Backbone abstraction
//
// The pipeline treats the generative model as an opaque capability: count
// tokens, generate candidates conditioned on a prompt, train on batches,
// persist weights. Everything schema-aware lives outside this boundary.

use anyhow::Result;
use std::path::Path;

use crate::config::{DecodeStrategy, HyperParams};
use crate::dataset::TrainingExample;

/// Token accounting against the backbone's own tokenizer.
pub trait TokenCounter {
    fn count_tokens(&self, text: &str) -> Result<usize>;

    /// Longest clean character prefix of `text` spanning at most
    /// `max_tokens` tokens.
    fn truncate_to(&self, text: &str, max_tokens: usize) -> Result<String>;
}

/// One decoded linearization candidate, ranked best-first by `score`
/// (sum of token log-probabilities).
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub text: String,
    pub score: f32,
}

/// Decoding controls. Explicit configuration, never hardcoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeConfig {
    pub strategy: DecodeStrategy,
    pub beam_width: usize,
    pub max_new_tokens: usize,
}

impl DecodeConfig {
    pub fn from_params(params: &HyperParams) -> Self {
        Self {
            strategy: params.decode_strategy,
            beam_width: params.beam_width,
            max_new_tokens: params.max_new_tokens,
        }
    }

    /// Number of hypotheses the decoder tracks.
    pub fn width(&self) -> usize {
        match self.strategy {
            DecodeStrategy::Greedy => 1,
            DecodeStrategy::Beam => self.beam_width,
        }
    }
}

/// The generative backbone, as seen by the training and inference engines.
///
/// Greedy generation must be bit-reproducible for a fixed checkpoint and
/// input; beam search must break ties by stable candidate insertion order.
pub trait Backbone: TokenCounter + Send {
    /// Generate ranked linearization candidates for a prompt.
    fn generate(&mut self, prompt: &str, decode: &DecodeConfig) -> Result<Vec<Candidate>>;

    /// Train on one batch, returning the mean token-level loss.
    fn train_batch(&mut self, batch: &[TrainingExample], learning_rate: f64) -> Result<f32>;

    /// Persist weights, tokenizer and model config into `dir`.
    fn save(&self, dir: &Path) -> Result<()>;
}
