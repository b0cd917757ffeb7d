// Local backbone: TraitLm plus its tokenizer
//
// Binds the id-level model to a `tokenizers` tokenizer loaded from the model
// directory and implements the string-level Backbone contract. Directory
// layout (shared by base models and checkpoints):
//   dir/
//     model.json          (LmConfig)
//     tokenizer.json
//     model.safetensors   (optional for a fresh base; required for checkpoints)

use anyhow::{Context, Result};
use candle_core::Device;
use std::path::Path;
use tokenizers::Tokenizer;

use crate::dataset::TrainingExample;

use super::backbone::{Backbone, Candidate, DecodeConfig, TokenCounter};
use super::trait_lm::{LmConfig, TraitLm};

pub struct LocalBackbone {
    lm: TraitLm,
    tokenizer: Tokenizer,
    sep_id: u32,
    eos_id: u32,
}

impl LocalBackbone {
    /// Couple a model and tokenizer, verifying they fit together.
    pub fn new(lm: TraitLm, tokenizer: Tokenizer) -> Result<Self> {
        let vocab = tokenizer.get_vocab_size(true);
        if vocab > lm.config().vocab_size {
            anyhow::bail!(
                "Tokenizer vocabulary ({vocab}) exceeds model vocabulary ({})",
                lm.config().vocab_size
            );
        }

        // Falling back to an arbitrary id would alias an ordinary word as a
        // control token and corrupt every sequence built from it.
        let sep_id = tokenizer.token_to_id(&lm.config().sep_token).ok_or_else(|| {
            anyhow::anyhow!("Tokenizer has no `{}` separator token", lm.config().sep_token)
        })?;
        let eos_id = tokenizer.token_to_id(&lm.config().eos_token).ok_or_else(|| {
            anyhow::anyhow!(
                "Tokenizer has no `{}` end-of-sequence token",
                lm.config().eos_token
            )
        })?;

        Ok(Self { lm, tokenizer, sep_id, eos_id })
    }

    /// Load a backbone from a model directory.
    pub fn load(dir: &Path, device: Device) -> Result<Self> {
        let config_path = dir.join("model.json");
        let config: LmConfig = serde_json::from_str(
            &std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?,
        )
        .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let tokenizer_path = dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            anyhow::anyhow!("Failed to load tokenizer from {}: {e}", tokenizer_path.display())
        })?;

        let mut lm = TraitLm::new(config, device)?;
        let weights_path = dir.join("model.safetensors");
        if weights_path.exists() {
            lm.load_weights(&weights_path)
                .with_context(|| format!("Failed to load weights from {}", weights_path.display()))?;
            tracing::info!(dir = %dir.display(), "Loaded backbone weights");
        } else {
            tracing::info!(dir = %dir.display(), "No weights found, starting from random init");
        }

        Self::new(lm, tokenizer)
    }

    pub fn lm_config(&self) -> &LmConfig {
        self.lm.config()
    }

    fn encode_ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl TokenCounter for LocalBackbone {
    fn count_tokens(&self, text: &str) -> Result<usize> {
        Ok(self.encode_ids(text)?.len())
    }

    fn truncate_to(&self, text: &str, max_tokens: usize) -> Result<String> {
        if max_tokens == 0 {
            return Ok(String::new());
        }
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {e}"))?;
        let offsets = encoding.get_offsets();
        if offsets.len() <= max_tokens {
            return Ok(text.to_string());
        }
        let end = offsets[max_tokens - 1].1;
        Ok(text[..end].to_string())
    }
}

impl Backbone for LocalBackbone {
    fn generate(&mut self, prompt: &str, decode: &DecodeConfig) -> Result<Vec<Candidate>> {
        let mut prefix = self.encode_ids(prompt)?;
        prefix.push(self.sep_id);

        let hypotheses = self.lm.generate(&prefix, decode, self.eos_id)?;

        let mut candidates = Vec::with_capacity(hypotheses.len());
        for (ids, score) in hypotheses {
            let text = self
                .tokenizer
                .decode(&ids, true)
                .map_err(|e| anyhow::anyhow!("Detokenization failed: {e}"))?;
            candidates.push(Candidate { text, score });
        }
        Ok(candidates)
    }

    fn train_batch(&mut self, batch: &[TrainingExample], learning_rate: f64) -> Result<f32> {
        let capacity = self.lm.config().max_seq_len;
        let mut sequences = Vec::with_capacity(batch.len());
        let mut oversize = 0usize;
        for example in batch {
            let source = self.encode_ids(&example.source)?;
            let target = self.encode_ids(&example.target)?;

            let mut sequence = source;
            sequence.push(self.sep_id);
            let target_start = sequence.len();
            sequence.extend_from_slice(&target);
            sequence.push(self.eos_id);

            // Chopping would silently drop gold target tokens; skip the
            // sequence whole and report it instead.
            if sequence.len() > capacity {
                oversize += 1;
                continue;
            }
            sequences.push((sequence, target_start));
        }

        if oversize > 0 {
            tracing::warn!(
                skipped = oversize,
                capacity = capacity,
                "Skipped training sequences exceeding model capacity"
            );
        }
        if sequences.is_empty() {
            anyhow::bail!(
                "Every sequence in the batch exceeds the {capacity}-token model capacity"
            );
        }
        self.lm.train_step(&sequences, learning_rate)
    }

    fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create model directory {}", dir.display()))?;

        let config_path = dir.join("model.json");
        std::fs::write(&config_path, serde_json::to_string_pretty(self.lm.config())?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        self.lm.save_weights(&dir.join("model.safetensors"))?;

        self.tokenizer
            .save(dir.join("tokenizer.json"), false)
            .map_err(|e| anyhow::anyhow!("Failed to save tokenizer: {e}"))?;

        Ok(())
    }
}
