// TraitLm - trainable decoder-only backbone
//
// A small causal transformer over a VarMap, so the same weights are loadable
// (varmap.load), trainable (AdamW over all vars) and savable (safetensors).
// Works purely on token ids; text handling lives in LocalBackbone.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{
    embedding, layer_norm, linear, AdamW, Embedding, LayerNorm, Linear, Optimizer, ParamsAdamW,
    VarBuilder, VarMap,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;

use super::backbone::DecodeConfig;

/// Backbone architecture parameters. Stored as model.json next to the
/// weights so a checkpoint is self-describing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LmConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub max_seq_len: usize,
    /// Token separating source text from the target linearization.
    pub sep_token: String,
    /// End-of-sequence token.
    pub eos_token: String,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            vocab_size: 8192,
            hidden_dim: 256,
            num_layers: 4,
            num_heads: 4,
            max_seq_len: 512,
            sep_token: "<sep>".to_string(),
            eos_token: "</s>".to_string(),
        }
    }
}

impl LmConfig {
    /// Tiny configuration for fast CPU tests.
    pub fn small() -> Self {
        Self {
            vocab_size: 64,
            hidden_dim: 32,
            num_layers: 1,
            num_heads: 2,
            max_seq_len: 32,
            ..Self::default()
        }
    }
}

/// Decoder-only language model for linearization generation.
pub struct TraitLm {
    config: LmConfig,
    tok_embedding: Embedding,
    pos_embedding: Embedding,
    blocks: Vec<Block>,
    ln_out: LayerNorm,
    lm_head: Linear,
    device: Device,
    varmap: VarMap,
    optimizer: Option<(AdamW, f64)>,
}

impl TraitLm {
    /// Build with randomly initialized weights.
    pub fn new(config: LmConfig, device: Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let tok_embedding = embedding(config.vocab_size, config.hidden_dim, vb.pp("tok_emb"))?;
        let pos_embedding = embedding(config.max_seq_len, config.hidden_dim, vb.pp("pos_emb"))?;

        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            blocks.push(Block::new(&config, vb.pp(format!("block_{i}")))?);
        }

        let ln_out = layer_norm(config.hidden_dim, 1e-5, vb.pp("ln_out"))?;
        let lm_head = linear(config.hidden_dim, config.vocab_size, vb.pp("lm_head"))?;

        Ok(Self {
            config,
            tok_embedding,
            pos_embedding,
            blocks,
            ln_out,
            lm_head,
            device,
            varmap,
            optimizer: None,
        })
    }

    pub fn config(&self) -> &LmConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Overwrite the randomly initialized weights from a safetensors file.
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        self.varmap.load(path)?;
        Ok(())
    }

    pub fn save_weights(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Forward pass: (batch, seq) token ids to (batch, seq, vocab) logits.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;

        let positions = Tensor::arange(0u32, seq_len as u32, &self.device)?.unsqueeze(0)?;
        let pos = self.pos_embedding.forward(&positions)?;
        let mut hidden = self.tok_embedding.forward(input_ids)?.broadcast_add(&pos)?;

        for block in &self.blocks {
            hidden = block.forward(&hidden)?;
        }

        let hidden = self.ln_out.forward(&hidden)?;
        Ok(self.lm_head.forward(&hidden)?)
    }

    /// One optimizer step over a batch of (sequence, target_start) pairs.
    ///
    /// Loss is token-level cross-entropy over the target region only, i.e.
    /// positions from `target_start` on; the source prefix conditions but is
    /// not scored. Sequences must fit `max_seq_len`; callers filter oversize
    /// sequences rather than have target tokens silently cut here. Returns
    /// the mean loss across the batch.
    pub fn train_step(&mut self, batch: &[(Vec<u32>, usize)], learning_rate: f64) -> Result<f32> {
        self.ensure_optimizer(learning_rate)?;

        let mut losses = Vec::new();
        for (sequence, target_start) in batch {
            let len = sequence.len();
            if len > self.config.max_seq_len {
                anyhow::bail!(
                    "Sequence of {len} tokens exceeds the model's {}-token capacity",
                    self.config.max_seq_len
                );
            }
            let target_start = *target_start;
            if target_start == 0 || target_start >= len {
                continue;
            }

            let input = Tensor::new(&sequence[..len - 1], &self.device)?.unsqueeze(0)?;
            let logits = self.forward(&input)?.i(0)?;

            // Position i predicts token i+1; score only the target tokens.
            let rows = logits.narrow(0, target_start - 1, len - target_start)?;
            let targets = Tensor::new(&sequence[target_start..], &self.device)?;
            losses.push(candle_nn::loss::cross_entropy(&rows, &targets)?);
        }

        if losses.is_empty() {
            anyhow::bail!("Training batch contained no scorable sequences");
        }

        let loss = Tensor::stack(&losses, 0)?.mean_all()?;
        let (optimizer, _) = self.optimizer.as_mut().expect("optimizer initialized above");
        optimizer.backward_step(&loss)?;

        Ok(loss.to_scalar::<f32>()?)
    }

    /// Generate continuations of `prefix`, ranked best-first.
    ///
    /// Greedy decoding is the width-1 case of the beam loop, so both paths
    /// share the deterministic expansion order: expansions are scored by
    /// log-probability with ties broken by token id, and hypotheses keep
    /// their insertion order on equal scores (stable sort).
    pub fn generate(
        &self,
        prefix: &[u32],
        decode: &DecodeConfig,
        eos_id: u32,
    ) -> Result<Vec<(Vec<u32>, f32)>> {
        let width = decode.width();
        let mut beams = vec![Hypothesis { ids: Vec::new(), score: 0.0, done: false }];

        for _ in 0..decode.max_new_tokens {
            if beams.iter().all(|b| b.done) {
                break;
            }

            let mut expanded: Vec<Hypothesis> = Vec::with_capacity(beams.len() * width);
            for beam in &beams {
                if beam.done {
                    expanded.push(beam.clone());
                    continue;
                }

                let mut sequence = prefix.to_vec();
                sequence.extend_from_slice(&beam.ids);
                if sequence.len() >= self.config.max_seq_len {
                    let mut finished = beam.clone();
                    finished.done = true;
                    expanded.push(finished);
                    continue;
                }

                let logprobs = self.next_token_logprobs(&sequence)?;
                for (token, logprob) in top_k(&logprobs, width) {
                    let mut next = beam.clone();
                    next.score += logprob;
                    if token == eos_id {
                        next.done = true;
                    } else {
                        next.ids.push(token);
                    }
                    expanded.push(next);
                }
            }

            sort_by_score(&mut expanded);
            expanded.truncate(width);
            beams = expanded;
        }

        sort_by_score(&mut beams);
        Ok(beams.into_iter().map(|b| (b.ids, b.score)).collect())
    }

    fn next_token_logprobs(&self, sequence: &[u32]) -> Result<Vec<f32>> {
        let input = Tensor::new(sequence, &self.device)?.unsqueeze(0)?;
        let logits = self.forward(&input)?;
        let last = logits.i((0, sequence.len() - 1))?;
        let logprobs = candle_nn::ops::log_softmax(&last, D::Minus1)?;
        Ok(logprobs.to_vec1::<f32>()?)
    }

    fn ensure_optimizer(&mut self, learning_rate: f64) -> Result<()> {
        let stale = match &self.optimizer {
            Some((_, lr)) => *lr != learning_rate,
            None => true,
        };
        if stale {
            let params = ParamsAdamW { lr: learning_rate, ..Default::default() };
            self.optimizer = Some((AdamW::new(self.varmap.all_vars(), params)?, learning_rate));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Hypothesis {
    ids: Vec<u32>,
    score: f32,
    done: bool,
}

fn sort_by_score(beams: &mut [Hypothesis]) {
    // Stable: equal scores keep insertion order.
    beams.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}

/// Indices of the `k` largest values, ordered by value descending with
/// token-id ascending on ties.
fn top_k(values: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indices: Vec<usize> = (0..values.len()).collect();
    indices.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });
    indices
        .into_iter()
        .take(k)
        .map(|i| (i as u32, values[i]))
        .collect()
}

/// Transformer block: causal self-attention and MLP, residual + post-norm.
struct Block {
    attn: CausalSelfAttention,
    mlp: Mlp,
    ln1: LayerNorm,
    ln2: LayerNorm,
}

impl Block {
    fn new(config: &LmConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attn: CausalSelfAttention::new(config, vb.pp("attn"))?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
            ln1: layer_norm(config.hidden_dim, 1e-5, vb.pp("ln1"))?,
            ln2: layer_norm(config.hidden_dim, 1e-5, vb.pp("ln2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let attn_out = self.attn.forward(x)?;
        let x = self.ln1.forward(&(x + attn_out)?)?;
        let mlp_out = self.mlp.forward(&x)?;
        Ok(self.ln2.forward(&(&x + mlp_out)?)?)
    }
}

struct CausalSelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl CausalSelfAttention {
    fn new(config: &LmConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.hidden_dim;
        if dim % config.num_heads != 0 {
            anyhow::bail!(
                "hidden_dim {dim} is not divisible by num_heads {}",
                config.num_heads
            );
        }
        let head_dim = dim / config.num_heads;
        Ok(Self {
            q_proj: linear(dim, dim, vb.pp("q"))?,
            k_proj: linear(dim, dim, vb.pp("k"))?,
            v_proj: linear(dim, dim, vb.pp("v"))?,
            o_proj: linear(dim, dim, vb.pp("o"))?,
            num_heads: config.num_heads,
            scale: (head_dim as f64).sqrt(),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, dim) = x.dims3()?;
        let head_dim = dim / self.num_heads;
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, self.num_heads, head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };

        let q = split(self.q_proj.forward(x)?)?;
        let k = split(self.k_proj.forward(x)?)?;
        let v = split(self.v_proj.forward(x)?)?;

        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? / self.scale)?;
        let mask = causal_mask(seq_len, scores.device())?;
        let scores = scores.broadcast_add(&mask)?;

        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, dim))?;
        Ok(self.o_proj.forward(&out)?)
    }
}

struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(config: &LmConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_dim * 4;
        Ok(Self {
            fc1: linear(config.hidden_dim, hidden, vb.pp("fc1"))?,
            fc2: linear(hidden, config.hidden_dim, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.fc1.forward(x)?.gelu()?;
        Ok(self.fc2.forward(&x)?)
    }
}

/// Additive mask preventing attention to future positions.
fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0.0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            data[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    Ok(Tensor::from_vec(data, (seq_len, seq_len), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecodeStrategy;

    fn decode_config(strategy: DecodeStrategy, beam_width: usize) -> DecodeConfig {
        DecodeConfig { strategy, beam_width, max_new_tokens: 8 }
    }

    #[test]
    fn test_forward_shape() -> Result<()> {
        let config = LmConfig::small();
        let lm = TraitLm::new(config.clone(), Device::Cpu)?;

        let input = Tensor::zeros((1, 10), DType::U32, &Device::Cpu)?;
        let logits = lm.forward(&input)?;
        assert_eq!(logits.dims(), &[1, 10, config.vocab_size]);
        Ok(())
    }

    #[test]
    fn test_greedy_generation_is_deterministic() -> Result<()> {
        let lm = TraitLm::new(LmConfig::small(), Device::Cpu)?;
        let decode = decode_config(DecodeStrategy::Greedy, 1);

        let prefix = [3u32, 7, 11];
        let first = lm.generate(&prefix, &decode, 2)?;
        let second = lm.generate(&prefix, &decode, 2)?;
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        Ok(())
    }

    #[test]
    fn test_beam_returns_ranked_width_candidates() -> Result<()> {
        let lm = TraitLm::new(LmConfig::small(), Device::Cpu)?;
        let decode = decode_config(DecodeStrategy::Beam, 3);

        let candidates = lm.generate(&[5u32, 9], &decode, 2)?;
        assert_eq!(candidates.len(), 3);
        for pair in candidates.windows(2) {
            assert!(pair[0].1 >= pair[1].1, "candidates must be ranked best-first");
        }
        Ok(())
    }

    #[test]
    fn test_train_step_overfits_single_sequence() -> Result<()> {
        let mut lm = TraitLm::new(LmConfig::small(), Device::Cpu)?;

        // Source [4, 5], separator 1, target [6, 7], eos 2.
        let batch = vec![(vec![4u32, 5, 1, 6, 7, 2], 3usize)];

        let first = lm.train_step(&batch, 1e-2)?;
        assert!(first.is_finite());

        let mut last = first;
        for _ in 0..20 {
            last = lm.train_step(&batch, 1e-2)?;
        }
        assert!(last.is_finite());
        assert!(
            last <= first * 1.1,
            "loss should trend down: {first} -> {last}"
        );
        Ok(())
    }

    #[test]
    fn test_train_step_rejects_over_capacity_sequence() {
        let mut lm = TraitLm::new(LmConfig::small(), Device::Cpu).unwrap();
        let long: Vec<u32> = (0..40).map(|i| i % 8).collect();
        let err = lm.train_step(&[(long, 3)], 1e-2).err().expect("must reject");
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn test_train_step_rejects_unscorable_batch() {
        let mut lm = TraitLm::new(LmConfig::small(), Device::Cpu).unwrap();
        // target_start beyond the sequence: nothing to score.
        let batch = vec![(vec![4u32, 5], 5usize)];
        assert!(lm.train_step(&batch, 1e-2).is_err());
    }

    #[test]
    fn test_top_k_breaks_ties_by_token_id() {
        let values = [0.5f32, 0.9, 0.9, 0.1];
        let top = top_k(&values, 3);
        assert_eq!(top[0].0, 1);
        assert_eq!(top[1].0, 2);
        assert_eq!(top[2].0, 0);
    }
}
