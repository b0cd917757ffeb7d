// Inference engine
//
// Synchronous extraction path: length guard, candidate generation, candidate
// selection. Inference never truncates input; an oversized text is the
// caller's problem to split.

use crate::config::HyperParams;
use crate::errors::ExtractError;
use crate::models::{Backbone, DecodeConfig};
use crate::schema::{Codec, TraitRecord};

use super::validate::select_extraction;

pub struct InferenceEngine<B: Backbone> {
    backbone: B,
    codec: Codec,
    decode: DecodeConfig,
    max_seq_len: usize,
}

impl<B: Backbone> InferenceEngine<B> {
    pub fn new(backbone: B, codec: Codec, params: &HyperParams) -> Self {
        Self {
            backbone,
            codec,
            decode: DecodeConfig::from_params(params),
            max_seq_len: params.max_seq_len,
        }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Extract trait records from one input text.
    pub fn extract(&mut self, text: &str) -> Result<Vec<TraitRecord>, ExtractError> {
        let tokens = self
            .backbone
            .count_tokens(text)
            .map_err(|e| ExtractError::Backbone(format!("{e:#}")))?;
        if tokens > self.max_seq_len {
            return Err(ExtractError::InputTooLong { tokens, max: self.max_seq_len });
        }

        let candidates = self
            .backbone
            .generate(text, &self.decode)
            .map_err(|e| ExtractError::Backbone(format!("{e:#}")))?;

        tracing::debug!(
            tokens = tokens,
            candidates = candidates.len(),
            "Generated linearization candidates"
        );

        select_extraction(&self.codec, &candidates).ok_or(ExtractError::NoValidExtraction)
    }
}
