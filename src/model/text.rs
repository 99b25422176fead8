//! CLIP text encoder wrapper.
//!
//! Prompts are tokenized to exactly `max_token_len` ids (truncating while
//! keeping the end-of-text token, then padding) and run through the CLIP
//! text transformer. For classifier-free guidance the unconditional
//! embedding (negative prompt, or the empty string) is stacked *before* the
//! conditional one: `[uncond, cond]` along the batch axis.

use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{self, clip};
use tokenizers::Tokenizer;

use crate::{Error, Result};

/// Tokenizer + CLIP text transformer.
pub struct PromptEncoder {
    tokenizer: Tokenizer,
    clip: clip::ClipTextTransformer,
    max_len: usize,
    pad_id: u32,
    device: Device,
}

impl PromptEncoder {
    /// Load the tokenizer and CLIP weights. CLIP runs in f32; embeddings are
    /// cast to the pipeline dtype by the caller.
    pub fn load(
        tokenizer_path: &std::path::Path,
        clip_weights: &std::path::Path,
        clip_config: &clip::Config,
        max_len: usize,
        pad_token: &str,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path)?;
        let pad_id = tokenizer.token_to_id(pad_token).ok_or_else(|| {
            Error::Config(format!("pad token {pad_token:?} not in tokenizer vocabulary"))
        })?;
        let clip = stable_diffusion::build_clip_transformer(
            clip_config,
            clip_weights,
            device,
            DType::F32,
        )
        .map_err(|e| Error::WeightLoad(format!("text encoder: {e}")))?;

        Ok(Self {
            tokenizer,
            clip,
            max_len,
            pad_id,
            device: device.clone(),
        })
    }

    /// Token ids for `text`, fitted to the context length.
    pub fn token_ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.tokenizer.encode(text, true)?;
        Ok(fit_to_context(
            encoding.get_ids().to_vec(),
            self.max_len,
            self.pad_id,
        ))
    }

    /// Encode one prompt → `[1, max_len, hidden]`.
    pub fn encode(&self, text: &str) -> Result<Tensor> {
        let ids = self.token_ids(text)?;
        let tokens = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip.forward(&tokens)?)
    }

    /// Guidance embeddings `[uncond, cond]` → `[2, max_len, hidden]`.
    pub fn encode_for_guidance(&self, prompt: &str, negative_prompt: Option<&str>) -> Result<Tensor> {
        let cond = self.encode(prompt)?;
        let uncond = self.encode(negative_prompt.unwrap_or(""))?;
        Ok(Tensor::cat(&[uncond, cond], 0)?)
    }
}

/// Truncate or pad `ids` to exactly `max_len`.
///
/// Over-long sequences keep their final token (end-of-text) in the last slot.
pub fn fit_to_context(mut ids: Vec<u32>, max_len: usize, pad_id: u32) -> Vec<u32> {
    if ids.len() > max_len {
        let last = ids[ids.len() - 1];
        ids.truncate(max_len.saturating_sub(1));
        ids.push(last);
    }
    ids.resize(max_len, pad_id);
    ids
}
