//! Model components for Stable Diffusion v1.5.
//!
//! ## Components
//!
//! - [`text`] — CLIP tokenizer + text transformer producing guidance embeddings
//! - UNet and VAE come from `candle_transformers::models::stable_diffusion`
//!   and are built in [`crate::pipeline`]
//!
//! [`ModelFiles`] resolves the safetensors and tokenizer files, either from a
//! local checkpoint directory or from the HuggingFace Hub cache.

pub mod text;

use std::path::PathBuf;

use hf_hub::api::sync::Api;

use crate::config::{Component, ModelConfig};
use crate::{Error, Result};

/// On-disk locations of everything the pipeline needs.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub tokenizer: PathBuf,
    pub text_encoder: PathBuf,
    pub unet: PathBuf,
    pub vae: PathBuf,
}

impl ModelFiles {
    /// Resolve all files, downloading from the hub on first use.
    ///
    /// `f16` selects the `.fp16` weight variants. The text encoder always
    /// runs in f32, so its full-precision file is used regardless.
    pub fn fetch(cfg: &ModelConfig, f16: bool) -> Result<Self> {
        if let Some(dir) = &cfg.local_dir {
            return Self::from_dir(dir.clone(), cfg, f16);
        }

        let api = Api::new()?;
        let repo = api.model(cfg.repo.clone());
        let tokenizer_repo = api.model(cfg.tokenizer_repo.clone());

        tracing::info!(repo = %cfg.repo, f16, "resolving Stable Diffusion weights");
        let files = Self {
            tokenizer: tokenizer_repo.get(&cfg.tokenizer_file)?,
            text_encoder: repo.get(&cfg.weight_file(Component::TextEncoder, false))?,
            unet: repo.get(&cfg.weight_file(Component::Unet, f16))?,
            vae: repo.get(&cfg.weight_file(Component::Vae, f16))?,
        };
        tracing::debug!(?files, "weights resolved");
        Ok(files)
    }

    /// Resolve files from a local checkpoint laid out like the hub repo.
    ///
    /// The tokenizer is looked up at the directory root, then under
    /// `tokenizer/`.
    pub fn from_dir(dir: PathBuf, cfg: &ModelConfig, f16: bool) -> Result<Self> {
        let existing = |path: PathBuf| -> Result<PathBuf> {
            if path.is_file() {
                Ok(path)
            } else {
                Err(Error::WeightLoad(format!("missing file {}", path.display())))
            }
        };

        let tokenizer = {
            let root = dir.join(&cfg.tokenizer_file);
            if root.is_file() {
                root
            } else {
                existing(dir.join("tokenizer").join(&cfg.tokenizer_file))?
            }
        };

        Ok(Self {
            tokenizer,
            text_encoder: existing(dir.join(cfg.weight_file(Component::TextEncoder, false)))?,
            unet: existing(dir.join(cfg.weight_file(Component::Unet, f16)))?,
            vae: existing(dir.join(cfg.weight_file(Component::Vae, f16)))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &std::path::Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_from_dir_resolves_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ModelConfig::default();
        touch(&dir.path().join("tokenizer/tokenizer.json"));
        touch(&dir.path().join("text_encoder/model.safetensors"));
        touch(&dir.path().join("unet/diffusion_pytorch_model.fp16.safetensors"));
        touch(&dir.path().join("vae/diffusion_pytorch_model.fp16.safetensors"));

        let files = ModelFiles::from_dir(dir.path().to_path_buf(), &cfg, true).unwrap();
        assert!(files.tokenizer.ends_with("tokenizer/tokenizer.json"));
        assert!(files.unet.ends_with("unet/diffusion_pytorch_model.fp16.safetensors"));
    }

    #[test]
    fn test_from_dir_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ModelConfig::default();
        touch(&dir.path().join("tokenizer.json"));
        touch(&dir.path().join("text_encoder/model.safetensors"));

        let err = ModelFiles::from_dir(dir.path().to_path_buf(), &cfg, false).unwrap_err();
        assert!(err.to_string().contains("unet"), "unexpected error: {err}");
    }
}
