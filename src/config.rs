//! Configuration for the Stable Diffusion v1.5 pipeline and the HTTP service.
//!
//! Model defaults match the diffusers `StableDiffusionPipeline` checkpoint
//! layout; sampling defaults match what the service has always used
//! (15 steps, guidance 7.5, seed 42).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Number of denoising steps per generation.
pub const DEFAULT_STEPS: usize = 15;

/// Classifier-free guidance scale.
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;

/// Seed for the initial latent noise.
pub const DEFAULT_SEED: u64 = 42;

/// Shortest SSE keep-alive interval; shorter ones flood idle streams with comments.
pub const MIN_KEEP_ALIVE_MS: u64 = 1_000;

/// Environment variable gating image generation.
pub const FEATURE_ENV: &str = "FEATURE2_ENABLED";

/// Which noise scheduler drives the denoising loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// PLMS variant of PNDM, shipped with the v1.5 checkpoint.
    #[default]
    Pndm,
    /// Deterministic DDIM (eta = 0).
    Ddim,
    /// Euler discrete in sigma space.
    Euler,
}

impl SchedulerKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "pndm" | "plms" => Some(Self::Pndm),
            "ddim" => Some(Self::Ddim),
            "euler" => Some(Self::Euler),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pndm => "pndm",
            Self::Ddim => "ddim",
            Self::Euler => "euler",
        }
    }
}

/// Model checkpoint location and geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// HuggingFace repo holding `unet/`, `vae/` and `text_encoder/`.
    pub repo: String,
    /// Read weights from this directory (same layout as the repo) instead of the hub.
    pub local_dir: Option<PathBuf>,
    /// Repo holding a `tokenizer.json` compatible with the CLIP text encoder.
    pub tokenizer_repo: String,
    pub tokenizer_file: String,
    pub height: usize,
    pub width: usize,
    /// CLIP context length; prompts are truncated/padded to this.
    pub max_token_len: usize,
    pub pad_token: String,
    pub vae_scaling_factor: f64,
    /// Load fp16 weights when running on an accelerator.
    pub use_f16: bool,
    pub sliced_attention_size: Option<usize>,
    pub use_flash_attn: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            repo: "stable-diffusion-v1-5/stable-diffusion-v1-5".to_string(),
            local_dir: None,
            tokenizer_repo: "openai/clip-vit-base-patch32".to_string(),
            tokenizer_file: "tokenizer.json".to_string(),
            height: 512,
            width: 512,
            max_token_len: 77,
            pad_token: "<|endoftext|>".to_string(),
            vae_scaling_factor: 0.18215,
            use_f16: true,
            sliced_attention_size: None,
            use_flash_attn: false,
        }
    }
}

/// A weight-bearing component of the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    TextEncoder,
    Unet,
    Vae,
}

impl ModelConfig {
    /// Latent spatial size: the VAE downsamples by 8.
    pub fn latent_size(&self) -> (usize, usize) {
        (self.height / 8, self.width / 8)
    }

    /// Path of a component's safetensors file inside the repo.
    pub fn weight_file(&self, component: Component, f16: bool) -> String {
        let variant = if f16 { ".fp16" } else { "" };
        match component {
            Component::TextEncoder => format!("text_encoder/model{variant}.safetensors"),
            Component::Unet => format!("unet/diffusion_pytorch_model{variant}.safetensors"),
            Component::Vae => format!("vae/diffusion_pytorch_model{variant}.safetensors"),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.height % 8 != 0 || self.width % 8 != 0 {
            return Err(crate::Error::Config(format!(
                "image size must be a multiple of 8, got {}x{}",
                self.width, self.height
            )));
        }
        if self.max_token_len < 2 {
            return Err(crate::Error::Config(
                "max_token_len must leave room for BOS and EOS".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which API surface the server exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiVariant {
    /// Gesture echo only, with strict payload validation.
    Old,
    /// Gesture echo plus single-shot and streamed image generation.
    #[default]
    New,
}

/// HTTP service configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Where final images are written and served from under `/images`.
    pub output_dir: PathBuf,
    pub image_generation_enabled: bool,
    pub variant: ApiVariant,
    pub sse_keep_alive_ms: u64,
    /// `None` allows any origin.
    pub allowed_origins: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            output_dir: PathBuf::from("generated_images"),
            image_generation_enabled: true,
            variant: ApiVariant::New,
            sse_keep_alive_ms: 15_000,
            allowed_origins: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.sse_keep_alive_ms < MIN_KEEP_ALIVE_MS {
            return Err(crate::Error::Config(format!(
                "SSE keep-alive interval must be at least {MIN_KEEP_ALIVE_MS} ms, got {}",
                self.sse_keep_alive_ms
            )));
        }
        Ok(())
    }
}

/// Interpret the feature toggle. Unset means enabled; otherwise only a
/// case-insensitive `"true"` enables it.
pub fn feature_enabled(value: Option<&str>) -> bool {
    value.map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_model_config() {
        let cfg = ModelConfig::default();
        assert_eq!(cfg.latent_size(), (64, 64));
        assert_eq!(cfg.max_token_len, 77);
        assert!((cfg.vae_scaling_factor - 0.18215).abs() < 1e-12);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_weight_files() {
        let cfg = ModelConfig::default();
        assert_eq!(
            cfg.weight_file(Component::Unet, true),
            "unet/diffusion_pytorch_model.fp16.safetensors"
        );
        assert_eq!(
            cfg.weight_file(Component::Vae, false),
            "vae/diffusion_pytorch_model.safetensors"
        );
        assert_eq!(
            cfg.weight_file(Component::TextEncoder, false),
            "text_encoder/model.safetensors"
        );
    }

    #[test]
    fn test_validate_rejects_odd_sizes() {
        let cfg = ModelConfig {
            height: 500,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_scheduler_kind_parse() {
        assert_eq!(SchedulerKind::parse("PNDM"), Some(SchedulerKind::Pndm));
        assert_eq!(SchedulerKind::parse("plms"), Some(SchedulerKind::Pndm));
        assert_eq!(SchedulerKind::parse("ddim"), Some(SchedulerKind::Ddim));
        assert_eq!(SchedulerKind::parse("euler"), Some(SchedulerKind::Euler));
        assert_eq!(SchedulerKind::parse("heun"), None);
        assert_eq!(SchedulerKind::default(), SchedulerKind::Pndm);
    }

    #[test]
    fn test_feature_toggle() {
        assert!(feature_enabled(None));
        assert!(feature_enabled(Some("true")));
        assert!(feature_enabled(Some("TRUE")));
        assert!(!feature_enabled(Some("false")));
        assert!(!feature_enabled(Some("1")));
        assert!(!feature_enabled(Some("")));
    }

    #[test]
    fn test_server_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.output_dir, PathBuf::from("generated_images"));
        assert_eq!(cfg.variant, ApiVariant::New);
        assert!(cfg.image_generation_enabled);
        assert!(cfg.allowed_origins.is_none());
    }

    #[test]
    fn test_server_config_keep_alive_floor() {
        let mut cfg = ServerConfig::default();
        cfg.validate().unwrap();
        cfg.sse_keep_alive_ms = 0;
        assert!(cfg.validate().is_err());
        cfg.sse_keep_alive_ms = MIN_KEEP_ALIVE_MS - 1;
        assert!(cfg.validate().is_err());
        cfg.sse_keep_alive_ms = MIN_KEEP_ALIVE_MS;
        cfg.validate().unwrap();
    }
}
