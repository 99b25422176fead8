//! Stable Diffusion v1.5 over HTTP, with per-step frame streaming.
//!
//! A candle-based text-to-image service. The sampler is unrolled by hand so
//! that every denoising step can be decoded and pushed to the client as a
//! server-sent event while the image forms.
//!
//! ## Architecture
//!
//! ```text
//! prompt ──→ CLIP text encoder ──→ [uncond, cond] embeddings
//!                                        ↓
//! seeded noise ──→ UNet + guidance + scheduler step (× steps)
//!                                        ↓ every step
//!                                  VAE decode ──→ PNG ──→ SSE `step`
//!                                        ↓ last step
//!                             saved to disk ──→ SSE `complete`
//! ```
//!
//! ## Modules
//!
//! - [`scheduler`] — PNDM (PLMS), DDIM and Euler discrete schedulers
//! - [`model`] — weight resolution and the CLIP prompt encoder
//! - [`vae`] — latent decoding and frame encoding
//! - [`pipeline`] — the unrolled denoising loop
//! - [`manager`] — resident pipeline worker with OOM fallback
//! - [`storage`] — output directory for finished images
//! - [`streaming`] — SSE event payloads and client-side decoding
//! - [`server`] — axum router for the gesture and generation APIs
//! - [`gestures`] — gesture → prompt table

pub mod config;
pub mod gestures;
pub mod manager;
pub mod model;
pub mod pipeline;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod streaming;
pub mod vae;

mod error;

pub use error::{Error, Result};
