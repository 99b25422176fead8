//! Latent → pixel decoding and frame encoding.
//!
//! The VAE itself is `candle_transformers`' `AutoEncoderKL`; this module
//! handles the latent scaling on the way in and the conversion of the
//! decoded `[-1, 1]` tensor into an 8-bit RGB frame on the way out.

use std::io::Cursor;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use candle_core::{DType, Tensor};
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use image::{ImageFormat, RgbImage};

use crate::{Error, Result};

/// Decode latents `[B, 4, h, w]` into images `[B, 3, 8h, 8w]` in `[-1, 1]`.
pub fn decode_latents(vae: &AutoEncoderKL, latents: &Tensor, scaling_factor: f64) -> Result<Tensor> {
    let scaled = (latents / scaling_factor)?;
    Ok(vae.decode(&scaled)?)
}

/// Convert a decoded image `[1, 3, H, W]` (or `[3, H, W]`) to an RGB frame.
///
/// `(x / 2 + 0.5).clamp(0, 1) · 255`, rounded.
pub fn tensor_to_image(image: &Tensor) -> Result<RgbImage> {
    let image = match image.rank() {
        4 => image.get(0)?,
        3 => image.clone(),
        rank => {
            return Err(Error::Image(format!(
                "expected a [1, 3, H, W] or [3, H, W] tensor, got rank {rank}"
            )));
        }
    };

    let image = ((image.to_dtype(DType::F32)? / 2.0)? + 0.5)?.clamp(0f32, 1f32)?;
    let image = (image * 255.0)?.round()?.to_dtype(DType::U8)?;

    let (channels, height, width) = image.dims3()?;
    if channels != 3 {
        return Err(Error::Image(format!("expected 3 channels, got {channels}")));
    }

    // CHW → HWC
    let pixels = image.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| Error::Image("pixel buffer does not match frame size".to_string()))
}

/// Encode a frame as PNG bytes.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// Encode a frame as base64 PNG (no data-URL prefix).
pub fn png_base64(image: &RgbImage) -> Result<String> {
    Ok(to_base64(&encode_png(image)?))
}

/// Standard base64 of already-encoded bytes.
pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Inverse of [`to_base64`].
pub fn from_base64(b64: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(b64)
        .map_err(|e| Error::Image(format!("invalid base64 payload: {e}")))
}

/// `data:image/png;base64,<b64>`
pub fn png_data_url(b64: &str) -> String {
    format!("data:image/png;base64,{b64}")
}
