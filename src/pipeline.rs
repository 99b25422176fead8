//! End-to-end inference pipeline.
//!
//! Orchestrates text-to-image generation with the sampler unrolled by hand
//! so every denoising step is observable:
//! 1. Tokenize and encode `[negative, prompt]` with CLIP
//! 2. Draw seeded latent noise `[1, 4, H/8, W/8]`, scale by `init_noise_sigma`
//! 3. For each timestep: duplicate latents, UNet noise prediction,
//!    classifier-free guidance, scheduler step
//! 4. Decode latents through the VAE, either after every step (streaming)
//!    or once at the end

use std::ops::ControlFlow;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::{
    StableDiffusionConfig, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
};
use image::RgbImage;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::config::{
    DEFAULT_GUIDANCE_SCALE, DEFAULT_SEED, DEFAULT_STEPS, ModelConfig, SchedulerKind,
};
use crate::model::ModelFiles;
use crate::model::text::PromptEncoder;
use crate::scheduler::{self, Scheduler, SchedulerConfig};
use crate::{Error, Result, vae};

/// UNet latent channels for v1.x checkpoints.
const LATENT_CHANNELS: usize = 4;

/// Upper bound on requested steps (one per training timestep).
const MAX_STEPS: usize = 1000;

/// Parameters for one generation.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub prompt: String,
    /// Unconditional prompt for guidance. `None` = empty string.
    pub negative_prompt: Option<String>,
    pub num_steps: usize,
    pub guidance_scale: f64,
    pub seed: u64,
    pub scheduler: SchedulerKind,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: None,
            num_steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            seed: DEFAULT_SEED,
            scheduler: SchedulerKind::default(),
        }
    }
}

impl GenerationParams {
    pub fn new(prompt: impl Into<String>, negative_prompt: Option<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_steps == 0 || self.num_steps > MAX_STEPS {
            return Err(Error::Config(format!(
                "num_steps must be between 1 and {MAX_STEPS}, got {}",
                self.num_steps
            )));
        }
        if !self.guidance_scale.is_finite() {
            return Err(Error::Config(format!(
                "guidance_scale must be finite, got {}",
                self.guidance_scale
            )));
        }
        Ok(())
    }
}

/// Final output of a generation.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub image: RgbImage,
    /// Number of denoising steps that ran.
    pub steps: usize,
    pub seed: u64,
}

/// One intermediate frame, decoded right after scheduler step `step`.
#[derive(Debug, Clone)]
pub struct StepFrame {
    /// 1-based.
    pub step: usize,
    pub total_steps: usize,
    pub image: RgbImage,
}

/// Per-step observer. Returning `Break` stops the loop with [`Error::Cancelled`].
pub type StepCallback<'a> = &'a mut dyn FnMut(StepFrame) -> ControlFlow<()>;

/// Something that turns [`GenerationParams`] into images.
///
/// The generation manager only talks to this trait, so it can own any
/// backend: the real [`DiffusionPipeline`] or a test double.
pub trait ImageGenerator: Send {
    /// Device the generator's weights live on.
    fn device(&self) -> &Device;

    /// Run one generation. With `on_step`, every step is decoded and handed
    /// to the callback; without it only the final latents are decoded.
    fn generate(
        &mut self,
        params: &GenerationParams,
        on_step: Option<StepCallback<'_>>,
    ) -> Result<GeneratedImage>;
}

/// Noise prediction for a `[uncond, cond]` latent batch.
pub trait NoisePredictor {
    fn predict_noise(
        &self,
        latents: &Tensor,
        timestep: f64,
        text_embeddings: &Tensor,
    ) -> Result<Tensor>;
}

impl NoisePredictor for UNet2DConditionModel {
    fn predict_noise(
        &self,
        latents: &Tensor,
        timestep: f64,
        text_embeddings: &Tensor,
    ) -> Result<Tensor> {
        Ok(self.forward(latents, timestep, text_embeddings)?)
    }
}

/// Turns latents into a viewable frame.
pub trait FrameDecoder {
    fn decode_frame(&self, latents: &Tensor) -> Result<RgbImage>;
}

/// The checkpoint's VAE decoder with its latent scale.
pub struct VaeDecoder {
    vae: AutoEncoderKL,
    scaling_factor: f64,
}

impl FrameDecoder for VaeDecoder {
    fn decode_frame(&self, latents: &Tensor) -> Result<RgbImage> {
        let decoded = vae::decode_latents(&self.vae, latents, self.scaling_factor)?;
        vae::tensor_to_image(&decoded)
    }
}

/// Stable Diffusion v1.5 with weights resident on one device.
pub struct DiffusionPipeline {
    model_config: ModelConfig,
    scheduler_config: SchedulerConfig,
    text: PromptEncoder,
    unet: UNet2DConditionModel,
    decoder: VaeDecoder,
    device: Device,
    dtype: DType,
}

impl DiffusionPipeline {
    /// Resolve weights (downloading on first use) and load every component.
    pub fn load(model_config: &ModelConfig, device: &Device, dtype: DType) -> Result<Self> {
        let files = ModelFiles::fetch(model_config, dtype == DType::F16)?;
        Self::load_from_files(model_config, &files, device, dtype)
    }

    /// Load from already-resolved files.
    pub fn load_from_files(
        model_config: &ModelConfig,
        files: &ModelFiles,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        model_config.validate()?;
        let t0 = Instant::now();

        let sd_config = StableDiffusionConfig::v1_5(
            model_config.sliced_attention_size,
            Some(model_config.height),
            Some(model_config.width),
        );

        let text = PromptEncoder::load(
            &files.tokenizer,
            &files.text_encoder,
            &sd_config.clip,
            model_config.max_token_len,
            &model_config.pad_token,
            device,
        )?;
        let unet = sd_config
            .build_unet(
                &files.unet,
                device,
                LATENT_CHANNELS,
                model_config.use_flash_attn,
                dtype,
            )
            .map_err(|e| Error::WeightLoad(format!("unet: {e}")))?;
        let vae = sd_config
            .build_vae(&files.vae, device, dtype)
            .map_err(|e| Error::WeightLoad(format!("vae: {e}")))?;

        tracing::info!(
            device = ?device,
            ?dtype,
            elapsed_s = t0.elapsed().as_secs_f64(),
            "pipeline loaded"
        );

        Ok(Self {
            model_config: model_config.clone(),
            scheduler_config: SchedulerConfig::default(),
            text,
            unet,
            decoder: VaeDecoder {
                vae,
                scaling_factor: model_config.vae_scaling_factor,
            },
            device: device.clone(),
            dtype,
        })
    }

    /// Override the scheduler configuration (e.g. from `scheduler_config.json`).
    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    /// Run the sampler and decode only the final latents.
    pub fn generate(&mut self, params: &GenerationParams) -> Result<GeneratedImage> {
        self.generate_with_progress(params, None)
    }

    /// Run the unrolled sampler.
    pub fn generate_with_progress(
        &mut self,
        params: &GenerationParams,
        on_step: Option<StepCallback<'_>>,
    ) -> Result<GeneratedImage> {
        params.validate()?;
        let mut scheduler =
            scheduler::build(params.scheduler, self.scheduler_config.clone(), params.num_steps);

        // Text embeddings [uncond, cond]
        let text_embeddings = self
            .text
            .encode_for_guidance(&params.prompt, params.negative_prompt.as_deref())?
            .to_dtype(self.dtype)?;

        // Initial latents
        let (latent_h, latent_w) = self.model_config.latent_size();
        let noise = seeded_noise(params.seed, (1, LATENT_CHANNELS, latent_h, latent_w), &self.device)?;
        let latents = (noise * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        denoise(
            &self.unet,
            &self.decoder,
            scheduler.as_mut(),
            &text_embeddings,
            latents,
            params,
            on_step,
        )
    }
}

/// The denoising loop over prepared latents and `[uncond, cond]` embeddings.
///
/// Runs the first `params.num_steps` scheduler timesteps, so the UNet is
/// evaluated exactly that many times even when the schedule is longer. With
/// `on_step`, every step is decoded and the last frame doubles as the final
/// image; without it the latents are decoded once at the end.
pub fn denoise(
    unet: &impl NoisePredictor,
    decoder: &impl FrameDecoder,
    scheduler: &mut dyn Scheduler,
    text_embeddings: &Tensor,
    mut latents: Tensor,
    params: &GenerationParams,
    mut on_step: Option<StepCallback<'_>>,
) -> Result<GeneratedImage> {
    let t_total = Instant::now();
    let total_steps = params.num_steps;
    let timesteps: Vec<f64> = scheduler.timesteps().iter().copied().take(total_steps).collect();
    tracing::info!(
        scheduler = params.scheduler.as_str(),
        steps = timesteps.len(),
        "beginning inference loop"
    );

    let mut last_frame: Option<RgbImage> = None;
    for (step_index, &timestep) in timesteps.iter().enumerate() {
        let t_step = Instant::now();

        let latent_model_input = Tensor::cat(&[&latents, &latents], 0)?;
        let latent_model_input = scheduler.scale_model_input(latent_model_input, step_index)?;

        let noise_pred = unet.predict_noise(&latent_model_input, timestep, text_embeddings)?;
        let noise_pred = apply_guidance(&noise_pred, params.guidance_scale)?;

        latents = scheduler.step(&noise_pred, &latents, step_index)?;

        if let Some(callback) = on_step.as_mut() {
            let image = decoder.decode_frame(&latents)?;
            last_frame = Some(image.clone());
            let frame = StepFrame {
                step: step_index + 1,
                total_steps,
                image,
            };
            if callback(frame).is_break() {
                tracing::info!(step = step_index + 1, "generation cancelled by consumer");
                return Err(Error::Cancelled);
            }
        }

        tracing::debug!(
            step = step_index + 1,
            total_steps,
            timestep,
            elapsed_ms = t_step.elapsed().as_millis() as u64,
            "denoising step"
        );
    }

    let image = match last_frame {
        Some(image) => image,
        None => decoder.decode_frame(&latents)?,
    };

    tracing::info!(
        steps = timesteps.len(),
        elapsed_s = t_total.elapsed().as_secs_f64(),
        "generation finished"
    );

    Ok(GeneratedImage {
        image,
        steps: timesteps.len(),
        seed: params.seed,
    })
}

impl ImageGenerator for DiffusionPipeline {
    fn device(&self) -> &Device {
        &self.device
    }

    fn generate(
        &mut self,
        params: &GenerationParams,
        on_step: Option<StepCallback<'_>>,
    ) -> Result<GeneratedImage> {
        self.generate_with_progress(params, on_step)
    }
}

/// Classifier-free guidance over a `[uncond, cond]` batch:
/// `uncond + scale · (cond - uncond)`.
pub fn apply_guidance(noise_pred: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    let chunks = noise_pred.chunk(2, 0)?;
    let (uncond, cond) = match chunks.as_slice() {
        [uncond, cond] => (uncond, cond),
        _ => {
            return Err(Error::Config(format!(
                "guidance expects a batch of 2, got {:?}",
                noise_pred.dims()
            )));
        }
    };
    let guided = (uncond + ((cond - uncond)? * guidance_scale)?)?;
    Ok(guided)
}

/// Standard-normal noise from a seeded ChaCha8 stream.
///
/// Drawn on the host so the same seed yields the same latents on every device.
pub fn seeded_noise(
    seed: u64,
    shape: (usize, usize, usize, usize),
    device: &Device,
) -> Result<Tensor> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let len = shape.0 * shape.1 * shape.2 * shape.3;
    let data: Vec<f32> = (0..len).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Weight-free generator used by the manager and server tests.
#[cfg(test)]
pub(crate) mod stub {
    use super::*;
    use image::Rgb;

    #[derive(Debug, Clone)]
    pub(crate) enum StubFailure {
        /// Fail before the first step.
        Immediately(String),
        /// Fail right after the first frame has been handed out.
        AfterFirstStep(String),
    }

    /// Emits flat grey frames that brighten with every step.
    pub(crate) struct StubGenerator {
        pub device: Device,
        pub size: u32,
        pub failure: Option<StubFailure>,
    }

    impl StubGenerator {
        pub(crate) fn new() -> Self {
            Self {
                device: Device::Cpu,
                size: 8,
                failure: None,
            }
        }

        pub(crate) fn failing(failure: StubFailure) -> Self {
            Self {
                failure: Some(failure),
                ..Self::new()
            }
        }
    }

    impl ImageGenerator for StubGenerator {
        fn device(&self) -> &Device {
            &self.device
        }

        fn generate(
            &mut self,
            params: &GenerationParams,
            mut on_step: Option<StepCallback<'_>>,
        ) -> Result<GeneratedImage> {
            params.validate()?;
            if let Some(StubFailure::Immediately(msg)) = &self.failure {
                return Err(Error::Manager(msg.clone()));
            }

            let total_steps = params.num_steps;
            for step in 1..=total_steps {
                let shade = (step * 255 / total_steps) as u8;
                let image = RgbImage::from_pixel(self.size, self.size, Rgb([shade; 3]));
                if let Some(callback) = on_step.as_mut() {
                    let frame = StepFrame {
                        step,
                        total_steps,
                        image,
                    };
                    if callback(frame).is_break() {
                        return Err(Error::Cancelled);
                    }
                }
                if step == 1
                    && let Some(StubFailure::AfterFirstStep(msg)) = &self.failure
                {
                    return Err(Error::Manager(msg.clone()));
                }
            }

            Ok(GeneratedImage {
                image: RgbImage::from_pixel(self.size, self.size, Rgb([255; 3])),
                steps: total_steps,
                seed: params.seed,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[test]
    fn test_default_params() {
        let params = GenerationParams::default();
        assert_eq!(params.num_steps, 15);
        assert!((params.guidance_scale - 7.5).abs() < 1e-12);
        assert_eq!(params.seed, 42);
        assert_eq!(params.scheduler, SchedulerKind::Pndm);
        assert!(params.negative_prompt.is_none());
        params.validate().unwrap();
    }

    #[test]
    fn test_validate_steps() {
        let mut params = GenerationParams::new("a castle", None);
        params.num_steps = 0;
        assert!(params.validate().is_err());
        params.num_steps = 1001;
        assert!(params.validate().is_err());
        params.num_steps = 1;
        params.validate().unwrap();
        params.guidance_scale = f64::NAN;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_guidance_blend() {
        let device = Device::Cpu;
        let uncond = Tensor::full(1.0f32, (1, 4, 2, 2), &device).unwrap();
        let cond = Tensor::full(3.0f32, (1, 4, 2, 2), &device).unwrap();
        let batch = Tensor::cat(&[&uncond, &cond], 0).unwrap();

        let guided = apply_guidance(&batch, 7.5).unwrap();
        assert_eq!(guided.dims(), &[1, 4, 2, 2]);
        // 1 + 7.5 * (3 - 1) = 16
        let value: f32 = guided.mean_all().unwrap().to_scalar().unwrap();
        assert!((value - 16.0).abs() < 1e-5, "got {value}");

        // Scale 1 returns the conditional prediction.
        let plain: f32 = apply_guidance(&batch, 1.0)
            .unwrap()
            .mean_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((plain - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_guidance_rejects_single_batch() {
        let device = Device::Cpu;
        let single = Tensor::zeros((1, 4, 2, 2), DType::F32, &device).unwrap();
        assert!(apply_guidance(&single, 7.5).is_err());
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let device = Device::Cpu;
        let a = seeded_noise(42, (1, 4, 8, 8), &device).unwrap();
        let b = seeded_noise(42, (1, 4, 8, 8), &device).unwrap();
        let c = seeded_noise(43, (1, 4, 8, 8), &device).unwrap();

        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let c = c.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_seeded_noise_statistics() {
        let device = Device::Cpu;
        let noise = seeded_noise(7, (1, 4, 64, 64), &device).unwrap();
        let mean: f32 = noise.mean_all().unwrap().to_scalar().unwrap();
        let var: f32 = noise.sqr().unwrap().mean_all().unwrap().to_scalar().unwrap();
        assert!(mean.abs() < 0.05, "mean = {mean}");
        assert!((var - 1.0).abs() < 0.05, "var = {var}");
    }

    /// Predicts zero noise and records the timesteps it was called with.
    #[derive(Default)]
    struct RecordingUnet {
        timesteps: RefCell<Vec<f64>>,
    }

    impl NoisePredictor for RecordingUnet {
        fn predict_noise(
            &self,
            latents: &Tensor,
            timestep: f64,
            text_embeddings: &Tensor,
        ) -> Result<Tensor> {
            assert_eq!(latents.dim(0).unwrap(), 2, "expected a [uncond, cond] batch");
            assert_eq!(text_embeddings.dim(0).unwrap(), 2);
            self.timesteps.borrow_mut().push(timestep);
            Ok(latents.zeros_like()?)
        }
    }

    /// Each decode yields a flat frame whose value is the decode count.
    #[derive(Default)]
    struct CountingDecoder {
        calls: Cell<u8>,
    }

    impl FrameDecoder for CountingDecoder {
        fn decode_frame(&self, _latents: &Tensor) -> Result<RgbImage> {
            self.calls.set(self.calls.get() + 1);
            Ok(RgbImage::from_pixel(2, 2, image::Rgb([self.calls.get(); 3])))
        }
    }

    fn run_loop(
        kind: SchedulerKind,
        num_steps: usize,
        on_step: Option<StepCallback<'_>>,
    ) -> (Result<GeneratedImage>, RecordingUnet, CountingDecoder, Vec<f64>) {
        let device = Device::Cpu;
        let params = GenerationParams {
            num_steps,
            scheduler: kind,
            ..GenerationParams::new("a castle in the clouds", None)
        };
        let mut scheduler = scheduler::build(kind, SchedulerConfig::default(), num_steps);
        let schedule = scheduler.timesteps().to_vec();
        let embeddings = Tensor::zeros((2, 3, 8), DType::F32, &device).unwrap();
        let latents = Tensor::ones((1, LATENT_CHANNELS, 2, 2), DType::F32, &device).unwrap();

        let unet = RecordingUnet::default();
        let decoder = CountingDecoder::default();
        let result = denoise(
            &unet,
            &decoder,
            scheduler.as_mut(),
            &embeddings,
            latents,
            &params,
            on_step,
        );
        (result, unet, decoder, schedule)
    }

    #[test]
    fn test_plms_loop_runs_requested_steps() {
        let mut frames = Vec::new();
        let mut collect = |frame: StepFrame| {
            frames.push(frame);
            ControlFlow::Continue(())
        };
        let callback: StepCallback<'_> = &mut collect;
        let (result, unet, decoder, schedule) = run_loop(SchedulerKind::Pndm, 15, Some(callback));
        let generated = result.unwrap();

        // The PLMS schedule repeats a warm-up timestep; only the first 15 run.
        assert_eq!(schedule.len(), 16);
        assert_eq!(*unet.timesteps.borrow(), schedule[..15].to_vec());
        assert_eq!(generated.steps, 15);
        assert_eq!(generated.seed, 42);

        assert_eq!(frames.len(), 15);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.step, i + 1);
            assert_eq!(frame.total_steps, 15);
        }
        // The final image is the last frame, not an extra decode.
        assert_eq!(decoder.calls.get(), 15);
        assert_eq!(generated.image, frames[14].image);
    }

    #[test]
    fn test_loop_without_observer_decodes_once() {
        let (result, unet, decoder, _) = run_loop(SchedulerKind::Pndm, 15, None);
        let generated = result.unwrap();
        assert_eq!(unet.timesteps.borrow().len(), 15);
        assert_eq!(decoder.calls.get(), 1);
        assert_eq!(generated.image.get_pixel(0, 0).0, [1, 1, 1]);
    }

    #[test]
    fn test_loop_break_cancels_at_that_step() {
        let mut seen = Vec::new();
        let mut stop_at_three = |frame: StepFrame| {
            seen.push(frame.step);
            if frame.step == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };
        let callback: StepCallback<'_> = &mut stop_at_three;
        let (result, unet, decoder, _) = run_loop(SchedulerKind::Pndm, 15, Some(callback));

        assert!(matches!(result, Err(Error::Cancelled)), "got {:?}", result.map(|g| g.steps));
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(unet.timesteps.borrow().len(), 3);
        assert_eq!(decoder.calls.get(), 3);
    }

    #[test]
    fn test_every_scheduler_runs_requested_steps() {
        for kind in [SchedulerKind::Pndm, SchedulerKind::Ddim, SchedulerKind::Euler] {
            for steps in [1, 4, 15] {
                let (result, unet, _, _) = run_loop(kind, steps, None);
                let generated = result.unwrap();
                assert_eq!(generated.steps, steps, "{kind:?}");
                assert_eq!(unet.timesteps.borrow().len(), steps, "{kind:?} with {steps} steps");
            }
        }
    }
}
