//! One-shot local text-to-image generation.
//!
//! Loads the pipeline in-process (no server), runs the unrolled sampler and
//! writes the final PNG. With `--frames-dir` every intermediate step is
//! decoded and written as well.
//!
//! # Output
//!
//! Prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"path":"castle.png","steps":15,"seed":42,"elapsed_s":12.3}
//! ```

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use sd_stream::{
    config::{ModelConfig, SchedulerKind},
    manager::{pipeline_dtype, preferred_device},
    pipeline::{DiffusionPipeline, GenerationParams, StepCallback, StepFrame},
    scheduler::SchedulerConfig,
    vae,
};

#[derive(Parser, Debug)]
#[command(
    name = "sd-generate",
    about = "Stable Diffusion v1.5 text-to-image generation",
    long_about = "Generate an image from a text prompt.\n\
                  Downloads the model weights from HuggingFace on first run.\n\
                  Output is written to --output; a JSON summary line is printed to stdout."
)]
struct Args {
    #[arg(long, short = 'p')]
    prompt: String,

    #[arg(long, short = 'n')]
    negative_prompt: Option<String>,

    /// Output PNG path.
    #[arg(long, short = 'o', default_value = "output.png")]
    output: PathBuf,

    /// Write every intermediate frame here as step_NN.png.
    #[arg(long)]
    frames_dir: Option<PathBuf>,

    #[arg(long, default_value_t = sd_stream::config::DEFAULT_STEPS)]
    steps: usize,

    #[arg(long, default_value_t = sd_stream::config::DEFAULT_GUIDANCE_SCALE)]
    guidance_scale: f64,

    #[arg(long, short = 's', default_value_t = sd_stream::config::DEFAULT_SEED)]
    seed: u64,

    /// Noise scheduler: pndm, ddim or euler.
    #[arg(long, default_value = "pndm")]
    scheduler: String,

    /// diffusers `scheduler_config.json` overriding the default betas.
    #[arg(long)]
    scheduler_config: Option<PathBuf>,

    /// Run on CPU even when an accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Use f16 on accelerators.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    f16: bool,

    #[arg(long)]
    model_repo: Option<String>,

    /// Local checkpoint directory laid out like the repo.
    #[arg(long)]
    model_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let Some(scheduler) = SchedulerKind::parse(&args.scheduler) else {
        anyhow::bail!("unknown scheduler '{}'. Use pndm, ddim or euler", args.scheduler);
    };

    let params = GenerationParams {
        prompt: args.prompt.clone(),
        negative_prompt: args.negative_prompt.clone(),
        num_steps: args.steps,
        guidance_scale: args.guidance_scale,
        seed: args.seed,
        scheduler,
    };
    params.validate()?;

    // Ensure output directories exist
    if let Some(parent) = args.output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    if let Some(dir) = &args.frames_dir {
        std::fs::create_dir_all(dir)?;
    }

    let mut model = ModelConfig {
        use_f16: args.f16,
        local_dir: args.model_dir.clone(),
        ..ModelConfig::default()
    };
    if let Some(repo) = &args.model_repo {
        model.repo = repo.clone();
    }

    let device = if args.cpu {
        candle_core::Device::Cpu
    } else {
        preferred_device(0)
    };
    let dtype = pipeline_dtype(&device, args.f16);
    tracing::info!("Using device: {:?} ({:?})", device, dtype);

    let mut pipeline = DiffusionPipeline::load(&model, &device, dtype)
        .map_err(|e| anyhow::anyhow!("failed to load pipeline: {e}"))?;
    if let Some(path) = &args.scheduler_config {
        let config = SchedulerConfig::from_json_file(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        pipeline = pipeline.with_scheduler_config(config);
    }

    tracing::info!(steps = params.num_steps, scheduler = scheduler.as_str(), "generating");
    let t0 = Instant::now();

    let generated = match &args.frames_dir {
        Some(dir) => {
            let mut write_error: Option<anyhow::Error> = None;
            let mut on_step = |frame: StepFrame| match write_frame(dir, &frame) {
                Ok(()) => ControlFlow::Continue(()),
                Err(e) => {
                    write_error = Some(e);
                    ControlFlow::Break(())
                }
            };
            let callback: StepCallback<'_> = &mut on_step;
            let result = pipeline.generate_with_progress(&params, Some(callback));
            if let Some(e) = write_error {
                return Err(e);
            }
            result
        }
        None => pipeline.generate(&params),
    }
    .map_err(|e| anyhow::anyhow!("generation failed: {e}"))?;

    let png = vae::encode_png(&generated.image)?;
    std::fs::write(&args.output, png)
        .with_context(|| format!("failed to write {}", args.output.display()))?;

    // Print machine-readable summary to stdout for the caller
    println!(
        "{}",
        serde_json::json!({
            "path": args.output,
            "steps": generated.steps,
            "seed": generated.seed,
            "elapsed_s": t0.elapsed().as_secs_f64(),
        })
    );

    Ok(())
}

fn write_frame(dir: &Path, frame: &StepFrame) -> anyhow::Result<()> {
    let path = dir.join(format!("step_{:02}.png", frame.step));
    std::fs::write(&path, vae::encode_png(&frame.image)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!("step {}/{} → {}", frame.step, frame.total_steps, path.display());
    Ok(())
}
