//! Stable Diffusion HTTP server with per-step SSE streaming.
//!
//! Keeps the pipeline resident across requests (loaded on the first
//! generation unless `--preload`). Weights are downloaded from HuggingFace
//! on first use.
//!
//! # Endpoints
//!
//! - `POST /api/recognize` — gesture echo
//! - `POST /api/generate` — one image, inline and saved under `/images`
//! - `GET  /api/generate-stream?prompt=...` — one SSE `step` event per
//!   denoising step, then `complete`
//! - `GET  /images/<file>.png`, `GET /health`, `GET /favicon.ico`
//!
//! With `--legacy` only the strict gesture echo is served.
//!
//! # Example (shell)
//!
//! ```sh
//! FEATURE2_ENABLED=true sd-stream-server --port 8000 --steps 15
//! curl -N 'http://localhost:8000/api/generate-stream?prompt=a%20castle'
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use sd_stream::{
    config::{ApiVariant, FEATURE_ENV, ModelConfig, SchedulerKind, ServerConfig, feature_enabled},
    manager::{GenerationManager, ManagerConfig},
    pipeline::GenerationParams,
    scheduler::SchedulerConfig,
    server::{AppState, Backend, RouterBuilder},
    storage::ImageStore,
};

#[derive(Parser, Debug)]
#[command(
    name = "sd-stream-server",
    about = "Stable Diffusion v1.5 over HTTP with per-step frame streaming"
)]
struct Args {
    /// Address to bind.
    #[arg(long, env = "SD_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "SD_PORT", default_value_t = 8000)]
    port: u16,

    /// Directory finished images are written to and served from.
    #[arg(long, env = "SD_OUTPUT_DIR", default_value = "generated_images")]
    output_dir: PathBuf,

    /// Serve only the strict gesture echo API.
    #[arg(long)]
    legacy: bool,

    /// Image generation toggle; anything but "true" (any case) disables it.
    #[arg(long = "feature2-enabled", env = FEATURE_ENV)]
    feature2_enabled: Option<String>,

    /// Load the pipeline at startup instead of on the first request.
    #[arg(long, env = "SD_PRELOAD")]
    preload: bool,

    /// CUDA device ordinal (0 = first GPU).
    #[arg(long, env = "SD_DEVICE", default_value_t = 0)]
    device: usize,

    /// Run on CPU even when an accelerator is available.
    #[arg(long, env = "SD_CPU")]
    cpu: bool,

    /// Use f16 weights and activations on accelerators.
    #[arg(long, env = "SD_F16", default_value_t = true, action = clap::ArgAction::Set)]
    f16: bool,

    /// Noise scheduler: pndm, ddim or euler.
    #[arg(long, env = "SD_SCHEDULER", default_value = "pndm", value_parser = parse_scheduler)]
    scheduler: SchedulerKind,

    /// diffusers `scheduler_config.json` overriding the default betas.
    #[arg(long, env = "SD_SCHEDULER_CONFIG")]
    scheduler_config: Option<PathBuf>,

    /// Denoising steps per image.
    #[arg(long, env = "SD_STEPS", default_value_t = sd_stream::config::DEFAULT_STEPS)]
    steps: usize,

    #[arg(long, env = "SD_GUIDANCE_SCALE", default_value_t = sd_stream::config::DEFAULT_GUIDANCE_SCALE)]
    guidance_scale: f64,

    /// Seed for the initial latent noise.
    #[arg(long, env = "SD_SEED", default_value_t = sd_stream::config::DEFAULT_SEED)]
    seed: u64,

    /// HuggingFace repo with `unet/`, `vae/` and `text_encoder/`.
    #[arg(long, env = "SD_MODEL_REPO")]
    model_repo: Option<String>,

    /// Local checkpoint directory laid out like the repo (skips the hub).
    #[arg(long, env = "SD_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    /// Allowed CORS origin; repeat for several. Default: any origin.
    #[arg(long = "allowed-origin", env = "SD_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Interval between SSE keep-alive comments (at least 1000).
    #[arg(long, env = "SD_KEEP_ALIVE_MS", default_value_t = 15_000)]
    keep_alive_ms: u64,
}

fn parse_scheduler(name: &str) -> Result<SchedulerKind, String> {
    SchedulerKind::parse(name).ok_or_else(|| format!("unknown scheduler '{name}' (pndm, ddim, euler)"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let variant = if args.legacy { ApiVariant::Old } else { ApiVariant::New };
    let server_config = ServerConfig {
        host: args.host.clone(),
        port: args.port,
        output_dir: args.output_dir.clone(),
        image_generation_enabled: feature_enabled(args.feature2_enabled.as_deref()),
        variant,
        sse_keep_alive_ms: args.keep_alive_ms,
        allowed_origins: (!args.allowed_origins.is_empty()).then(|| args.allowed_origins.clone()),
    };
    server_config.validate()?;

    let mut state = AppState::new(server_config.clone());

    if variant == ApiVariant::New {
        let mut model = ModelConfig {
            use_f16: args.f16,
            local_dir: args.model_dir.clone(),
            ..ModelConfig::default()
        };
        if let Some(repo) = &args.model_repo {
            model.repo = repo.clone();
        }
        model.validate()?;

        let scheduler = args
            .scheduler_config
            .as_ref()
            .map(|path| {
                SchedulerConfig::from_json_file(path)
                    .with_context(|| format!("failed to read {}", path.display()))
            })
            .transpose()?;

        let defaults = GenerationParams {
            num_steps: args.steps,
            guidance_scale: args.guidance_scale,
            seed: args.seed,
            scheduler: args.scheduler,
            ..GenerationParams::default()
        };
        defaults.validate()?;

        let store = ImageStore::create(&server_config.output_dir)
            .with_context(|| format!("failed to create {}", server_config.output_dir.display()))?;

        let manager_config = ManagerConfig {
            cuda_device: args.device,
            force_cpu: args.cpu,
            use_f16: args.f16,
            preload: args.preload && server_config.image_generation_enabled,
            model,
            scheduler,
            ..ManagerConfig::default()
        };
        let manager = GenerationManager::start(manager_config).await?;

        state = state
            .with_defaults(defaults)
            .with_backend(Backend { manager, store });
    }

    tracing::info!(
        ?variant,
        image_generation = server_config.image_generation_enabled,
        steps = args.steps,
        scheduler = args.scheduler.as_str(),
        "starting server"
    );

    let app = RouterBuilder::new().with_state(state).build()?;

    let addr: SocketAddr = format!("{}:{}", server_config.host, server_config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", server_config.host, server_config.port))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
