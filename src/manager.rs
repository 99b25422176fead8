//! Generation manager: keeps the pipeline resident and queues requests.
//!
//! The manager owns one [`ImageGenerator`] living on GPU or CPU. Callers
//! submit requests which are processed sequentially on a dedicated blocking
//! thread, either as a single result ([`GenerationManager::generate`]) or as
//! a stream of per-step frames ([`GenerationManager::generate_stream`]).
//!
//! On a CUDA OOM the manager offloads to CPU and retries, as long as no
//! frame of the failed run has reached the caller yet.
//!
//! # Example
//!
//! ```no_run
//! use sd_stream::manager::{GenerationManager, ManagerConfig};
//! use sd_stream::pipeline::GenerationParams;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = GenerationManager::start(ManagerConfig::default()).await.unwrap();
//!     let image = manager
//!         .generate(GenerationParams::new("a castle in the clouds", None))
//!         .await
//!         .unwrap();
//! }
//! ```

use std::ops::ControlFlow;
use std::sync::Arc;

use candle_core::{DType, Device};
use tokio::sync::{mpsc, oneshot};

use crate::config::ModelConfig;
use crate::pipeline::{
    DiffusionPipeline, GeneratedImage, GenerationParams, ImageGenerator, StepCallback, StepFrame,
};
use crate::scheduler::SchedulerConfig;
use crate::{Error, Result};

/// Configuration for the generation manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// CUDA device ordinal (0 = first GPU). Ignored when CUDA is unavailable.
    pub cuda_device: usize,

    /// Never use an accelerator, even when one is available.
    pub force_cpu: bool,

    /// Run in f16 on accelerators. CPU always runs in f32.
    pub use_f16: bool,

    /// Minimum free VRAM (bytes) required before attempting GPU generation.
    ///
    /// If free VRAM drops below this threshold the manager offloads to CPU
    /// *before* attempting generation. Set to 0 to rely only on OOM retry.
    ///
    /// Default: 2 GiB.
    pub min_free_vram_bytes: u64,

    /// Load weights at startup instead of on the first request.
    pub preload: bool,

    /// Requests that may wait behind the running one.
    pub queue_depth: usize,

    /// Frames buffered per stream before the worker waits for the consumer.
    pub stream_buffer: usize,

    pub model: ModelConfig,

    /// Scheduler parameters; `None` uses the v1.5 defaults.
    pub scheduler: Option<SchedulerConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cuda_device: 0,
            force_cpu: false,
            use_f16: true,
            min_free_vram_bytes: 2 * 1024 * 1024 * 1024, // 2 GiB
            preload: false,
            queue_depth: 64,
            stream_buffer: 4,
            model: ModelConfig::default(),
            scheduler: None,
        }
    }
}

/// Builds a generator on the given device.
pub type Loader = Arc<dyn Fn(&Device) -> Result<Box<dyn ImageGenerator>> + Send + Sync>;

/// What a streamed generation produces, in order: zero or more `Step`s, then
/// exactly one `Complete` or `Failed`.
#[derive(Debug)]
pub enum GenerationEvent {
    Step(StepFrame),
    Complete(GeneratedImage),
    Failed(String),
}

enum Reply {
    Once(oneshot::Sender<Result<GeneratedImage>>),
    Stream(mpsc::Sender<GenerationEvent>),
}

/// A submitted generation request.
struct PendingRequest {
    params: GenerationParams,
    reply: Reply,
}

/// Handle for submitting generation requests to a running manager.
#[derive(Clone)]
pub struct GenerationManager {
    tx: mpsc::Sender<PendingRequest>,
    stream_buffer: usize,
}

impl GenerationManager {
    /// Start the manager with the Stable Diffusion pipeline.
    ///
    /// With `preload` the weights are loaded (downloading from the hub if
    /// needed) before this returns, and a load failure is returned here.
    pub async fn start(config: ManagerConfig) -> Result<Self> {
        let model = config.model.clone();
        let scheduler = config.scheduler.clone().unwrap_or_default();
        let use_f16 = config.use_f16;
        let loader: Loader = Arc::new(move |device: &Device| {
            let dtype = pipeline_dtype(device, use_f16);
            tracing::info!(device = ?device, ?dtype, "loading Stable Diffusion pipeline");
            let pipeline = DiffusionPipeline::load(&model, device, dtype)?
                .with_scheduler_config(scheduler.clone());
            Ok(Box::new(pipeline) as Box<dyn ImageGenerator>)
        });
        Self::with_loader(config, loader).await
    }

    /// Start the manager with a custom generator factory.
    pub async fn with_loader(config: ManagerConfig, loader: Loader) -> Result<Self> {
        let mut worker = Worker {
            generator: None,
            loader,
            config: config.clone(),
        };

        if config.preload {
            // Loading does synchronous I/O and heavy compute.
            worker = tokio::task::spawn_blocking(move || -> Result<Worker> {
                worker.ensure_loaded()?;
                Ok(worker)
            })
            .await
            .map_err(|join_error| {
                Error::Manager(format!("pipeline load task panicked: {join_error}"))
            })??;
        }

        let (tx, rx) = mpsc::channel::<PendingRequest>(config.queue_depth.max(1));
        tokio::task::spawn_blocking(move || run_manager(worker, rx));

        Ok(Self {
            tx,
            stream_buffer: config.stream_buffer.max(1),
        })
    }

    /// Submit a generation request and wait for the final image.
    pub async fn generate(&self, params: GenerationParams) -> Result<GeneratedImage> {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<GeneratedImage>>();
        self.submit(PendingRequest {
            params,
            reply: Reply::Once(reply_tx),
        })
        .await?;

        reply_rx
            .await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))?
    }

    /// Submit a generation request and receive its frames as they are decoded.
    ///
    /// Dropping the receiver cancels the generation at the next step.
    pub async fn generate_stream(
        &self,
        params: GenerationParams,
    ) -> Result<mpsc::Receiver<GenerationEvent>> {
        let (event_tx, event_rx) = mpsc::channel::<GenerationEvent>(self.stream_buffer);
        self.submit(PendingRequest {
            params,
            reply: Reply::Stream(event_tx),
        })
        .await?;
        Ok(event_rx)
    }

    async fn submit(&self, request: PendingRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::Manager("manager has shut down".into()))
    }
}

/// The manager loop. Runs in a dedicated blocking thread.
fn run_manager(mut worker: Worker, mut rx: mpsc::Receiver<PendingRequest>) {
    while let Some(request) = rx.blocking_recv() {
        worker.handle(request);
    }
    tracing::info!("generation manager shut down");
}

struct Worker {
    generator: Option<Box<dyn ImageGenerator>>,
    loader: Loader,
    config: ManagerConfig,
}

impl Worker {
    fn handle(&mut self, request: PendingRequest) {
        let PendingRequest { params, reply } = request;
        match reply {
            Reply::Once(reply_tx) => {
                if reply_tx.is_closed() {
                    tracing::debug!("caller went away before generation started");
                    return;
                }
                let result = self.generate_with_retry(&params, None);
                // Ignore send errors: caller may have timed out.
                let _ = reply_tx.send(result);
            }
            Reply::Stream(event_tx) => {
                if event_tx.is_closed() {
                    tracing::debug!("stream closed before generation started");
                    return;
                }
                let mut forward = |frame: StepFrame| {
                    if event_tx.blocking_send(GenerationEvent::Step(frame)).is_err() {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                };
                let on_step: StepCallback<'_> = &mut forward;
                let event = match self.generate_with_retry(&params, Some(on_step)) {
                    Ok(image) => GenerationEvent::Complete(image),
                    Err(Error::Cancelled) => {
                        tracing::info!("stream consumer disconnected, generation stopped");
                        return;
                    }
                    Err(error) => GenerationEvent::Failed(error.to_string()),
                };
                let _ = event_tx.blocking_send(event);
            }
        }
    }

    /// Try to generate. On CUDA OOM before any frame went out, offload to
    /// CPU and retry once.
    fn generate_with_retry(
        &mut self,
        params: &GenerationParams,
        mut on_step: Option<StepCallback<'_>>,
    ) -> Result<GeneratedImage> {
        self.maybe_proactive_offload();

        let mut emitted = false;
        let first = {
            let generator = self.ensure_loaded()?;
            match on_step.as_mut() {
                Some(callback) => {
                    let mut tracking = |frame: StepFrame| {
                        emitted = true;
                        callback(frame)
                    };
                    let tracking: StepCallback<'_> = &mut tracking;
                    generator.generate(params, Some(tracking))
                }
                None => generator.generate(params, None),
            }
        };

        let error = match first {
            Ok(image) => return Ok(image),
            Err(error) if !is_oom_error(&error) => return Err(error),
            Err(error) => error,
        };

        if emitted {
            tracing::warn!(%error, "CUDA OOM after frames were streamed, not retrying");
            // Later requests should not hit the same wall.
            if let Err(offload_error) = self.offload_to_cpu() {
                tracing::warn!(%offload_error, "CPU offload after OOM failed");
            }
            return Err(error);
        }

        tracing::warn!(%error, "CUDA OOM, offloading pipeline to CPU and retrying");
        self.offload_to_cpu()?;
        let generator = self.ensure_loaded()?;
        generator.generate(params, on_step).map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            e => Error::Manager(format!("generation failed even on CPU: {e}")),
        })
    }

    /// Load the generator on the preferred device if it is not resident.
    fn ensure_loaded(&mut self) -> Result<&mut Box<dyn ImageGenerator>> {
        if self.generator.is_none() {
            let device = self.preferred_device();
            let generator = (self.loader)(&device)
                .map_err(|e| Error::Manager(format!("pipeline load failed: {e}")))?;
            self.generator = Some(generator);
        }
        self.generator
            .as_mut()
            .ok_or_else(|| Error::Manager("pipeline unavailable".into()))
    }

    fn preferred_device(&self) -> Device {
        if self.config.force_cpu {
            Device::Cpu
        } else {
            preferred_device(self.config.cuda_device)
        }
    }

    /// If free VRAM is below the configured threshold, proactively offload to CPU.
    fn maybe_proactive_offload(&mut self) {
        let on_cuda = self
            .generator
            .as_ref()
            .is_some_and(|generator| generator.device().is_cuda());
        if self.config.min_free_vram_bytes == 0 || !on_cuda {
            return;
        }

        match free_vram_bytes() {
            Ok(free) if free < self.config.min_free_vram_bytes => {
                tracing::info!(
                    free_mb = free / (1024 * 1024),
                    threshold_mb = self.config.min_free_vram_bytes / (1024 * 1024),
                    "free VRAM below threshold, offloading pipeline to CPU"
                );
                if let Err(error) = self.offload_to_cpu() {
                    tracing::warn!(%error, "proactive CPU offload failed, will reload on next request");
                }
            }
            Ok(free) => {
                tracing::debug!(free_mb = free / (1024 * 1024), "VRAM OK");
            }
            Err(error) => {
                tracing::warn!(%error, "could not query free VRAM, skipping proactive offload");
            }
        }
    }

    /// Replace the resident generator with one built on CPU.
    ///
    /// The old weights are released first. On failure nothing is resident
    /// and the next request reloads on the preferred device.
    fn offload_to_cpu(&mut self) -> Result<()> {
        self.generator = None;
        match (self.loader)(&Device::Cpu) {
            Ok(generator) => {
                tracing::info!("pipeline offloaded to CPU");
                self.generator = Some(generator);
                Ok(())
            }
            Err(reload_error) => {
                tracing::error!(%reload_error, "CPU offload failed");
                Err(Error::Manager(format!("CPU offload failed: {reload_error}")))
            }
        }
    }
}

/// Activation dtype for a device: f16 on accelerators when requested, else f32.
pub fn pipeline_dtype(device: &Device, use_f16: bool) -> DType {
    if use_f16 && !device.is_cpu() {
        DType::F16
    } else {
        DType::F32
    }
}

/// Query free VRAM on the current CUDA device.
///
/// Returns an error if CUDA is not available or the query fails.
#[cfg(feature = "cuda")]
fn free_vram_bytes() -> std::result::Result<u64, String> {
    cudarc::runtime::result::get_mem_info()
        .map(|(free, _total)| free as u64)
        .map_err(|e| format!("cudaMemGetInfo failed: {e}"))
}

#[cfg(not(feature = "cuda"))]
fn free_vram_bytes() -> std::result::Result<u64, String> {
    Err("CUDA not compiled in".into())
}

/// Return the preferred device: CUDA, then Metal, otherwise CPU.
pub fn preferred_device(ordinal: usize) -> Device {
    match Device::cuda_if_available(ordinal) {
        Ok(device) if device.is_cuda() => device,
        _ => Device::metal_if_available(ordinal).unwrap_or(Device::Cpu),
    }
}

/// Return true if the error looks like a CUDA out-of-memory condition.
///
/// Candle surfaces CUDA errors as `candle_core::Error::Cuda(Box<dyn Error>)` whose
/// `Display` contains the cudarc error string, so match on substrings.
pub fn is_oom_error(error: &crate::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("out of memory")
        || msg.contains("cudaerrormemorya") // cudaErrorMemoryAllocation
        || msg.contains("cuda_error_out_of_memory")
        || msg.contains("cublas_status_alloc_failed")
        || msg.contains("alloc failed")
}
