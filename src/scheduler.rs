//! Discrete-time diffusion schedulers for the epsilon-prediction UNet.
//!
//! Three schedulers for the denoising loop, all sharing the `scaled_linear`
//! beta schedule of the v1.5 checkpoint:
//!
//! - [`pndm`] — pseudo linear multistep (PLMS), the checkpoint default
//! - [`ddim`] — deterministic DDIM with eta = 0
//! - [`euler`] — first-order Euler integrator in sigma space
//!
//! ## Noise schedule
//!
//! `β_i = (√β_start + i/(N-1) · (√β_end - √β_start))²`, `ᾱ_t = ∏_{i≤t} (1 - β_i)`.
//! The UNet predicts the noise `ε` added to `x_0`:
//! `x_t = √ᾱ_t · x_0 + √(1 - ᾱ_t) · ε`.

pub mod ddim;
pub mod euler;
pub mod pndm;

use candle_core::Tensor;
use serde::Deserialize;

use crate::config::SchedulerKind;

/// Common interface for all schedulers.
pub trait Scheduler: Send {
    /// Set up the timestep schedule for a given number of inference steps.
    fn set_timesteps(&mut self, num_inference_steps: usize);

    /// Return the timestep values in the order the UNet sees them.
    ///
    /// May be longer than the requested step count (PLMS warm-up repeats a
    /// timestep); callers run the first `num_inference_steps` entries.
    fn timesteps(&self) -> &[f64];

    /// Standard deviation of the initial noise.
    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    /// Scale the denoising input for the current step.
    fn scale_model_input(&self, sample: Tensor, _step_index: usize) -> crate::Result<Tensor> {
        Ok(sample)
    }

    /// Perform one scheduler step.
    ///
    /// - `model_output`: predicted noise from the UNet (after guidance)
    /// - `sample`: current noisy latent
    /// - `step_index`: which step we're on
    fn step(
        &mut self,
        model_output: &Tensor,
        sample: &Tensor,
        step_index: usize,
    ) -> crate::Result<Tensor>;
}

/// Beta schedule family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
}

/// Configuration shared across all schedulers.
///
/// Deserializes from a diffusers `scheduler_config.json`; unknown keys are
/// ignored and missing keys fall back to the v1.5 values.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    #[serde(default = "default_beta_start")]
    pub beta_start: f64,

    #[serde(default = "default_beta_end")]
    pub beta_end: f64,

    #[serde(default = "default_beta_schedule")]
    pub beta_schedule: BetaSchedule,

    /// Offset added to every inference timestep.
    #[serde(default = "default_steps_offset")]
    pub steps_offset: usize,

    /// Use ᾱ = 1 for the step past the end of the schedule instead of ᾱ_0.
    #[serde(default)]
    pub set_alpha_to_one: bool,

    #[serde(default = "default_skip_prk_steps")]
    pub skip_prk_steps: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            beta_start: default_beta_start(),
            beta_end: default_beta_end(),
            beta_schedule: default_beta_schedule(),
            steps_offset: default_steps_offset(),
            set_alpha_to_one: false,
            skip_prk_steps: default_skip_prk_steps(),
        }
    }
}

impl SchedulerConfig {
    /// Per-timestep betas.
    pub fn betas(&self) -> Vec<f64> {
        let n = self.num_train_timesteps;
        let denom = (n - 1).max(1) as f64;
        match self.beta_schedule {
            BetaSchedule::Linear => (0..n)
                .map(|i| self.beta_start + (self.beta_end - self.beta_start) * i as f64 / denom)
                .collect(),
            BetaSchedule::ScaledLinear => {
                let start = self.beta_start.sqrt();
                let end = self.beta_end.sqrt();
                (0..n)
                    .map(|i| {
                        let b = start + (end - start) * i as f64 / denom;
                        b * b
                    })
                    .collect()
            }
        }
    }

    /// Cumulative product of `1 - β`.
    pub fn alphas_cumprod(&self) -> Vec<f64> {
        let mut acc = 1.0;
        self.betas()
            .into_iter()
            .map(|beta| {
                acc *= 1.0 - beta;
                acc
            })
            .collect()
    }

    /// Distance between consecutive inference timesteps ("leading" spacing).
    pub fn step_ratio(&self, num_inference_steps: usize) -> usize {
        self.num_train_timesteps / num_inference_steps.max(1)
    }

    /// Load from a diffusers `scheduler_config.json`.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Build a scheduler of the requested kind with its timesteps already set.
pub fn build(
    kind: SchedulerKind,
    config: SchedulerConfig,
    num_inference_steps: usize,
) -> Box<dyn Scheduler> {
    let mut scheduler: Box<dyn Scheduler> = match kind {
        SchedulerKind::Pndm => Box::new(pndm::PndmScheduler::new(config)),
        SchedulerKind::Ddim => Box::new(ddim::DdimScheduler::new(config)),
        SchedulerKind::Euler => Box::new(euler::EulerScheduler::new(config)),
    };
    scheduler.set_timesteps(num_inference_steps);
    scheduler
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_beta_start() -> f64 {
    0.00085
}

fn default_beta_end() -> f64 {
    0.012
}

fn default_beta_schedule() -> BetaSchedule {
    BetaSchedule::ScaledLinear
}

fn default_steps_offset() -> usize {
    1
}

fn default_skip_prk_steps() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaled_linear_endpoints() {
        let config = SchedulerConfig::default();
        let betas = config.betas();
        assert_eq!(betas.len(), 1000);
        assert!((betas[0] - 0.00085).abs() < 1e-12, "beta_0 = {}", betas[0]);
        assert!((betas[999] - 0.012).abs() < 1e-12, "beta_N = {}", betas[999]);
    }

    #[test]
    fn alphas_cumprod_decreasing() {
        let config = SchedulerConfig::default();
        let ac = config.alphas_cumprod();
        assert!((ac[0] - (1.0 - 0.00085)).abs() < 1e-12);
        for i in 1..ac.len() {
            assert!(ac[i] < ac[i - 1], "not decreasing at {i}");
        }
        // Known value for the SD schedule: ᾱ_999 ≈ 0.0047
        assert!((ac[999] - 0.0047).abs() < 5e-4, "alpha_bar_999 = {}", ac[999]);
    }

    #[test]
    fn config_from_diffusers_json() {
        let json = r#"{
            "_class_name": "PNDMScheduler",
            "_diffusers_version": "0.6.0",
            "beta_end": 0.012,
            "beta_schedule": "scaled_linear",
            "beta_start": 0.00085,
            "num_train_timesteps": 1000,
            "set_alpha_to_one": false,
            "skip_prk_steps": true,
            "steps_offset": 1,
            "trained_betas": null
        }"#;
        let config: SchedulerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_train_timesteps, 1000);
        assert_eq!(config.beta_schedule, BetaSchedule::ScaledLinear);
        assert_eq!(config.steps_offset, 1);
        assert!(config.skip_prk_steps);
        assert!(!config.set_alpha_to_one);
    }

    #[test]
    fn build_sets_timesteps() {
        for kind in [SchedulerKind::Pndm, SchedulerKind::Ddim, SchedulerKind::Euler] {
            let scheduler = build(kind, SchedulerConfig::default(), 15);
            assert!(
                scheduler.timesteps().len() >= 15,
                "{kind:?} produced {} timesteps",
                scheduler.timesteps().len()
            );
        }
    }
}
