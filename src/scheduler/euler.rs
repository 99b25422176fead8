//! Euler discrete scheduler.
//!
//! First-order ODE integrator in sigma space, `σ_t = √((1-ᾱ_t)/ᾱ_t)`.
//!
//! Update rule:
//! ```text
//! x_in   = x / √(σ² + 1)             // scale_model_input
//! x_next = x + (σ_next - σ) · ε
//! ```
//!
//! Timesteps are spaced linearly over `[0, N-1]` (not leading), so they are
//! fractional and the sigmas are interpolated.

use candle_core::Tensor;

use super::{Scheduler, SchedulerConfig};
use crate::{Error, Result};

/// Euler discrete scheduler.
pub struct EulerScheduler {
    config: SchedulerConfig,
    /// Sigma at every integer training timestep.
    train_sigmas: Vec<f64>,
    sigmas: Vec<f64>,
    timesteps: Vec<f64>,
}

impl EulerScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let train_sigmas = config
            .alphas_cumprod()
            .into_iter()
            .map(|ac| ((1.0 - ac) / ac).sqrt())
            .collect();
        Self {
            config,
            train_sigmas,
            sigmas: Vec::new(),
            timesteps: Vec::new(),
        }
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// Linear interpolation of the training sigmas at a fractional timestep.
    fn sigma_at(&self, t: f64) -> f64 {
        let last = self.train_sigmas.len() - 1;
        let t = t.clamp(0.0, last as f64);
        let lo = t.floor() as usize;
        let hi = (lo + 1).min(last);
        let frac = t - lo as f64;
        self.train_sigmas[lo] * (1.0 - frac) + self.train_sigmas[hi] * frac
    }

    fn sigma_pair(&self, step_index: usize) -> Result<(f64, f64)> {
        match (self.sigmas.get(step_index), self.sigmas.get(step_index + 1)) {
            (Some(&sigma), Some(&next)) => Ok((sigma, next)),
            _ => Err(Error::Config(format!(
                "step index {step_index} past the end of a {}-entry schedule",
                self.timesteps.len()
            ))),
        }
    }
}

impl Scheduler for EulerScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) {
        let n = num_inference_steps.max(1);
        let t_max = (self.config.num_train_timesteps - 1) as f64;

        self.timesteps = (0..n)
            .map(|i| {
                if n == 1 {
                    t_max
                } else {
                    t_max - t_max * i as f64 / (n - 1) as f64
                }
            })
            .collect();

        self.sigmas = self.timesteps.iter().map(|&t| self.sigma_at(t)).collect();
        // Terminal sigma = 0.
        self.sigmas.push(0.0);
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        let sigma_max = self.sigmas.iter().copied().fold(0.0, f64::max);
        (sigma_max * sigma_max + 1.0).sqrt()
    }

    fn scale_model_input(&self, sample: Tensor, step_index: usize) -> Result<Tensor> {
        let (sigma, _) = self.sigma_pair(step_index)?;
        Ok((sample / (sigma * sigma + 1.0).sqrt())?)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        sample: &Tensor,
        step_index: usize,
    ) -> Result<Tensor> {
        let (sigma, sigma_next) = self.sigma_pair(step_index)?;

        // Epsilon prediction: derivative (x - x̂_0)/σ is the noise itself.
        let dt = sigma_next - sigma;
        let next = (sample + (model_output * dt)?)?;
        Ok(next)
    }
}
