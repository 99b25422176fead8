//! DDIM scheduler with eta = 0 (fully deterministic).
//!
//! Update rule:
//! ```text
//! x̂_0    = (x_t - √(1-ᾱ_t)·ε) / √ᾱ_t
//! x_prev = √ᾱ_prev·x̂_0 + √(1-ᾱ_prev)·ε
//! ```

use candle_core::Tensor;

use super::{Scheduler, SchedulerConfig};
use crate::{Error, Result};

/// Deterministic DDIM scheduler.
pub struct DdimScheduler {
    config: SchedulerConfig,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    step_ratio: usize,
    timesteps: Vec<f64>,
}

impl DdimScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let alphas_cumprod = config.alphas_cumprod();
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            alphas_cumprod[0]
        };
        Self {
            config,
            alphas_cumprod,
            final_alpha_cumprod,
            step_ratio: 0,
            timesteps: Vec::new(),
        }
    }
}

impl Scheduler for DdimScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) {
        let n = num_inference_steps.max(1);
        self.step_ratio = self.config.step_ratio(n);
        self.timesteps = (0..n)
            .rev()
            .map(|i| (i * self.step_ratio + self.config.steps_offset) as f64)
            .collect();
    }

    fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        sample: &Tensor,
        step_index: usize,
    ) -> Result<Tensor> {
        let timestep = *self.timesteps.get(step_index).ok_or_else(|| {
            Error::Config(format!(
                "step index {step_index} past the end of a {}-entry schedule",
                self.timesteps.len()
            ))
        })? as usize;
        let timestep = timestep.min(self.alphas_cumprod.len() - 1);
        let prev_timestep = timestep as i64 - self.step_ratio as i64;

        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_t_prev = if prev_timestep >= 0 {
            self.alphas_cumprod[prev_timestep as usize]
        } else {
            self.final_alpha_cumprod
        };
        let beta_prod_t = 1.0 - alpha_prod_t;

        // x̂_0
        let pred_original = ((sample - (model_output * beta_prod_t.sqrt())?)?
            * (1.0 / alpha_prod_t.sqrt()))?;

        // Direction pointing to x_t
        let direction = (model_output * (1.0 - alpha_prod_t_prev).sqrt())?;

        let prev = ((pred_original * alpha_prod_t_prev.sqrt())? + direction)?;
        Ok(prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn timesteps_setup() {
        let mut scheduler = DdimScheduler::new(SchedulerConfig::default());
        scheduler.set_timesteps(50);

        let ts = scheduler.timesteps();
        assert_eq!(ts.len(), 50);
        assert_eq!(ts[0], 981.0);
        assert_eq!(ts[49], 1.0);
        for i in 0..49 {
            assert!(ts[i] > ts[i + 1], "not descending at {i}");
        }
    }

    #[test]
    fn step_is_exact_for_true_noise() {
        let config = SchedulerConfig::default();
        let ac = config.alphas_cumprod();
        let mut scheduler = DdimScheduler::new(config);
        scheduler.set_timesteps(20);

        let device = Device::Cpu;
        let x0 = Tensor::randn(0.0_f32, 1.0, (1, 4, 8, 8), &device).unwrap();
        let eps = Tensor::randn(0.0_f32, 1.0, (1, 4, 8, 8), &device).unwrap();

        let t = scheduler.timesteps()[3] as usize;
        let t_prev = t - 50;
        let x_t = ((&x0 * ac[t].sqrt()).unwrap() + (&eps * (1.0 - ac[t]).sqrt()).unwrap()).unwrap();
        let expected = ((&x0 * ac[t_prev].sqrt()).unwrap()
            + (&eps * (1.0 - ac[t_prev]).sqrt()).unwrap())
        .unwrap();

        let result = scheduler.step(&eps, &x_t, 3).unwrap();
        let diff: f32 = (&result - &expected)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "DDIM step should be exact, diff={diff}");
    }

    #[test]
    fn last_step_uses_final_alpha() {
        let config = SchedulerConfig::default();
        let mut scheduler = DdimScheduler::new(config);
        scheduler.set_timesteps(10);
        let last = scheduler.timesteps().len() - 1;

        let device = Device::Cpu;
        let sample = Tensor::randn(0.0_f32, 1.0, (1, 4, 8, 8), &device).unwrap();
        let noise = Tensor::zeros_like(&sample).unwrap();
        let result = scheduler.step(&noise, &sample, last).unwrap();
        assert_eq!(result.dims(), sample.dims());
    }

    #[test]
    fn out_of_range_step_is_an_error() {
        let mut scheduler = DdimScheduler::new(SchedulerConfig::default());
        scheduler.set_timesteps(4);
        let device = Device::Cpu;
        let sample = Tensor::zeros((1, 4, 2, 2), candle_core::DType::F32, &device).unwrap();
        assert!(scheduler.step(&sample, &sample, 4).is_err());
    }
}
