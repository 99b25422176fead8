//! PNDM scheduler, PLMS branch only (`skip_prk_steps = true`).
//!
//! Linear multistep over the last four noise estimates:
//! ```text
//! ε' = ε_0                                        (first step)
//! ε' = (ε_0 + ε_1) / 2                            (warm-up, same timestep)
//! ε' = (3ε_0 - ε_1) / 2
//! ε' = (23ε_0 - 16ε_1 + 5ε_2) / 12
//! ε' = (55ε_0 - 59ε_1 + 37ε_2 - 9ε_3) / 24
//! ```
//! followed by the transfer
//! ```text
//! x_prev = √(ᾱ_prev/ᾱ_t)·x_t - (ᾱ_prev - ᾱ_t) / (ᾱ_t·√(1-ᾱ_prev) + √(ᾱ_t(1-ᾱ_t)ᾱ_prev)) · ε'
//! ```
//!
//! The warm-up evaluates the second timestep twice, so the schedule has
//! `n + 1` entries for `n` requested steps.

use candle_core::Tensor;

use super::{Scheduler, SchedulerConfig};
use crate::{Error, Result};

/// PLMS scheduler.
pub struct PndmScheduler {
    config: SchedulerConfig,
    alphas_cumprod: Vec<f64>,
    final_alpha_cumprod: f64,
    step_ratio: usize,
    plms_timesteps: Vec<usize>,
    timesteps: Vec<f64>,
    /// Most recent noise estimates, oldest first. At most four.
    ets: Vec<Tensor>,
    /// Sample held across the two warm-up evaluations.
    cur_sample: Option<Tensor>,
    counter: usize,
}

impl PndmScheduler {
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
            plms_timesteps: Vec::new(),
            timesteps: Vec::new(),
            ets: Vec::new(),
            cur_sample: None,
            counter: 0,
        }
    }

    fn alpha_at(&self, timestep: i64) -> f64 {
        if timestep < 0 {
            self.final_alpha_cumprod
        } else {
            let idx = (timestep as usize).min(self.alphas_cumprod.len() - 1);
            self.alphas_cumprod[idx]
        }
    }

    fn prev_sample(
        &self,
        sample: &Tensor,
        timestep: i64,
        prev_timestep: i64,
        model_output: &Tensor,
    ) -> Result<Tensor> {
        let alpha_prod_t = self.alpha_at(timestep);
        let alpha_prod_t_prev = self.alpha_at(prev_timestep);
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;

        let sample_coeff = (alpha_prod_t_prev / alpha_prod_t).sqrt();
        let denom = alpha_prod_t * beta_prod_t_prev.sqrt()
            + (alpha_prod_t * beta_prod_t * alpha_prod_t_prev).sqrt();
        let output_coeff = (alpha_prod_t_prev - alpha_prod_t) / denom;

        let prev = ((sample * sample_coeff)? - (model_output * output_coeff)?)?;
        Ok(prev)
    }
}

/// `Σ wᵢ·tᵢ / divisor`
fn combine(terms: &[(&Tensor, f64)], divisor: f64) -> Result<Tensor> {
    let (first, rest) = terms
        .split_first()
        .ok_or_else(|| Error::Config("empty multistep combination".to_string()))?;
    let mut acc = (first.0 * (first.1 / divisor))?;
    for (tensor, weight) in rest {
        acc = (acc + (*tensor * (weight / divisor))?)?;
    }
    Ok(acc)
}

impl Scheduler for PndmScheduler {
    fn set_timesteps(&mut self, num_inference_steps: usize) {
        let n = num_inference_steps.max(1);
        self.step_ratio = self.config.step_ratio(n);

        let base: Vec<usize> = (0..n)
            .map(|i| i * self.step_ratio + self.config.steps_offset)
            .collect();

        // [t_0, …, t_{n-2}, t_{n-2}, t_{n-1}], then descending.
        let mut plms = base[..n - 1].to_vec();
        if n >= 2 {
            plms.push(base[n - 2]);
        }
        plms.push(base[n - 1]);
        plms.reverse();

        self.timesteps = plms.iter().map(|&t| t as f64).collect();
        self.plms_timesteps = plms;
        self.ets.clear();
        self.cur_sample = None;
        self.counter = 0;
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
        let ratio = self.step_ratio as i64;
        let mut timestep = *self.plms_timesteps.get(step_index).ok_or_else(|| {
            Error::Config(format!(
                "step index {step_index} past the end of a {}-entry schedule",
                self.plms_timesteps.len()
            ))
        })? as i64;
        let mut prev_timestep = timestep - ratio;

        if self.counter != 1 {
            if self.ets.len() > 3 {
                self.ets.remove(0);
            }
            self.ets.push(model_output.clone());
        } else {
            prev_timestep = timestep;
            timestep += ratio;
        }

        let n = self.ets.len();
        let (eps, sample) = match (n, self.counter) {
            (1, 0) => {
                self.cur_sample = Some(sample.clone());
                (model_output.clone(), sample.clone())
            }
            (1, 1) => {
                let held = self.cur_sample.take().ok_or_else(|| {
                    Error::Config("PLMS warm-up step without a held sample".to_string())
                })?;
                let eps = combine(&[(model_output, 1.0), (&self.ets[0], 1.0)], 2.0)?;
                (eps, held)
            }
            (2, _) => (
                combine(&[(&self.ets[1], 3.0), (&self.ets[0], -1.0)], 2.0)?,
                sample.clone(),
            ),
            (3, _) => (
                combine(
                    &[(&self.ets[2], 23.0), (&self.ets[1], -16.0), (&self.ets[0], 5.0)],
                    12.0,
                )?,
                sample.clone(),
            ),
            _ => (
                combine(
                    &[
                        (&self.ets[n - 1], 55.0),
                        (&self.ets[n - 2], -59.0),
                        (&self.ets[n - 3], 37.0),
                        (&self.ets[n - 4], -9.0),
                    ],
                    24.0,
                )?,
                sample.clone(),
            ),
        };

        let prev = self.prev_sample(&sample, timestep, prev_timestep, &eps)?;
        self.counter += 1;
        Ok(prev)
    }
}
