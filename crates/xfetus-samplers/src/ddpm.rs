//! DDPM (Denoising Diffusion Probabilistic Models) Sampler
//!
//! Ancestral sampling with the "fixed small" posterior variance.

use burn::prelude::*;

use crate::scheduler::{
    leading_timesteps, NoiseSchedule, PredictionType, SamplerError, SchedulerConfig,
};

/// DDPM sampler configuration
#[derive(Debug, Clone)]
pub struct DdpmConfig {
    /// Clip predicted x0
    pub clip_sample: bool,
    /// Clip range for predicted x0
    pub clip_sample_range: f64,
    /// What the model predicts
    pub prediction_type: PredictionType,
}

impl Default for DdpmConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for DdpmConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            clip_sample: config.clip_sample,
            clip_sample_range: config.clip_sample_range,
            prediction_type: config.prediction_type,
        }
    }
}

/// DDPM Sampler
#[derive(Debug, Clone)]
pub struct DdpmSampler {
    schedule: NoiseSchedule,
    config: DdpmConfig,
    timesteps: Vec<usize>,
    step_ratio: usize,
}

impl DdpmSampler {
    /// Create a new DDPM sampler
    pub fn new(schedule: NoiseSchedule, config: DdpmConfig) -> Self {
        Self {
            schedule,
            config,
            timesteps: Vec::new(),
            step_ratio: 1,
        }
    }

    /// Select `num_inference_steps` "leading" spaced timesteps
    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<(), SamplerError> {
        let train_steps = self.schedule.num_train_steps;
        self.timesteps = leading_timesteps(num_inference_steps, train_steps)?;
        self.step_ratio = train_steps / num_inference_steps;
        Ok(())
    }

    /// Get the timesteps for inference
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Mutable access to the timesteps
    pub fn timesteps_mut(&mut self) -> &mut [usize] {
        &mut self.timesteps
    }

    /// Number of training timesteps in the underlying schedule
    pub fn num_train_steps(&self) -> usize {
        self.schedule.num_train_steps
    }

    /// DDPM does not rescale the model input
    pub fn scale_model_input<B: Backend>(&self, sample: Tensor<B, 4>, _timestep: usize) -> Tensor<B, 4> {
        sample
    }

    /// Perform one DDPM step from `timestep` to `timestep - step_ratio`
    ///
    /// Noise is added for every step except the last.
    pub fn step<B: Backend>(
        &self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let prev_t = timestep.checked_sub(self.step_ratio);

        let alpha_prod_t = self.schedule.alpha_cumprod_at(timestep);
        let alpha_prod_t_prev = prev_t.map_or(1.0, |t| self.schedule.alpha_cumprod_at(t));
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_t_prev = 1.0 - alpha_prod_t_prev;
        let current_alpha_t = alpha_prod_t / alpha_prod_t_prev;
        let current_beta_t = 1.0 - current_alpha_t;

        let (pred_x0, _) =
            self.config
                .prediction_type
                .split(model_output, sample.clone(), alpha_prod_t);

        let pred_x0 = if self.config.clip_sample {
            let range = self.config.clip_sample_range;
            pred_x0.clamp(-range, range)
        } else {
            pred_x0
        };

        // Posterior mean coefficients (eq. 7 of Ho et al.)
        let beta_prod_t = beta_prod_t.max(f64::EPSILON);
        let x0_coeff = alpha_prod_t_prev.sqrt() * current_beta_t / beta_prod_t;
        let sample_coeff = current_alpha_t.sqrt() * beta_prod_t_prev / beta_prod_t;
        let prev_sample = pred_x0 * x0_coeff + sample.clone() * sample_coeff;

        if timestep == 0 {
            return prev_sample;
        }

        let variance = (beta_prod_t_prev / beta_prod_t * current_beta_t).max(1e-20);
        let noise = Tensor::random(
            sample.shape(),
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &sample.device(),
        );
        prev_sample + noise * variance.sqrt()
    }
}
