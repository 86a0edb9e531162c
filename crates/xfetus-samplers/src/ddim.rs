//! DDIM (Denoising Diffusion Implicit Models) Sampler
//!
//! Implements deterministic (eta = 0) or partially stochastic sampling with
//! far fewer steps than the training schedule.

use burn::prelude::*;

use crate::scheduler::{
    leading_timesteps, NoiseSchedule, PredictionType, SamplerError, SchedulerConfig,
};

/// DDIM sampler configuration
#[derive(Debug, Clone)]
pub struct DdimConfig {
    /// Eta parameter (0.0 = deterministic DDIM, 1.0 = DDPM-like)
    pub eta: f64,
    /// Clip predicted x0
    pub clip_sample: bool,
    /// Clip range for predicted x0
    pub clip_sample_range: f64,
    /// Use ᾱ = 1 for the step past timestep 0 (otherwise ᾱ₀)
    pub set_alpha_to_one: bool,
    /// What the model predicts
    pub prediction_type: PredictionType,
}

impl Default for DdimConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for DdimConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            eta: 0.0,
            clip_sample: config.clip_sample,
            clip_sample_range: config.clip_sample_range,
            set_alpha_to_one: config.set_alpha_to_one,
            prediction_type: config.prediction_type,
        }
    }
}

impl DdimConfig {
    /// Set the stochasticity of each step
    pub fn with_eta(mut self, eta: f64) -> Self {
        self.eta = eta;
        self
    }
}

/// DDIM Sampler
///
/// Timesteps are empty until [`DdimSampler::set_timesteps`] is called.
#[derive(Debug, Clone)]
pub struct DdimSampler {
    /// Noise schedule
    schedule: NoiseSchedule,
    /// Sampler configuration
    config: DdimConfig,
    /// Timesteps for inference, highest noise first
    timesteps: Vec<usize>,
    /// Training steps skipped per inference step
    step_ratio: usize,
    /// ᾱ used after the final step
    final_alpha_cumprod: f64,
}

impl DdimSampler {
    /// Create a new DDIM sampler
    pub fn new(schedule: NoiseSchedule, config: DdimConfig) -> Self {
        let final_alpha_cumprod = if config.set_alpha_to_one {
            1.0
        } else {
            schedule.alpha_cumprod_at(0)
        };

        Self {
            schedule,
            config,
            timesteps: Vec::new(),
            step_ratio: 1,
            final_alpha_cumprod,
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

    /// Mutable access to the timesteps, e.g. to move the first step
    pub fn timesteps_mut(&mut self) -> &mut [usize] {
        &mut self.timesteps
    }

    /// Number of training timesteps in the underlying schedule
    pub fn num_train_steps(&self) -> usize {
        self.schedule.num_train_steps
    }

    /// DDIM does not rescale the model input
    pub fn scale_model_input<B: Backend>(&self, sample: Tensor<B, 4>, _timestep: usize) -> Tensor<B, 4> {
        sample
    }

    /// Perform one DDIM step
    ///
    /// Given the model output at `timestep` and the current sample, compute
    /// the sample at `timestep - step_ratio`.
    ///
    /// # Arguments
    /// * `model_output` - Model prediction [batch, channels, height, width]
    /// * `timestep` - Current training timestep
    /// * `sample` - Current noisy sample [batch, channels, height, width]
    pub fn step<B: Backend>(
        &self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let alpha_prod_t = self.schedule.alpha_cumprod_at(timestep);
        let alpha_prod_t_prev = match timestep.checked_sub(self.step_ratio) {
            Some(prev) => self.schedule.alpha_cumprod_at(prev),
            None => self.final_alpha_cumprod,
        };

        let (pred_x0, pred_epsilon) =
            self.config
                .prediction_type
                .split(model_output, sample.clone(), alpha_prod_t);

        let pred_x0 = if self.config.clip_sample {
            let range = self.config.clip_sample_range;
            pred_x0.clamp(-range, range)
        } else {
            pred_x0
        };

        // σₜ = η * sqrt((1 - ᾱₜ₋₁) / (1 - ᾱₜ) * (1 - ᾱₜ / ᾱₜ₋₁))
        let std_dev = if self.config.eta > 0.0 {
            let variance = (1.0 - alpha_prod_t_prev) / (1.0 - alpha_prod_t)
                * (1.0 - alpha_prod_t / alpha_prod_t_prev);
            self.config.eta * variance.max(0.0).sqrt()
        } else {
            0.0
        };

        // Direction pointing to x_t
        let dir_coeff = (1.0 - alpha_prod_t_prev - std_dev * std_dev).max(0.0).sqrt();
        let prev_sample = pred_x0 * alpha_prod_t_prev.sqrt() + pred_epsilon * dir_coeff;

        if std_dev > 0.0 {
            let noise = Tensor::random(
                sample.shape(),
                burn::tensor::Distribution::Normal(0.0, 1.0),
                &sample.device(),
            );
            prev_sample + noise * std_dev
        } else {
            prev_sample
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_ddim_config_default() {
        let config = DdimConfig::default();
        assert_eq!(config.eta, 0.0);
        assert!(config.clip_sample);
        assert!(config.set_alpha_to_one);
    }

    #[test]
    fn test_set_timesteps_and_override() {
        let schedule = NoiseSchedule::linear(1000, 0.0001, 0.02);
        let mut sampler = DdimSampler::new(schedule, DdimConfig::default());
        assert!(sampler.timesteps().is_empty());

        sampler.set_timesteps(50).unwrap();
        assert_eq!(sampler.timesteps()[0], 980);

        sampler.timesteps_mut()[0] = 999;
        assert_eq!(sampler.timesteps()[0], 999);
        assert_eq!(sampler.timesteps()[1], 960);
    }

    #[test]
    fn test_final_step_returns_clean_prediction() {
        let device = Default::default();
        let schedule = NoiseSchedule::linear(10, 0.1, 0.2);
        let mut sampler = DdimSampler::new(schedule.clone(), DdimConfig::default());
        sampler.set_timesteps(10).unwrap();

        // With ᾱ_prev = 1 the last step lands exactly on the predicted x0
        let x0 = 0.3f64;
        let eps = 0.5f64;
        let alpha = schedule.alpha_cumprod_at(0);
        let xt = x0 * alpha.sqrt() + eps * (1.0 - alpha).sqrt();

        let sample = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device) * xt;
        let noise_pred = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device) * eps;
        let prev: f32 = sampler.step(noise_pred, 0, sample).into_scalar();

        assert!((prev as f64 - x0).abs() < 1e-5);
    }

    #[test]
    fn test_deterministic_step_is_repeatable() {
        let device = Default::default();
        let schedule = NoiseSchedule::linear(1000, 0.0001, 0.02);
        let mut sampler = DdimSampler::new(schedule, DdimConfig::default());
        sampler.set_timesteps(20).unwrap();

        let sample = Tensor::<TestBackend, 4>::random(
            [1, 3, 4, 4],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let pred = sample.clone() * 0.5;

        let a = sampler.step(pred.clone(), 950, sample.clone());
        let b = sampler.step(pred, 950, sample);
        a.into_data().assert_approx_eq::<f32>(&b.into_data(), burn::tensor::Tolerance::default());
    }

    #[test]
    fn test_zero_snr_first_step_is_finite() {
        let device = Default::default();
        let config = SchedulerConfig {
            rescale_betas_zero_snr: true,
            ..Default::default()
        };
        let mut sampler =
            DdimSampler::new(NoiseSchedule::from_config(&config), DdimConfig::from(&config));
        sampler.set_timesteps(50).unwrap();
        sampler.timesteps_mut()[0] = 999;

        let sample = Tensor::<TestBackend, 4>::random(
            [1, 3, 4, 4],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let pred = Tensor::<TestBackend, 4>::zeros([1, 3, 4, 4], &device);
        let prev: Vec<f32> = sampler.step(pred, 999, sample).into_data().to_vec().unwrap();
        assert!(prev.iter().all(|v| v.is_finite()));
    }
}
