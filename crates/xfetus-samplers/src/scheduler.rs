//! Noise schedules for diffusion models
//!
//! This module provides the beta schedules, the forward (noising) process and
//! the helpers shared by the DDIM and DDPM samplers.

use burn::prelude::*;
use serde::Deserialize;
use thiserror::Error;

/// Errors raised while configuring a scheduler
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplerError {
    #[error("inference steps must be greater than zero")]
    ZeroInferenceSteps,

    #[error("inference steps ({steps}) cannot exceed training timesteps ({train_steps})")]
    TooManyInferenceSteps { steps: usize, train_steps: usize },

    #[error("timestep {timestep} is outside the schedule (0..{train_steps})")]
    TimestepOutOfRange { timestep: usize, train_steps: usize },
}

// ============================================================================
// Prediction Type (epsilon vs v-prediction)
// ============================================================================

/// Model prediction type
///
/// Different diffusion models are trained to predict different quantities:
/// - Epsilon (noise): DDPM, SD 1.x
/// - V-prediction (velocity): SD 2.x
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// Model predicts the noise (epsilon) added to the sample
    #[default]
    Epsilon,
    /// Model predicts the velocity v = alpha_t * epsilon - sqrt(1-alpha_t) * x0
    VPrediction,
    /// Model predicts the original sample x0
    Sample,
}

impl PredictionType {
    /// Recover `(x0, epsilon)` from a model output at cumulative alpha `alpha_prod_t`
    pub fn split<B: Backend>(
        self,
        model_output: Tensor<B, 4>,
        sample: Tensor<B, 4>,
        alpha_prod_t: f64,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        // A zero-SNR schedule has ᾱ = 0 at its last timestep
        let alpha_prod_t = alpha_prod_t.max(MIN_ALPHA_CUMPROD);
        let sqrt_alpha = alpha_prod_t.sqrt();
        let sqrt_beta = (1.0 - alpha_prod_t).sqrt();

        match self {
            PredictionType::Epsilon => {
                let x0 = (sample - model_output.clone() * sqrt_beta) / sqrt_alpha;
                (x0, model_output)
            }
            PredictionType::Sample => {
                let eps = (sample - model_output.clone() * sqrt_alpha) / sqrt_beta;
                (model_output, eps)
            }
            PredictionType::VPrediction => {
                let x0 = sample.clone() * sqrt_alpha - model_output.clone() * sqrt_beta;
                let eps = model_output * sqrt_alpha + sample * sqrt_beta;
                (x0, eps)
            }
        }
    }
}

// ============================================================================
// Schedule Configuration
// ============================================================================

/// How betas are spread over the training timesteps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum BetaSchedule {
    /// Evenly spaced betas between `beta_start` and `beta_end`
    #[default]
    #[serde(rename = "linear")]
    Linear,
    /// Evenly spaced square roots, squared (Stable Diffusion)
    #[serde(rename = "scaled_linear")]
    ScaledLinear,
    /// Cosine alpha-bar schedule (Nichol & Dhariwal), betas capped at 0.999
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredCosCapV2,
}

/// Scheduler configuration
///
/// Field names match diffusers' `scheduler_config.json`, so a pretrained
/// pipeline's scheduler file deserializes directly. Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of training timesteps
    pub num_train_timesteps: usize,
    /// First beta of the schedule
    pub beta_start: f64,
    /// Last beta of the schedule
    pub beta_end: f64,
    /// Beta spacing
    pub beta_schedule: BetaSchedule,
    /// Clip predicted x0 to `[-clip_sample_range, clip_sample_range]`
    pub clip_sample: bool,
    /// Clip range for predicted x0
    pub clip_sample_range: f64,
    /// Use alpha = 1 past the final step (DDIM)
    pub set_alpha_to_one: bool,
    /// Rescale betas so the final timestep has zero signal-to-noise ratio
    pub rescale_betas_zero_snr: bool,
    /// What the model predicts
    pub prediction_type: PredictionType,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.0001,
            beta_end: 0.02,
            beta_schedule: BetaSchedule::Linear,
            clip_sample: true,
            clip_sample_range: 1.0,
            set_alpha_to_one: true,
            rescale_betas_zero_snr: false,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

// ============================================================================
// Noise Schedule
// ============================================================================

/// Smallest cumulative alpha used when recovering x0 (2^-24)
const MIN_ALPHA_CUMPROD: f64 = 5.960_464_477_539_063e-8;

/// Precomputed noise schedule values
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    /// Beta at each timestep
    pub betas: Vec<f64>,
    /// 1 - beta
    pub alphas: Vec<f64>,
    /// Cumulative product of alphas: ᾱₜ
    pub alphas_cumprod: Vec<f64>,
    /// Number of training steps
    pub num_train_steps: usize,
}

impl NoiseSchedule {
    /// Build the schedule described by a scheduler config
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let n = config.num_train_timesteps;
        let mut betas = match config.beta_schedule {
            BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, n),
            BetaSchedule::ScaledLinear => {
                linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n)
                    .into_iter()
                    .map(|b| b * b)
                    .collect()
            }
            BetaSchedule::SquaredCosCapV2 => cosine_betas(n, 0.999),
        };

        if config.rescale_betas_zero_snr {
            betas = rescale_zero_terminal_snr(&betas);
        }

        Self::from_betas(betas)
    }

    /// Create a linear beta schedule
    pub fn linear(num_steps: usize, beta_start: f64, beta_end: f64) -> Self {
        Self::from_betas(linspace(beta_start, beta_end, num_steps))
    }

    /// Build the schedule from explicit betas
    pub fn from_betas(betas: Vec<f64>) -> Self {
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        let mut alphas_cumprod = Vec::with_capacity(alphas.len());
        let mut cumprod = 1.0f64;
        for alpha in &alphas {
            cumprod *= alpha;
            alphas_cumprod.push(cumprod);
        }

        Self {
            num_train_steps: betas.len(),
            betas,
            alphas,
            alphas_cumprod,
        }
    }

    /// Get alpha_cumprod at a specific timestep
    pub fn alpha_cumprod_at(&self, t: usize) -> f64 {
        self.alphas_cumprod[t]
    }

    /// Forward diffusion: noise clean samples to their per-sample timesteps
    ///
    /// `x_t = sqrt(ᾱₜ) * x0 + sqrt(1 - ᾱₜ) * noise`
    ///
    /// # Arguments
    ///
    /// * `original` - Clean samples `[batch, channels, height, width]`
    /// * `noise` - Gaussian noise with the same shape
    /// * `timesteps` - One timestep per sample
    pub fn add_noise<B: Backend>(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: &[usize],
    ) -> Tensor<B, 4> {
        let [batch, _, _, _] = original.dims();
        assert_eq!(
            batch,
            timesteps.len(),
            "add_noise needs one timestep per sample"
        );
        let device = original.device();

        let (signal, noise_scale): (Vec<f32>, Vec<f32>) = timesteps
            .iter()
            .map(|&t| {
                let alpha = self.alphas_cumprod[t];
                (alpha.sqrt() as f32, (1.0 - alpha).sqrt() as f32)
            })
            .unzip();

        let signal = Tensor::<B, 1>::from_data(TensorData::new(signal, [batch]), &device)
            .reshape([batch, 1, 1, 1]);
        let noise_scale = Tensor::<B, 1>::from_data(TensorData::new(noise_scale, [batch]), &device)
            .reshape([batch, 1, 1, 1]);

        original * signal + noise * noise_scale
    }
}

/// Rescale betas to have zero terminal SNR
///
/// From "Common Diffusion Noise Schedules and Sample Steps are Flawed"
/// (Lin et al., 2023). `sqrt(ᾱ)` is shifted so the last value is zero and
/// scaled so the first value is unchanged.
pub fn rescale_zero_terminal_snr(betas: &[f64]) -> Vec<f64> {
    if betas.is_empty() {
        return Vec::new();
    }

    let mut cumprod = 1.0f64;
    let mut alphas_bar_sqrt: Vec<f64> = betas
        .iter()
        .map(|b| {
            cumprod *= 1.0 - b;
            cumprod.sqrt()
        })
        .collect();

    let first = alphas_bar_sqrt[0];
    let last = alphas_bar_sqrt[alphas_bar_sqrt.len() - 1];
    let scale = first / (first - last);
    for value in alphas_bar_sqrt.iter_mut() {
        *value = (*value - last) * scale;
    }

    let alphas_bar: Vec<f64> = alphas_bar_sqrt.iter().map(|v| v * v).collect();

    let mut rescaled = Vec::with_capacity(betas.len());
    rescaled.push(1.0 - alphas_bar[0]);
    for pair in alphas_bar.windows(2) {
        rescaled.push(1.0 - pair[1] / pair[0]);
    }
    rescaled
}

/// Generate "leading" spaced inference timesteps, highest noise first
///
/// `step_ratio = num_train_steps / num_inference_steps` and the sequence is
/// `[(n-1)*ratio, ..., ratio, 0]`.
pub fn leading_timesteps(
    num_inference_steps: usize,
    num_train_steps: usize,
) -> Result<Vec<usize>, SamplerError> {
    if num_inference_steps == 0 {
        return Err(SamplerError::ZeroInferenceSteps);
    }
    if num_inference_steps > num_train_steps {
        return Err(SamplerError::TooManyInferenceSteps {
            steps: num_inference_steps,
            train_steps: num_train_steps,
        });
    }

    let step_ratio = num_train_steps / num_inference_steps;
    Ok((0..num_inference_steps)
        .rev()
        .map(|i| i * step_ratio)
        .collect())
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

fn cosine_betas(n: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
    (0..n)
        .map(|i| {
            let t1 = i as f64 / n as f64;
            let t2 = (i + 1) as f64 / n as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_leading_timesteps() {
        let steps = leading_timesteps(50, 1000).unwrap();
        assert_eq!(steps.len(), 50);
        assert_eq!(steps[0], 980); // First step (highest noise)
        assert_eq!(steps[49], 0); // Last step (lowest noise)
    }

    #[test]
    fn test_leading_timesteps_rejects_bad_counts() {
        assert_eq!(
            leading_timesteps(0, 1000),
            Err(SamplerError::ZeroInferenceSteps)
        );
        assert!(matches!(
            leading_timesteps(2000, 1000),
            Err(SamplerError::TooManyInferenceSteps { .. })
        ));
    }

    #[test]
    fn test_linear_schedule_endpoints() {
        let schedule = NoiseSchedule::linear(1000, 0.0001, 0.02);
        assert_eq!(schedule.num_train_steps, 1000);
        assert!((schedule.betas[0] - 0.0001).abs() < 1e-12);
        assert!((schedule.betas[999] - 0.02).abs() < 1e-12);
        assert!((schedule.alphas_cumprod[0] - 0.9999).abs() < 1e-12);
    }

    #[test]
    fn test_alphas_cumprod_strictly_decreasing() {
        for schedule in [
            BetaSchedule::Linear,
            BetaSchedule::ScaledLinear,
            BetaSchedule::SquaredCosCapV2,
        ] {
            let config = SchedulerConfig {
                beta_schedule: schedule,
                ..Default::default()
            };
            let s = NoiseSchedule::from_config(&config);
            for pair in s.alphas_cumprod.windows(2) {
                assert!(pair[1] < pair[0], "{schedule:?} not decreasing");
            }
            assert!(s.alphas_cumprod.iter().all(|&a| a > 0.0 && a <= 1.0));
        }
    }

    #[test]
    fn test_zero_snr_rescale_ends_at_zero() {
        let betas = linspace(0.0001, 0.02, 1000);
        let rescaled = rescale_zero_terminal_snr(&betas);

        // Last beta is 1, which zeroes the final cumulative alpha
        assert!((rescaled[999] - 1.0).abs() < 1e-9);
        // First cumulative alpha is unchanged
        assert!((rescaled[0] - betas[0]).abs() < 1e-9);
    }

    #[test]
    fn test_zero_snr_schedule_stays_finite() {
        let config = SchedulerConfig {
            rescale_betas_zero_snr: true,
            ..Default::default()
        };
        let schedule = NoiseSchedule::from_config(&config);
        assert_eq!(schedule.alphas_cumprod[999], 0.0);
        assert!(schedule.alphas_cumprod[998] > 0.0);

        // Recovering x0 at the zero-SNR timestep stays finite
        let device = Default::default();
        let sample = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let eps = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);
        let (x0, _) = PredictionType::Epsilon.split(eps, sample, schedule.alphas_cumprod[999]);
        let values: Vec<f32> = x0.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_scheduler_config_from_diffusers_json() {
        let json = r#"{
            "_class_name": "DDPMScheduler",
            "_diffusers_version": "0.1.1",
            "beta_end": 0.02,
            "beta_schedule": "linear",
            "beta_start": 0.0001,
            "clip_sample": true,
            "num_train_timesteps": 1000,
            "trained_betas": null,
            "variance_type": "fixed_small"
        }"#;
        let config: SchedulerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_train_timesteps, 1000);
        assert_eq!(config.beta_schedule, BetaSchedule::Linear);
        assert!(!config.rescale_betas_zero_snr);
    }

    #[test]
    fn test_add_noise_per_sample() {
        let device = Default::default();
        let schedule = NoiseSchedule::linear(10, 0.1, 0.5);

        let x0 = Tensor::<TestBackend, 4>::ones([2, 1, 2, 2], &device);
        let noise = Tensor::<TestBackend, 4>::zeros([2, 1, 2, 2], &device);

        let noisy = schedule.add_noise(x0, noise, &[0, 9]);
        let values: Vec<f32> = noisy.into_data().to_vec().unwrap();

        let expected_first = schedule.alphas_cumprod[0].sqrt() as f32;
        let expected_last = schedule.alphas_cumprod[9].sqrt() as f32;
        assert!((values[0] - expected_first).abs() < 1e-6);
        assert!((values[4] - expected_last).abs() < 1e-6);
    }

    #[test]
    fn test_prediction_split_epsilon_roundtrip() {
        let device = Default::default();
        let x0 = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device) * 0.5;
        let eps = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device) * -0.25;
        let alpha = 0.64f64;

        let sample = x0.clone() * alpha.sqrt() + eps.clone() * (1.0 - alpha).sqrt();
        let (pred_x0, pred_eps) = PredictionType::Epsilon.split(eps, sample, alpha);

        let x: f32 = pred_x0.into_scalar();
        let e: f32 = pred_eps.into_scalar();
        assert!((x - 0.5).abs() < 1e-5);
        assert!((e + 0.25).abs() < 1e-5);
    }
}
