//! Noise Schedules and Diffusion Schedulers
//!
//! The training side uses [`NoiseSchedule::add_noise`] for the forward
//! process. The sampling side walks a [`Sampler`] (DDIM or DDPM) backwards
//! from pure noise.
//!
//! # Example
//!
//! ```ignore
//! use xfetus_samplers::{DdimConfig, DdimSampler, NoiseSchedule, SchedulerConfig};
//!
//! let config = SchedulerConfig { rescale_betas_zero_snr: true, ..Default::default() };
//! let mut sampler = DdimSampler::new(NoiseSchedule::from_config(&config), DdimConfig::from(&config));
//! sampler.set_timesteps(50)?;
//!
//! for &t in sampler.timesteps() {
//!     let noise_pred = unet.forward(x.clone(), timestep(t), labels.clone());
//!     x = sampler.step(noise_pred, t, x);
//! }
//! ```

pub mod ddim;
pub mod ddpm;
pub mod sampler;
pub mod scheduler;

pub use ddim::{DdimConfig, DdimSampler};
pub use ddpm::{DdpmConfig, DdpmSampler};
pub use sampler::{Sampler, SamplerKind};
pub use scheduler::{
    leading_timesteps, rescale_zero_terminal_snr, BetaSchedule, NoiseSchedule, PredictionType,
    SamplerError, SchedulerConfig,
};
