//! Runtime choice between the DDIM and DDPM samplers

use burn::prelude::*;
use serde::Deserialize;

use crate::ddim::{DdimConfig, DdimSampler};
use crate::ddpm::{DdpmConfig, DdpmSampler};
use crate::scheduler::{NoiseSchedule, SamplerError, SchedulerConfig};

/// Which reverse process to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    #[default]
    Ddim,
    Ddpm,
}

impl std::fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplerKind::Ddim => write!(f, "ddim"),
            SamplerKind::Ddpm => write!(f, "ddpm"),
        }
    }
}

impl SamplerKind {
    /// Build a sampler of this kind over the schedule described by `config`
    ///
    /// `eta` only affects DDIM.
    pub fn build(self, config: &SchedulerConfig, eta: f64) -> Sampler {
        let schedule = NoiseSchedule::from_config(config);
        match self {
            SamplerKind::Ddim => Sampler::Ddim(DdimSampler::new(
                schedule,
                DdimConfig::from(config).with_eta(eta),
            )),
            SamplerKind::Ddpm => Sampler::Ddpm(DdpmSampler::new(schedule, DdpmConfig::from(config))),
        }
    }
}

/// A configured reverse-diffusion sampler
#[derive(Debug, Clone)]
pub enum Sampler {
    Ddim(DdimSampler),
    Ddpm(DdpmSampler),
}

impl Sampler {
    pub fn kind(&self) -> SamplerKind {
        match self {
            Sampler::Ddim(_) => SamplerKind::Ddim,
            Sampler::Ddpm(_) => SamplerKind::Ddpm,
        }
    }

    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<(), SamplerError> {
        match self {
            Sampler::Ddim(s) => s.set_timesteps(num_inference_steps),
            Sampler::Ddpm(s) => s.set_timesteps(num_inference_steps),
        }
    }

    pub fn timesteps(&self) -> &[usize] {
        match self {
            Sampler::Ddim(s) => s.timesteps(),
            Sampler::Ddpm(s) => s.timesteps(),
        }
    }

    pub fn num_train_steps(&self) -> usize {
        match self {
            Sampler::Ddim(s) => s.num_train_steps(),
            Sampler::Ddpm(s) => s.num_train_steps(),
        }
    }

    /// Replace the first (noisiest) inference timestep
    ///
    /// Does nothing until timesteps have been set.
    pub fn set_first_timestep(&mut self, timestep: usize) -> Result<(), SamplerError> {
        let train_steps = self.num_train_steps();
        if timestep >= train_steps {
            return Err(SamplerError::TimestepOutOfRange {
                timestep,
                train_steps,
            });
        }
        let timesteps = match self {
            Sampler::Ddim(s) => s.timesteps_mut(),
            Sampler::Ddpm(s) => s.timesteps_mut(),
        };
        if let Some(first) = timesteps.first_mut() {
            *first = timestep;
        }
        Ok(())
    }

    pub fn scale_model_input<B: Backend>(&self, sample: Tensor<B, 4>, timestep: usize) -> Tensor<B, 4> {
        match self {
            Sampler::Ddim(s) => s.scale_model_input(sample, timestep),
            Sampler::Ddpm(s) => s.scale_model_input(sample, timestep),
        }
    }

    pub fn step<B: Backend>(
        &self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        match self {
            Sampler::Ddim(s) => s.step(model_output, timestep, sample),
            Sampler::Ddpm(s) => s.step(model_output, timestep, sample),
        }
    }
}
