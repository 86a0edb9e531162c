//! YAML training configuration
//!
//! The section names follow the experiment configs the training runs were
//! launched with:
//!
//! ```yaml
//! paths:
//!   models_path: datasets/FETAL_PLANES_DB
//!   model_name: ddpm-fetal.pth
//! model_hyperparameters:
//!   image_size: 128
//!   batch_size: 8
//!   epochs: 100
//!   learning_rate: 1.0e-5
//!   grad_accumulation_steps: 2
//! model_optimiser:
//!   total_steps: 1000
//!   inference_steps: 40
//!   scheduler_timesteps: 999
//!   continues_training: false
//!   starting_epoch: 0
//!   lowest_validation_loss: .inf
//! ```
//!
//! `model`, `data` and `sampling` are optional and default to the
//! conditioned six-class setup. Unknown sections such as `wandb` are
//! ignored.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use xfetus_convert::{checkpoint_paths, CheckpointPaths};
use xfetus_data::FetalPlaneClass;
use xfetus_samplers::{Sampler, SamplerKind, SchedulerConfig};

use crate::error::TrainError;

#[derive(Debug, Clone, Deserialize)]
pub struct TrainConfig {
    pub paths: PathsConfig,
    pub model_hyperparameters: HyperParameters,
    pub model_optimiser: OptimiserConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    /// Seeds shuffling, timesteps and augmentation
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Dataset arrays and checkpoints; relative paths are under `$HOME`
    pub models_path: PathBuf,
    /// Checkpoint file name
    pub model_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HyperParameters {
    /// Side of the square preview images
    pub image_size: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    /// Batches per optimizer step
    pub grad_accumulation_steps: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimiserConfig {
    /// Training timesteps of the sampling scheduler
    pub total_steps: usize,
    /// Reverse steps per preview
    pub inference_steps: usize,
    /// Replaces the first (noisiest) preview timestep
    pub scheduler_timesteps: usize,
    #[serde(default)]
    pub continues_training: bool,
    #[serde(default)]
    pub starting_epoch: usize,
    /// Best validation loss so far; a checkpoint is written only below it
    #[serde(default = "unbounded_loss")]
    pub lowest_validation_loss: f64,
}

fn unbounded_loss() -> f64 {
    f64::INFINITY
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Diffusers pipeline or UNet folder; random init when absent
    pub pretrained: Option<PathBuf>,
    /// Attach a class embedding and feed labels to the UNet
    pub add_conditioning: bool,
    /// Class used for preview sampling
    pub sample_class: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            pretrained: None,
            add_conditioning: true,
            sample_class: FetalPlaneClass::FetalBrain.index(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// One file per class, in label order
    pub training_filenames: Vec<String>,
    pub validation_filenames: Vec<String>,
    /// Random flip and rotation of training images
    pub augment: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            training_filenames: FetalPlaneClass::default_train_filenames(),
            validation_filenames: FetalPlaneClass::default_validation_filenames(),
            augment: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Epochs between previews; 0 disables them
    pub logging_interval: usize,
    pub output_dir: PathBuf,
    pub sampler: SamplerKind,
    /// DDIM stochasticity
    pub eta: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            logging_interval: 2,
            output_dir: PathBuf::from("samples"),
            sampler: SamplerKind::Ddim,
            eta: 0.0,
        }
    }
}

impl TrainConfig {
    /// Read and validate a YAML config
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| TrainError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Parse and validate a YAML config
    pub fn from_yaml(text: &str) -> Result<Self, TrainError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainError> {
        let hp = &self.model_hyperparameters;
        let opt = &self.model_optimiser;
        let invalid = |msg: String| Err(TrainError::InvalidConfig(msg));

        if hp.image_size == 0 {
            return invalid("image_size must be greater than zero".into());
        }
        if hp.batch_size == 0 {
            return invalid("batch_size must be greater than zero".into());
        }
        if hp.grad_accumulation_steps == 0 {
            return invalid("grad_accumulation_steps must be greater than zero".into());
        }
        if opt.inference_steps == 0 {
            return invalid("inference_steps must be greater than zero".into());
        }
        if opt.inference_steps > opt.total_steps {
            return invalid(format!(
                "inference_steps ({}) exceeds total_steps ({})",
                opt.inference_steps, opt.total_steps
            ));
        }
        if opt.scheduler_timesteps >= opt.total_steps {
            return invalid(format!(
                "scheduler_timesteps ({}) must be below total_steps ({})",
                opt.scheduler_timesteps, opt.total_steps
            ));
        }
        if opt.starting_epoch > hp.epochs {
            return invalid(format!(
                "starting_epoch ({}) is past epochs ({})",
                opt.starting_epoch, hp.epochs
            ));
        }
        if self.data.training_filenames.is_empty() {
            return invalid("training_filenames is empty".into());
        }
        if self.data.validation_filenames.len() > self.num_classes() {
            return invalid(format!(
                "{} validation files for {} training classes",
                self.data.validation_filenames.len(),
                self.num_classes()
            ));
        }
        if self.model.add_conditioning && self.model.sample_class >= self.num_classes() {
            return invalid(format!(
                "sample_class {} is out of range for {} classes",
                self.model.sample_class,
                self.num_classes()
            ));
        }
        Ok(())
    }

    /// Reject an `image_size` the UNet cannot downsample evenly
    ///
    /// `factor` is [`UNet2DConfig::downsample_factor`](xfetus_unet::UNet2DConfig::downsample_factor).
    pub fn validate_resolution(&self, factor: usize) -> Result<(), TrainError> {
        let size = self.model_hyperparameters.image_size;
        check_resolution("image_size", (size, size), factor)
    }

    /// One class per training file
    pub fn num_classes(&self) -> usize {
        self.data.training_filenames.len()
    }

    /// `models_path`, resolved against `$HOME` when relative
    pub fn models_dir(&self) -> PathBuf {
        let path = &self.paths.models_path;
        if path.is_absolute() {
            return path.clone();
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(path),
            None => path.clone(),
        }
    }

    pub fn checkpoint_paths(&self) -> CheckpointPaths {
        checkpoint_paths(&self.models_dir(), &self.paths.model_name)
    }

    /// Zero-terminal-SNR DDIM/DDPM schedule over `total_steps`
    pub fn sampling_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            num_train_timesteps: self.model_optimiser.total_steps,
            rescale_betas_zero_snr: true,
            ..Default::default()
        }
    }

    /// Preview sampler with its timesteps set and the first one overridden
    pub fn build_sampler(&self) -> Result<Sampler, TrainError> {
        let mut sampler = self
            .sampling
            .sampler
            .build(&self.sampling_scheduler_config(), self.sampling.eta);
        sampler.set_timesteps(self.model_optimiser.inference_steps)?;
        sampler.set_first_timestep(self.model_optimiser.scheduler_timesteps)?;
        Ok(sampler)
    }

    /// Class label fed to the UNet during preview sampling
    pub fn preview_class(&self) -> Option<usize> {
        self.model
            .add_conditioning
            .then_some(self.model.sample_class)
    }
}

/// Both sides of `size` must be multiples of the UNet's `factor`
pub(crate) fn check_resolution(
    what: &str,
    (height, width): (usize, usize),
    factor: usize,
) -> Result<(), TrainError> {
    if height % factor != 0 || width % factor != 0 {
        return Err(TrainError::InvalidConfig(format!(
            "{what} {height}x{width} is not a multiple of the UNet downsampling factor {factor}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
wandb:
  enabled: false
paths:
  models_path: /data/FETAL_PLANES_DB
  model_name: ddpm-fetal.pth
model_hyperparameters:
  image_size: 64
  batch_size: 4
  epochs: 10
  learning_rate: 1.0e-5
  grad_accumulation_steps: 2
model_optimiser:
  total_steps: 1000
  inference_steps: 40
  scheduler_timesteps: 999
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = TrainConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.model_hyperparameters.batch_size, 4);
        assert!(!config.model_optimiser.continues_training);
        assert_eq!(config.model_optimiser.starting_epoch, 0);
        assert!(config.model_optimiser.lowest_validation_loss.is_infinite());
        assert!(config.model.add_conditioning);
        assert_eq!(config.preview_class(), Some(1));
        assert_eq!(config.num_classes(), 6);
        assert_eq!(config.sampling.logging_interval, 2);
        assert_eq!(config.sampling.sampler, SamplerKind::Ddim);
        assert_eq!(config.seed, None);
    }

    #[test]
    fn test_absolute_models_path_and_checkpoint_names() {
        let config = TrainConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.models_dir(), PathBuf::from("/data/FETAL_PLANES_DB"));
        let paths = config.checkpoint_paths();
        assert_eq!(paths.model, PathBuf::from("/data/FETAL_PLANES_DB/ddpm-fetal.bin"));
    }

    #[test]
    fn test_relative_models_path_under_home() {
        let mut config = TrainConfig::from_yaml(MINIMAL).unwrap();
        config.paths.models_path = PathBuf::from("datasets/fetal");
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(config.models_dir(), PathBuf::from(home).join("datasets/fetal"));
        }
    }

    #[test]
    fn test_sampler_from_config() {
        let config = TrainConfig::from_yaml(MINIMAL).unwrap();
        let sampler = config.build_sampler().unwrap();
        assert_eq!(sampler.timesteps().len(), 40);
        assert_eq!(sampler.timesteps()[0], 999);
        assert_eq!(sampler.num_train_steps(), 1000);
        assert!(config.sampling_scheduler_config().rescale_betas_zero_snr);
    }

    #[test]
    fn test_optional_sections() {
        let yaml = format!(
            "{MINIMAL}seed: 7\nsampling:\n  sampler: ddpm\n  logging_interval: 0\nmodel:\n  add_conditioning: false\n  sample_class: 9\n"
        );
        let config = TrainConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.sampling.sampler, SamplerKind::Ddpm);
        assert_eq!(config.preview_class(), None);
    }

    fn rejected(edit: impl FnOnce(&mut TrainConfig)) -> String {
        let mut config = TrainConfig::from_yaml(MINIMAL).unwrap();
        edit(&mut config);
        match config.validate() {
            Err(TrainError::InvalidConfig(msg)) => msg,
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_rules() {
        assert!(rejected(|c| c.model_hyperparameters.image_size = 0).contains("image_size"));
        assert!(rejected(|c| c.model_hyperparameters.batch_size = 0).contains("batch_size"));
        assert!(rejected(|c| c.model_hyperparameters.grad_accumulation_steps = 0)
            .contains("grad_accumulation_steps"));
        assert!(rejected(|c| c.model_optimiser.inference_steps = 0).contains("inference_steps"));
        assert!(rejected(|c| c.model_optimiser.inference_steps = 1001).contains("total_steps"));
        assert!(rejected(|c| c.model_optimiser.scheduler_timesteps = 1000)
            .contains("scheduler_timesteps"));
        assert!(rejected(|c| c.model.sample_class = 6).contains("sample_class"));
        assert!(rejected(|c| c.model_optimiser.starting_epoch = 11).contains("starting_epoch"));
        assert!(rejected(|c| c.data.training_filenames.clear()).contains("training_filenames"));
        assert!(rejected(|c| c.data.validation_filenames.push("extra.npy".into()))
            .contains("validation files"));
    }

    #[test]
    fn test_resolution_must_divide_by_downsampling() {
        let config = TrainConfig::from_yaml(MINIMAL).unwrap();
        assert!(config.validate_resolution(32).is_ok());

        let mut config = config;
        config.model_hyperparameters.image_size = 9;
        assert!(config.validate().is_ok());
        match config.validate_resolution(2) {
            Err(TrainError::InvalidConfig(msg)) => assert!(msg.contains("9x9")),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }

        assert!(check_resolution("training images", (64, 48), 16).is_ok());
        assert!(check_resolution("training images", (64, 40), 16).is_err());
    }

    #[test]
    fn test_missing_section_is_a_parse_error() {
        let err = TrainConfig::from_yaml("paths:\n  models_path: x\n  model_name: y\n").unwrap_err();
        assert!(matches!(err, TrainError::ConfigParse(_)));
    }
}
