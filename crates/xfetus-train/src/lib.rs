//! Class-Conditioned DDPM Training
//!
//! Fine-tunes a pretrained UNet2D on precomputed fetal ultrasound planes with
//! the noise-prediction objective, validating every epoch, sampling previews
//! and checkpointing on improvement.
//!
//! ```ignore
//! use xfetus_data::DataLoader;
//! use xfetus_train::{load_datasets, load_model, TrainConfig, Trainer};
//!
//! let config = TrainConfig::from_file("config.yaml")?;
//! let (train, valid) = load_datasets(&config)?;
//! let model = load_model::<Backend>(&config, &device)?;
//! let sampler = config.build_sampler()?;
//!
//! let mut trainer = Trainer::new(config, model.unet, model.schedule, sampler, device)?;
//! let summaries = trainer.fit(&DataLoader::new(&train, 8), &DataLoader::new(&valid, 8), &mut ())?;
//! ```

pub mod config;
pub mod error;
pub mod objective;
pub mod sample;
pub mod setup;
pub mod trainer;

pub use config::{
    DataConfig, HyperParameters, ModelConfig, OptimiserConfig, PathsConfig, SamplingConfig,
    TrainConfig,
};
pub use error::TrainError;
pub use objective::noise_prediction_loss;
pub use sample::{generate, generate_with_progress, save_preview, to_rgb_image, IMAGE_CHANNELS};
pub use setup::{load_checkpoint_model, load_datasets, load_model, ModelSetup};
pub use trainer::{adam_config, EpochSummary, Preview, TrainObserver, Trainer};
