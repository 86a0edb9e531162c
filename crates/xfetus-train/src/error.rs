use std::path::PathBuf;

use thiserror::Error;
use xfetus_convert::{SerializeError, UnetLoadError};
use xfetus_data::DataError;
use xfetus_samplers::SamplerError;

/// Errors raised while setting up or running training
#[derive(Error, Debug)]
pub enum TrainError {
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Model(#[from] UnetLoadError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] SerializeError),

    #[error(transparent)]
    Sampler(#[from] SamplerError),

    #[error("the {split} set has no images")]
    EmptyDataset { split: &'static str },

    #[error("failed to read tensor data: {0}")]
    TensorData(String),

    #[error("failed to write image: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
