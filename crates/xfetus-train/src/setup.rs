//! Datasets and model construction from a [`TrainConfig`]

use std::path::Path;

use burn::prelude::*;
use xfetus_convert::{
    load_module, load_scheduler_config, load_unet2d, load_unet2d_config, UNet2DFiles,
};
use xfetus_data::PrecomputedFetalPlaneDataset;
use xfetus_samplers::{NoiseSchedule, SchedulerConfig};
use xfetus_unet::{UNet2D, UNet2DConfig};

use crate::config::TrainConfig;
use crate::error::TrainError;

/// Training and validation splits read from `models_dir()`
pub fn load_datasets(
    config: &TrainConfig,
) -> Result<(PrecomputedFetalPlaneDataset, PrecomputedFetalPlaneDataset), TrainError> {
    let dir = config.models_dir();
    let train = PrecomputedFetalPlaneDataset::open(&dir, &config.data.training_filenames)?;
    let valid = PrecomputedFetalPlaneDataset::open(&dir, &config.data.validation_filenames)?;

    if train.is_empty() {
        return Err(TrainError::EmptyDataset { split: "training" });
    }
    if valid.is_empty() {
        return Err(TrainError::EmptyDataset { split: "validation" });
    }

    let size = config.model_hyperparameters.image_size;
    if train.image_size() != (size, size) {
        log::warn!(
            "training images are {:?} but image_size is {size}; previews use {size}x{size}",
            train.image_size()
        );
    }
    Ok((train, valid))
}

/// The network to fine-tune and its training noise schedule
pub struct ModelSetup<B: Backend> {
    pub unet: UNet2D<B>,
    pub unet_config: UNet2DConfig,
    pub schedule: NoiseSchedule,
}

/// Load the pretrained pipeline, or initialise the celebahq architecture
///
/// With `add_conditioning` a fresh class embedding over `num_classes()` is
/// attached, replacing any the checkpoint carried.
pub fn load_model<B: Backend>(
    config: &TrainConfig,
    device: &B::Device,
) -> Result<ModelSetup<B>, TrainError> {
    let (unet, unet_config, scheduler_config) = match &config.model.pretrained {
        Some(path) => {
            let (unet, unet_config) = load_unet2d::<B>(path, device)?;
            (unet, unet_config, load_scheduler_config(path)?)
        }
        None => {
            log::warn!("no pretrained model configured, initialising UNet2D randomly");
            let unet_config = UNet2DConfig::ddpm_celebahq_256();
            (
                unet_config.init::<B>(device),
                unet_config,
                SchedulerConfig::default(),
            )
        }
    };
    config.validate_resolution(unet_config.downsample_factor())?;

    let unet = if config.model.add_conditioning {
        unet.with_class_conditioning(config.num_classes(), device)
    } else {
        unet
    };

    Ok(ModelSetup {
        unet,
        unet_config,
        schedule: NoiseSchedule::from_config(&scheduler_config),
    })
}

/// A UNet restored from a training checkpoint
///
/// The architecture comes from the configured pretrained model (or the
/// celebahq preset) and the class embedding from `add_conditioning`; only
/// the parameters are read from `checkpoint`.
pub fn load_checkpoint_model<B: Backend>(
    config: &TrainConfig,
    checkpoint: &Path,
    device: &B::Device,
) -> Result<(UNet2D<B>, UNet2DConfig), TrainError> {
    let unet_config = match &config.model.pretrained {
        Some(path) => load_unet2d_config(&UNet2DFiles::resolve(path)?.config)?,
        None => UNet2DConfig::ddpm_celebahq_256(),
    };
    config.validate_resolution(unet_config.downsample_factor())?;

    let unet = unet_config.init::<B>(device);
    let unet = if config.model.add_conditioning {
        unet.with_class_conditioning(config.num_classes(), device)
    } else {
        unet
    };

    log::info!("loading checkpoint {}", checkpoint.display());
    let unet = load_module(unet, checkpoint, device)?;
    Ok((unet, unet_config))
}
