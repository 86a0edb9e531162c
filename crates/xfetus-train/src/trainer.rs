//! The epoch loop: training with gradient accumulation, validation,
//! previews and checkpointing

use std::path::PathBuf;

use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsAccumulator, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use xfetus_convert::{load_module, load_record, save_module, save_record, CheckpointPaths};
use xfetus_data::DataLoader;
use xfetus_samplers::{NoiseSchedule, Sampler};
use xfetus_unet::UNet2D;

use crate::config::{check_resolution, TrainConfig};
use crate::error::TrainError;
use crate::objective::noise_prediction_loss;
use crate::sample::{generate_with_progress, save_preview};

type AdamOptimizer<B> = OptimizerAdaptor<Adam, UNet2D<B>, B>;

/// Adam with the PyTorch default epsilon rather than burn's 1e-5
pub fn adam_config() -> AdamConfig {
    AdamConfig::new().with_epsilon(1e-8)
}

/// A preview written at the end of an epoch
#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub path: PathBuf,
    pub mean_pixel: f32,
}

/// Outcome of one epoch
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub validation_loss: f64,
    /// Optimizer steps taken so far, across epochs
    pub optimizer_steps: usize,
    /// A checkpoint was written
    pub improved: bool,
    pub preview: Option<Preview>,
}

/// Progress callbacks; every method defaults to doing nothing
pub trait TrainObserver {
    fn on_train_start(&mut self, _epoch: usize, _num_batches: usize) {}

    fn on_train_batch(&mut self, _step: usize, _loss: f32) {}

    fn on_validation_start(&mut self, _epoch: usize, _num_batches: usize) {}

    fn on_validation_batch(&mut self, _step: usize, _loss: f32) {}

    fn on_sampling_step(&mut self, _step: usize, _total: usize) {}

    fn on_epoch_end(&mut self, _summary: &EpochSummary) {}

    fn on_checkpoint(&mut self, _paths: &CheckpointPaths) {}
}

impl TrainObserver for () {}

/// Fine-tunes a UNet2D on the noise-prediction objective
pub struct Trainer<B: AutodiffBackend> {
    unet: UNet2D<B>,
    optimizer: AdamOptimizer<B>,
    accumulator: GradientsAccumulator<UNet2D<B>>,
    schedule: NoiseSchedule,
    sampler: Sampler,
    config: TrainConfig,
    device: B::Device,
    rng: StdRng,
    lowest_validation_loss: f64,
    optimizer_steps: usize,
    pending_batches: usize,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Set up Adam over `unet`
    ///
    /// `schedule` is the training (forward) noise schedule and `sampler` the
    /// preview sampler with its timesteps already set. With
    /// `continues_training`, the UNet and optimizer state are restored from
    /// the configured checkpoint first.
    pub fn new(
        config: TrainConfig,
        unet: UNet2D<B>,
        schedule: NoiseSchedule,
        sampler: Sampler,
        device: B::Device,
    ) -> Result<Self, TrainError> {
        config.validate_resolution(unet.downsample_factor())?;

        let mut unet = unet;
        let mut optimizer = adam_config().init::<B, UNet2D<B>>();

        if config.model_optimiser.continues_training {
            let paths = config.checkpoint_paths();
            log::info!("resuming from {}", paths.model.display());
            unet = load_module(unet, &paths.model, &device)?;
            if paths.optimizer.is_file() {
                let record = load_record::<B, _>(&paths.optimizer, &device)?;
                optimizer = optimizer.load_record(record);
            } else {
                log::warn!(
                    "no optimizer state at {}, starting Adam from scratch",
                    paths.optimizer.display()
                );
            }
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Ok(Self {
            unet,
            optimizer,
            accumulator: GradientsAccumulator::new(),
            schedule,
            sampler,
            lowest_validation_loss: config.model_optimiser.lowest_validation_loss,
            config,
            device,
            rng,
            optimizer_steps: 0,
            pending_batches: 0,
        })
    }

    pub fn model(&self) -> &UNet2D<B> {
        &self.unet
    }

    pub fn into_model(self) -> UNet2D<B> {
        self.unet
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn lowest_validation_loss(&self) -> f64 {
        self.lowest_validation_loss
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer_steps
    }

    /// Batches accumulated since the last optimizer step
    pub fn pending_batches(&self) -> usize {
        self.pending_batches
    }

    /// Train from `starting_epoch` to `epochs`
    pub fn fit(
        &mut self,
        train: &DataLoader<'_>,
        valid: &DataLoader<'_>,
        observer: &mut impl TrainObserver,
    ) -> Result<Vec<EpochSummary>, TrainError> {
        if train.is_empty() {
            return Err(TrainError::EmptyDataset { split: "training" });
        }
        if valid.is_empty() {
            return Err(TrainError::EmptyDataset { split: "validation" });
        }
        let factor = self.unet.downsample_factor();
        check_resolution("training images", train.dataset().image_size(), factor)?;
        check_resolution("validation images", valid.dataset().image_size(), factor)?;

        let start = self.config.model_optimiser.starting_epoch;
        let end = self.config.model_hyperparameters.epochs;
        log::info!("Training started (epochs {start}..{end})");

        let mut summaries = Vec::with_capacity(end.saturating_sub(start));
        for epoch in start..end {
            let train_loss = self.train_epoch(epoch, train, observer);
            let validation_loss = self.validate_epoch(epoch, valid, observer);

            log::info!("Epoch {epoch} average training loss: {train_loss}");
            log::info!("Epoch {epoch} average validation loss: {validation_loss}");

            let interval = self.config.sampling.logging_interval;
            let preview = if interval > 0 && (epoch + 1) % interval == 0 {
                Some(self.preview(epoch, observer)?)
            } else {
                None
            };

            // NaN never compares below the best loss
            let improved = self.lowest_validation_loss > validation_loss;
            if improved {
                let paths = self.save_checkpoint()?;
                self.lowest_validation_loss = validation_loss;
                observer.on_checkpoint(&paths);
            }

            let summary = EpochSummary {
                epoch,
                train_loss,
                validation_loss,
                optimizer_steps: self.optimizer_steps,
                improved,
                preview,
            };
            observer.on_epoch_end(&summary);
            summaries.push(summary);
        }

        Ok(summaries)
    }

    fn train_epoch(
        &mut self,
        epoch: usize,
        loader: &DataLoader<'_>,
        observer: &mut impl TrainObserver,
    ) -> f64 {
        let accumulation = self.config.model_hyperparameters.grad_accumulation_steps;
        let mut data_rng = StdRng::seed_from_u64(self.rng.random());
        let mut losses = Vec::with_capacity(loader.len());

        observer.on_train_start(epoch, loader.len());
        for (step, batch) in loader.epoch(&mut data_rng).enumerate() {
            let (images, labels) = batch.to_tensors::<B>(&self.device);
            let labels = self.config.model.add_conditioning.then_some(labels);

            let loss =
                noise_prediction_loss(&self.unet, &self.schedule, images, labels, &mut self.rng);
            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.unet);
            self.accumulator.accumulate(&self.unet, grads);
            self.pending_batches += 1;

            if (step + 1) % accumulation == 0 {
                self.apply_gradients();
            }

            let loss = loss.into_scalar().elem::<f32>();
            observer.on_train_batch(step, loss);
            losses.push(loss as f64);
        }

        mean(&losses)
    }

    fn apply_gradients(&mut self) {
        let grads = self.accumulator.grads();
        let lr = self.config.model_hyperparameters.learning_rate;
        self.unet = self.optimizer.step(lr, self.unet.clone(), grads);
        self.optimizer_steps += 1;
        self.pending_batches = 0;
    }

    fn validate_epoch(
        &mut self,
        epoch: usize,
        loader: &DataLoader<'_>,
        observer: &mut impl TrainObserver,
    ) -> f64 {
        let unet = self.unet.valid();
        let mut data_rng = StdRng::seed_from_u64(self.rng.random());
        let mut losses = Vec::with_capacity(loader.len());

        observer.on_validation_start(epoch, loader.len());
        for (step, batch) in loader.epoch(&mut data_rng).enumerate() {
            let (images, labels) = batch.to_tensors::<B::InnerBackend>(&self.device);
            let labels = self.config.model.add_conditioning.then_some(labels);

            let loss = noise_prediction_loss(&unet, &self.schedule, images, labels, &mut self.rng);
            let loss = loss.into_scalar().elem::<f32>();
            observer.on_validation_batch(step, loss);
            losses.push(loss as f64);
        }

        mean(&losses)
    }

    fn preview(
        &self,
        epoch: usize,
        observer: &mut impl TrainObserver,
    ) -> Result<Preview, TrainError> {
        let unet = self.unet.valid();
        let images = generate_with_progress(
            &unet,
            &self.sampler,
            self.config.model_hyperparameters.batch_size,
            self.config.model_hyperparameters.image_size,
            self.config.preview_class(),
            &self.device,
            |step, total| observer.on_sampling_step(step, total),
        );

        let path = self
            .config
            .sampling
            .output_dir
            .join(format!("epoch_{epoch:04}.png"));
        let mean_pixel = save_preview(images, &path)?;
        log::info!("Average pixel value: {mean_pixel}");

        Ok(Preview { path, mean_pixel })
    }

    fn save_checkpoint(&self) -> Result<CheckpointPaths, TrainError> {
        let paths = self.config.checkpoint_paths();
        save_module(self.unet.clone(), &paths.model)?;
        save_record::<B, _>(self.optimizer.to_record(), &paths.optimizer)?;
        log::info!("saved checkpoint to {}", paths.model.display());
        Ok(paths)
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}
