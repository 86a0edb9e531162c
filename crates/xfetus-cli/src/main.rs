//! xfetus CLI
//!
//! Fine-tunes a class-conditioned DDPM on fetal ultrasound planes and
//! samples images from its checkpoints.
//!
//! Supports:
//! - Training from a YAML config (`train`)
//! - Class-conditioned sampling from a checkpoint (`sample`)
//! - Exporting a checkpoint as a diffusers UNet folder (`export`)

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burn::backend::Autodiff;
use burn::prelude::*;
use clap::{Parser, Subcommand, ValueEnum};

use xfetus_convert::save_unet2d;
use xfetus_data::{Augmentation, DataLoader, FetalPlaneClass};
use xfetus_train::{
    generate, load_checkpoint_model, load_datasets, load_model, to_rgb_image, TrainConfig, Trainer,
};

mod backends;
mod progress;

use progress::ProgressObserver;

/// Compute device
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum Device {
    /// Auto-detect best available (CUDA > WGPU > CPU)
    #[default]
    Auto,
    /// NVIDIA CUDA GPU
    #[cfg(feature = "cuda")]
    Cuda,
    /// WebGPU (Vulkan/Metal/DX12)
    #[cfg(feature = "wgpu")]
    Wgpu,
    /// CPU (ndarray backend)
    #[cfg(feature = "ndarray")]
    Cpu,
}

#[derive(Parser)]
#[command(name = "xfetus")]
#[command(about = "Class-conditioned DDPM for fetal ultrasound planes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune the diffusion model
    Train {
        /// YAML training config
        #[arg(short, long = "config_file", visible_alias = "config")]
        config: PathBuf,

        /// Compute device (auto = detect best available)
        #[arg(long, value_enum, default_value = "auto")]
        device: Device,
    },

    /// Generate images from a training checkpoint
    Sample {
        /// YAML training config the checkpoint was trained with
        #[arg(short, long)]
        config: PathBuf,

        /// Checkpoint file (default: the config's model path)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Class index to condition on (default: the config's sample_class)
        #[arg(long)]
        class: Option<usize>,

        /// Output image path; numbered when --count > 1
        #[arg(short, long, default_value = "sample.png")]
        output: PathBuf,

        /// Number of images
        #[arg(long, default_value = "1")]
        count: usize,

        /// Compute device (auto = detect best available)
        #[arg(long, value_enum, default_value = "auto")]
        device: Device,
    },

    /// Write a checkpoint as a diffusers UNet2D folder
    Export {
        /// YAML training config the checkpoint was trained with
        #[arg(short, long)]
        config: PathBuf,

        /// Checkpoint file (default: the config's model path)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Output folder
        #[arg(short, long)]
        output: PathBuf,

        /// Compute device (auto = detect best available)
        #[arg(long, value_enum, default_value = "auto")]
        device: Device,
    },

    /// Show information about available backends
    Info,
}

/// Resolve Auto device to a concrete device
fn resolve_device(requested: Device) -> Result<Device> {
    match requested {
        Device::Auto => {
            #[cfg(feature = "cuda")]
            if backends::cuda_available() {
                log::info!("auto-detected CUDA");
                return Ok(Device::Cuda);
            }
            #[cfg(feature = "wgpu")]
            if backends::wgpu_available() {
                log::info!("auto-detected WGPU");
                return Ok(Device::Wgpu);
            }
            #[cfg(feature = "ndarray")]
            {
                log::info!("falling back to CPU");
                return Ok(Device::Cpu);
            }
            #[allow(unreachable_code)]
            {
                bail!("no backend available; enable the 'cuda', 'wgpu' or 'ndarray' feature")
            }
        }
        other => Ok(other),
    }
}

/// Run a backend-generic function on the requested device
macro_rules! on_device {
    ($device:expr, $run:ident ( $($arg:expr),* $(,)? )) => {
        match resolve_device($device)? {
            #[cfg(feature = "cuda")]
            Device::Cuda => $run::<backends::Cuda>($($arg,)* &backends::CudaDevice::default()),
            #[cfg(feature = "wgpu")]
            Device::Wgpu => $run::<backends::Wgpu>($($arg,)* &backends::WgpuDevice::default()),
            #[cfg(feature = "ndarray")]
            Device::Cpu => $run::<backends::NdArray>($($arg,)* &backends::NdArrayDevice::default()),
            Device::Auto => unreachable!("Auto should be resolved above"),
        }
    };
}

fn load_config(path: &Path) -> Result<TrainConfig> {
    TrainConfig::from_file(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn run_train<B: Backend>(config: TrainConfig, device: &B::Device) -> Result<()> {
    let (train, valid) = load_datasets(&config).context("Failed to load datasets")?;
    println!(
        "Training images: {} {:?}, validation images: {}",
        train.len(),
        train.class_counts(),
        valid.len()
    );

    let model = load_model::<Autodiff<B>>(&config, device).context("Failed to load model")?;
    let sampler = config.build_sampler()?;

    let batch_size = config.model_hyperparameters.batch_size;
    let augmentation = config.data.augment.then(Augmentation::default);
    let train_loader = DataLoader::new(&train, batch_size).with_augmentation(augmentation);
    let valid_loader = DataLoader::new(&valid, batch_size);

    let mut observer = ProgressObserver::new(config.model_hyperparameters.epochs)?;
    let mut trainer =
        Trainer::<Autodiff<B>>::new(config, model.unet, model.schedule, sampler, device.clone())
            .context("Failed to set up training")?;
    let summaries = trainer.fit(&train_loader, &valid_loader, &mut observer)?;

    let improved = summaries.iter().filter(|s| s.improved).count();
    println!(
        "\nTrained {} epochs ({} checkpoints), lowest validation loss {:.6}",
        summaries.len(),
        improved,
        trainer.lowest_validation_loss()
    );
    Ok(())
}

fn run_sample<B: Backend>(
    config: TrainConfig,
    checkpoint: PathBuf,
    class: Option<usize>,
    output: PathBuf,
    count: usize,
    device: &B::Device,
) -> Result<()> {
    if count == 0 {
        bail!("--count must be at least 1");
    }
    if let Some(class) = class {
        if class >= config.num_classes() {
            bail!(
                "class {class} is out of range for {} classes",
                config.num_classes()
            );
        }
    }
    let class = class.or(config.preview_class());

    let (unet, _) = load_checkpoint_model::<B>(&config, &checkpoint, device)
        .with_context(|| format!("Failed to load checkpoint {}", checkpoint.display()))?;
    let sampler = config.build_sampler()?;

    let label = class
        .map(|c| match FetalPlaneClass::from_index(c) {
            Some(plane) => plane.to_string(),
            None => format!("class {c}"),
        })
        .unwrap_or_else(|| "unconditioned".to_string());
    println!(
        "Sampling {count} image(s) ({label}) with {} {} steps",
        sampler.timesteps().len(),
        sampler.kind()
    );

    let size = config.model_hyperparameters.image_size;
    let images = generate(&unet, &sampler, count, size, class, device);
    let mean = images.clone().mean().into_scalar().elem::<f32>();
    println!("Average pixel value: {mean}");

    for i in 0..count {
        let path = numbered_path(&output, i, count);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        to_rgb_image(images.clone(), i)?
            .save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved {}", path.display());
    }
    Ok(())
}

/// `out.png` for a single image, `out_0.png`, `out_1.png`, ... otherwise
fn numbered_path(output: &Path, index: usize, count: usize) -> PathBuf {
    if count == 1 {
        return output.to_path_buf();
    }
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sample".to_string());
    let ext = output
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "png".to_string());
    output.with_file_name(format!("{stem}_{index}.{ext}"))
}

fn run_export<B: Backend>(
    config: TrainConfig,
    checkpoint: PathBuf,
    output: PathBuf,
    device: &B::Device,
) -> Result<()> {
    let (unet, unet_config) = load_checkpoint_model::<B>(&config, &checkpoint, device)
        .with_context(|| format!("Failed to load checkpoint {}", checkpoint.display()))?;
    save_unet2d(&unet, &unet_config, &output)
        .with_context(|| format!("Failed to export to {}", output.display()))?;
    println!("Exported UNet2D to {}", output.display());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Train { config, device } => {
            let config = load_config(&config)?;
            println!("xfetus: class-conditioned DDPM training\n");
            println!("Configuration:");
            println!("  Data:     {}", config.models_dir().display());
            println!("  Model:    {}", config.checkpoint_paths().model.display());
            println!(
                "  Epochs:   {}..{}",
                config.model_optimiser.starting_epoch, config.model_hyperparameters.epochs
            );
            println!("  Batch:    {}", config.model_hyperparameters.batch_size);
            println!(
                "  Accumulation: {}",
                config.model_hyperparameters.grad_accumulation_steps
            );
            println!("  Sampler:  {}", config.sampling.sampler);
            println!("  Device:   {:?}\n", device);

            on_device!(device, run_train(config))
        }

        Commands::Sample {
            config,
            checkpoint,
            class,
            output,
            count,
            device,
        } => {
            let config = load_config(&config)?;
            let checkpoint = checkpoint.unwrap_or_else(|| config.checkpoint_paths().model);
            on_device!(device, run_sample(config, checkpoint, class, output, count))
        }

        Commands::Export {
            config,
            checkpoint,
            output,
            device,
        } => {
            let config = load_config(&config)?;
            let checkpoint = checkpoint.unwrap_or_else(|| config.checkpoint_paths().model);
            on_device!(device, run_export(config, checkpoint, output))
        }

        Commands::Info => {
            println!("xfetus: class-conditioned DDPM for fetal ultrasound planes\n");
            println!("Available backends:");

            #[cfg(feature = "ndarray")]
            println!("  - ndarray (CPU, enabled)");
            #[cfg(not(feature = "ndarray"))]
            println!("  - ndarray (CPU, not enabled)");

            #[cfg(feature = "wgpu")]
            println!("  - wgpu (WebGPU, enabled)");
            #[cfg(not(feature = "wgpu"))]
            println!("  - wgpu (WebGPU, not enabled)");

            #[cfg(feature = "cuda")]
            println!("  - cuda (NVIDIA CUDA, enabled)");
            #[cfg(not(feature = "cuda"))]
            println!("  - cuda (NVIDIA CUDA, not enabled)");

            println!("\nClasses:");
            for class in FetalPlaneClass::ALL {
                println!("  {} - {}", class.index(), class);
            }

            println!("\nSamplers:");
            println!("  - ddim (default)");
            println!("  - ddpm");

            Ok(())
        }
    }
}
