//! Weight Loading and Serialization
//!
//! Reads pretrained diffusers `UNet2DModel` checkpoints into burn modules and
//! stores training checkpoints as burn records.
//!
//! # Weight Loading
//!
//! ```ignore
//! use xfetus_convert::{load_scheduler_config, load_unet2d};
//!
//! let (unet, unet_config) = load_unet2d::<Backend>("ddpm-celebahq-256/", &device)?;
//! let scheduler = load_scheduler_config("ddpm-celebahq-256/")?;
//! ```
//!
//! # Checkpoints
//!
//! - [`save_module`] / [`load_module`] - network parameters
//! - [`save_record`] / [`load_record`] - optimizer state
//! - [`save_unet2d`] - export back to the diffusers layout

pub mod loader;
pub mod pipeline;
pub mod serialize;
pub mod unet2d;

pub use loader::{LoadError, SafeTensorFile};
pub use pipeline::load_scheduler_config;
pub use serialize::{
    checkpoint_paths, full_precision_recorder, load_module, load_record, save_module,
    save_record, BinFileRecorder, CheckpointPaths, FullPrecisionSettings, Recorder,
    RecorderError, SerializeError,
};
pub use unet2d::{
    load_unet2d, load_unet2d_config, save_unet2d, visit_unet2d, UNet2DFiles, UnetLoadError,
    UnetVisitor,
};
