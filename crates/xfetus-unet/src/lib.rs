//! UNet2D Diffusion Backbone
//!
//! A pixel-space UNet matching diffusers' `UNet2DModel`, so DDPM checkpoints
//! such as `google/ddpm-celebahq-256` load without remapping, plus an
//! optional class embedding for conditional training.
//!
//! # Building Blocks
//!
//! - [`ResBlock`] - Residual convolution block with timestep injection
//! - [`AttentionBlock`] - Spatial self-attention
//! - [`Downsample`], [`Upsample`] - Resolution scaling
//!
//! # Example
//!
//! ```ignore
//! use xfetus_unet::UNet2DConfig;
//!
//! let unet = UNet2DConfig::ddpm_celebahq_256()
//!     .init::<Backend>(&device)
//!     .with_class_conditioning(6, &device);
//!
//! let noise_pred = unet.forward(noisy_images, timesteps, Some(class_labels));
//! ```

pub mod blocks;
pub mod unet2d;

pub use blocks::{timestep_embedding, AttentionBlock, Downsample, ResBlock, Upsample};
pub use unet2d::{
    DownBlock, DownBlockType, MidBlock, TimestepEmbedding, UNet2D, UNet2DConfig, UpBlock,
    UpBlockType,
};
