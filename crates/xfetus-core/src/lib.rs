//! Core Building Blocks for the xfetus Diffusion Models
//!
//! Layers shared by the UNet and the training code.
//!
//! # Modules
//!
//! - [`groupnorm`] - Trainable group normalization (used throughout the UNet)
//! - [`silu`] - SiLU/Swish activation
//! - [`attention`] - Scaled dot-product attention over `[batch, heads, seq, dim]`

pub mod attention;
pub mod groupnorm;
pub mod silu;

pub use attention::scaled_dot_product_attention;
pub use groupnorm::GroupNorm;
pub use silu::silu;
