//! Group normalization implementation
//!
//! Provides group normalization as used in UNet architectures.
//! Divides channels into groups and normalizes within each group.

use burn::module::Param;
use burn::prelude::*;

/// Group normalization module
///
/// Divides channels into groups and normalizes each group independently.
/// Unlike batch normalization it behaves the same at batch size 1, which is
/// what diffusion UNets are trained and sampled with.
///
/// # Formula
///
/// For input with C channels divided into G groups:
/// ```text
/// y = (x - mean(x_group)) / sqrt(var(x_group) + eps) * weight + bias
/// ```
///
/// # Reference
///
/// "Group Normalization" - Wu & He, 2018
#[derive(Module, Debug)]
pub struct GroupNorm<B: Backend> {
    /// Number of groups to divide channels into
    pub num_groups: usize,
    /// Scale parameter (gamma), shape [num_channels]
    pub weight: Param<Tensor<B, 1>>,
    /// Bias parameter (beta), shape [num_channels]
    pub bias: Param<Tensor<B, 1>>,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> GroupNorm<B> {
    /// Creates a new group normalization module
    ///
    /// # Arguments
    ///
    /// * `num_groups` - Number of groups to divide channels into (typically 32)
    /// * `num_channels` - Total number of input channels (must be divisible by num_groups)
    /// * `eps` - Variance epsilon (diffusers UNet2D uses 1e-6)
    /// * `device` - Device to create tensors on
    pub fn new(num_groups: usize, num_channels: usize, eps: f64, device: &B::Device) -> Self {
        assert!(
            num_channels % num_groups == 0,
            "num_channels ({num_channels}) must be divisible by num_groups ({num_groups})"
        );
        Self {
            num_groups,
            weight: Param::from_tensor(Tensor::ones([num_channels], device)),
            bias: Param::from_tensor(Tensor::zeros([num_channels], device)),
            eps,
        }
    }

    /// Builds a group norm from pretrained scale and shift tensors
    pub fn from_weight_bias(
        num_groups: usize,
        weight: Tensor<B, 1>,
        bias: Tensor<B, 1>,
        eps: f64,
    ) -> Self {
        Self {
            num_groups,
            weight: Param::from_tensor(weight),
            bias: Param::from_tensor(bias),
            eps,
        }
    }

    /// Number of channels this norm was built for
    pub fn num_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Applies group normalization to a 4D tensor
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape `[batch, channels, height, width]`
    ///
    /// # Returns
    ///
    /// Normalized tensor with same shape as input
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        let group_size = channels / self.num_groups;

        // [batch, num_groups, group_size * height * width]
        let x = x.reshape([batch, self.num_groups, group_size * height * width]);

        let mean = x.clone().mean_dim(2);
        let centered = x - mean;
        let var = centered.clone().powi_scalar(2).mean_dim(2);

        let x = centered / (var + self.eps).sqrt();
        let x = x.reshape([batch, channels, height, width]);

        let weight = self.weight.val().reshape([1, channels, 1, 1]);
        let bias = self.bias.val().reshape([1, channels, 1, 1]);

        x * weight + bias
    }
}
