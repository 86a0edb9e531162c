//! UNet2D building blocks: ResNet blocks, self-attention, down/up sampling

use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    Linear, LinearConfig, PaddingConfig2d,
};
use burn::prelude::*;

use xfetus_core::attention::scaled_dot_product_attention;
use xfetus_core::groupnorm::GroupNorm;
use xfetus_core::silu::silu;

/// Sinusoidal timestep embedding
///
/// Frequencies are `exp(-ln(10000) * i / (dim/2 - freq_shift))`. The output is
/// `[sin, cos]`, or `[cos, sin]` when `flip_sin_to_cos` is set.
///
/// # Arguments
///
/// * `timesteps` - One (possibly fractional) timestep per sample `[batch]`
/// * `dim` - Embedding dimension (even)
/// * `flip_sin_to_cos` - Put the cosine half first
/// * `freq_shift` - Shift applied to the frequency denominator
pub fn timestep_embedding<B: Backend>(
    timesteps: Tensor<B, 1>,
    dim: usize,
    flip_sin_to_cos: bool,
    freq_shift: f64,
) -> Tensor<B, 2> {
    let half_dim = dim / 2;
    let exponent = -(10000.0f64.ln()) / (half_dim as f64 - freq_shift);

    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| (i as f64 * exponent).exp() as f32)
        .collect();
    let freqs = Tensor::<B, 1>::from_data(TensorData::new(freqs, [half_dim]), &timesteps.device());

    let [batch] = timesteps.dims();
    let args = timesteps.reshape([batch, 1]) * freqs.reshape([1, half_dim]);

    let sin = args.clone().sin();
    let cos = args.cos();

    if flip_sin_to_cos {
        Tensor::cat(vec![cos, sin], 1)
    } else {
        Tensor::cat(vec![sin, cos], 1)
    }
}

fn conv3x3<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

/// ResNet block with time embedding
#[derive(Module, Debug)]
pub struct ResBlock<B: Backend> {
    /// First group normalization
    pub norm1: GroupNorm<B>,
    /// First convolution
    pub conv1: Conv2d<B>,
    /// Time embedding projection
    pub time_emb_proj: Linear<B>,
    /// Second group normalization
    pub norm2: GroupNorm<B>,
    /// Second convolution
    pub conv2: Conv2d<B>,
    /// 1x1 shortcut (when in_channels != out_channels)
    pub conv_shortcut: Option<Conv2d<B>>,
}

impl<B: Backend> ResBlock<B> {
    /// Creates a new residual block
    ///
    /// # Arguments
    ///
    /// * `in_channels` - Number of input channels
    /// * `out_channels` - Number of output channels
    /// * `time_emb_dim` - Dimension of the timestep embedding
    /// * `groups` - GroupNorm groups
    /// * `eps` - GroupNorm epsilon
    /// * `device` - Device to create tensors on
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        time_emb_dim: usize,
        groups: usize,
        eps: f64,
        device: &B::Device,
    ) -> Self {
        let conv_shortcut = if in_channels != out_channels {
            Some(Conv2dConfig::new([in_channels, out_channels], [1, 1]).init(device))
        } else {
            None
        };

        Self {
            norm1: GroupNorm::new(groups, in_channels, eps, device),
            conv1: conv3x3(in_channels, out_channels, device),
            time_emb_proj: LinearConfig::new(time_emb_dim, out_channels).init(device),
            norm2: GroupNorm::new(groups, out_channels, eps, device),
            conv2: conv3x3(out_channels, out_channels, device),
            conv_shortcut,
        }
    }

    /// Forward pass through the residual block
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape `[batch, in_channels, height, width]`
    /// * `time_emb` - Timestep embedding of shape `[batch, time_emb_dim]`
    ///
    /// # Returns
    ///
    /// Output tensor of shape `[batch, out_channels, height, width]`
    pub fn forward(&self, x: Tensor<B, 4>, time_emb: Tensor<B, 2>) -> Tensor<B, 4> {
        let [b, _, _, _] = x.dims();

        let residual = match &self.conv_shortcut {
            Some(conv) => conv.forward(x.clone()),
            None => x.clone(),
        };

        let hidden = self.norm1.forward(x);
        let hidden = silu(hidden);
        let hidden = self.conv1.forward(hidden);

        let time_emb = self.time_emb_proj.forward(silu(time_emb));
        let emb_dim = time_emb.dims()[1];
        let hidden = hidden + time_emb.reshape([b, emb_dim, 1, 1]);

        let hidden = self.norm2.forward(hidden);
        let hidden = silu(hidden);
        let hidden = self.conv2.forward(hidden);

        hidden + residual
    }
}

/// Spatial self-attention with a residual connection
///
/// The diffusers "attention block": one GroupNorm, then q/k/v projections
/// over the flattened `h*w` positions.
#[derive(Module, Debug)]
pub struct AttentionBlock<B: Backend> {
    /// Input normalization
    pub group_norm: GroupNorm<B>,
    /// Query projection
    pub to_q: Linear<B>,
    /// Key projection
    pub to_k: Linear<B>,
    /// Value projection
    pub to_v: Linear<B>,
    /// Output projection
    pub to_out: Linear<B>,
    /// Number of attention heads
    pub num_heads: usize,
}

impl<B: Backend> AttentionBlock<B> {
    /// Creates a new attention block
    ///
    /// `head_dim` of `None` means a single head spanning all channels.
    pub fn new(
        channels: usize,
        head_dim: Option<usize>,
        groups: usize,
        eps: f64,
        device: &B::Device,
    ) -> Self {
        let num_heads = head_dim.map_or(1, |d| (channels / d).max(1));
        let linear = || LinearConfig::new(channels, channels).init(device);

        Self {
            group_norm: GroupNorm::new(groups, channels, eps, device),
            to_q: linear(),
            to_k: linear(),
            to_v: linear(),
            to_out: linear(),
            num_heads,
        }
    }

    /// Self-attention over spatial positions, shape preserving
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = x.dims();
        let residual = x.clone();
        let seq_len = h * w;
        let head_dim = c / self.num_heads;

        // [b, c, h, w] -> [b, h*w, c]
        let hidden = self.group_norm.forward(x);
        let hidden = hidden.reshape([b, c, seq_len]).swap_dims(1, 2);

        let heads = |t: Tensor<B, 3>| {
            t.reshape([b, seq_len, self.num_heads, head_dim])
                .swap_dims(1, 2)
        };
        let q = heads(self.to_q.forward(hidden.clone()));
        let k = heads(self.to_k.forward(hidden.clone()));
        let v = heads(self.to_v.forward(hidden));

        let out = scaled_dot_product_attention(q, k, v);
        let out = out.swap_dims(1, 2).reshape([b, seq_len, c]);
        let out = self.to_out.forward(out);

        // [b, h*w, c] -> [b, c, h, w]
        let out = out.swap_dims(1, 2).reshape([b, c, h, w]);
        out + residual
    }
}

/// Downsample block (stride-2 conv)
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    /// Strided convolution for downsampling
    pub conv: Conv2d<B>,
    /// Symmetric padding of the conv; 0 pads only the right and bottom edges
    pub padding: usize,
}

impl<B: Backend> Downsample<B> {
    /// Creates a new downsample block (2x spatial reduction)
    ///
    /// # Arguments
    ///
    /// * `channels` - Number of input/output channels
    /// * `padding` - diffusers' `downsample_padding`
    /// * `device` - Device to create tensors on
    pub fn new(channels: usize, padding: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([channels, channels], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .init(device);
        Self { conv, padding }
    }

    /// Downsamples input by 2x
    ///
    /// # Returns
    ///
    /// Output tensor of shape `[batch, channels, height/2, width/2]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = if self.padding == 0 {
            pad_right_bottom(x)
        } else {
            x
        };
        self.conv.forward(x)
    }
}

/// Zero-pad one column on the right and one row at the bottom
fn pad_right_bottom<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();
    let device = x.device();
    let x = Tensor::cat(vec![x, Tensor::zeros([b, c, h, 1], &device)], 3);
    Tensor::cat(vec![x, Tensor::zeros([b, c, 1, w + 1], &device)], 2)
}

/// Upsample block using nearest neighbor interpolation followed by convolution
#[derive(Module, Debug)]
pub struct Upsample<B: Backend> {
    /// Convolution after nearest-neighbor upsample
    pub conv: Conv2d<B>,
}

impl<B: Backend> Upsample<B> {
    /// Creates a new upsample block (2x spatial increase)
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv: conv3x3(channels, channels, device),
        }
    }

    /// Upsamples input by 2x using nearest neighbor + convolution
    ///
    /// # Returns
    ///
    /// Output tensor of shape `[batch, channels, height*2, width*2]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = x.dims();

        let x = x.reshape([b, c, h, 1, w, 1]);
        let x = x.repeat_dim(3, 2).repeat_dim(5, 2);
        let x = x.reshape([b, c, h * 2, w * 2]);

        self.conv.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_timestep_embedding_layout() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::zeros([2], &device);

        // At t = 0, sin is 0 and cos is 1
        let emb: Vec<f32> = timestep_embedding(t.clone(), 8, false, 1.0)
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(&emb[0..4], &[0.0; 4]);
        assert_eq!(&emb[4..8], &[1.0; 4]);

        let flipped: Vec<f32> = timestep_embedding(t, 8, true, 1.0)
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(&flipped[0..4], &[1.0; 4]);
    }

    #[test]
    fn test_timestep_embedding_first_frequency_is_one() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::from_floats([0.5], &device);
        let emb: Vec<f32> = timestep_embedding(t, 4, false, 1.0)
            .into_data()
            .to_vec()
            .unwrap();
        assert!((emb[0] - 0.5f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_resblock_channel_change() {
        let device = Default::default();
        let block = ResBlock::<TestBackend>::new(8, 16, 32, 4, 1e-6, &device);
        assert!(block.conv_shortcut.is_some());

        let x = Tensor::<TestBackend, 4>::ones([2, 8, 4, 4], &device);
        let emb = Tensor::<TestBackend, 2>::ones([2, 32], &device);
        assert_eq!(block.forward(x, emb).dims(), [2, 16, 4, 4]);
    }

    #[test]
    fn test_attention_block_heads() {
        let device = Default::default();
        let single = AttentionBlock::<TestBackend>::new(16, None, 4, 1e-6, &device);
        assert_eq!(single.num_heads, 1);
        let multi = AttentionBlock::<TestBackend>::new(16, Some(8), 4, 1e-6, &device);
        assert_eq!(multi.num_heads, 2);

        let x = Tensor::<TestBackend, 4>::ones([1, 16, 3, 5], &device);
        assert_eq!(multi.forward(x).dims(), [1, 16, 3, 5]);
    }

    #[test]
    fn test_down_up_sampling_shapes() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 4, 8, 8], &device);

        for padding in [0, 1] {
            let down = Downsample::<TestBackend>::new(4, padding, &device);
            assert_eq!(down.forward(x.clone()).dims(), [1, 4, 4, 4]);
        }

        let up = Upsample::<TestBackend>::new(4, &device);
        assert_eq!(up.forward(x).dims(), [1, 4, 16, 16]);
    }
}
