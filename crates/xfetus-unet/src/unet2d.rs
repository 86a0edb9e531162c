//! Pixel-space UNet2D
//!
//! The denoiser of the diffusers `UNet2DModel` family (DDPM CelebA-HQ,
//! CIFAR-10, church, bedroom). Field names follow the diffusers state dict so
//! pretrained weights map one to one.

use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    Embedding, EmbeddingConfig, Linear, LinearConfig, PaddingConfig2d,
};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use xfetus_core::groupnorm::GroupNorm;
use xfetus_core::silu::silu;

use crate::blocks::{timestep_embedding, AttentionBlock, Downsample, ResBlock, Upsample};

/// Encoder block variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownBlockType {
    DownBlock2D,
    AttnDownBlock2D,
}

/// Decoder block variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpBlockType {
    UpBlock2D,
    AttnUpBlock2D,
}

/// UNet2D configuration
///
/// Deserializes from a diffusers `unet/config.json`. Missing keys take the
/// `google/ddpm-celebahq-256` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UNet2DConfig {
    /// Training resolution
    pub sample_size: usize,
    /// Input image channels
    pub in_channels: usize,
    /// Output (predicted noise) channels
    pub out_channels: usize,
    /// Output channels of each down block
    pub block_out_channels: Vec<usize>,
    pub down_block_types: Vec<DownBlockType>,
    pub up_block_types: Vec<UpBlockType>,
    /// ResNets per down block (up blocks have one more)
    pub layers_per_block: usize,
    /// Channels per attention head; `None` means one head
    pub attention_head_dim: Option<usize>,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    /// Timestep embedding layout
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
    /// 0 pads right/bottom before the stride-2 conv
    pub downsample_padding: usize,
    /// Size of the class embedding table, if any
    pub num_class_embeds: Option<usize>,
}

impl Default for UNet2DConfig {
    fn default() -> Self {
        Self::ddpm_celebahq_256()
    }
}

impl UNet2DConfig {
    /// `google/ddpm-celebahq-256`
    pub fn ddpm_celebahq_256() -> Self {
        use DownBlockType::*;
        use UpBlockType::*;

        Self {
            sample_size: 256,
            in_channels: 3,
            out_channels: 3,
            block_out_channels: vec![128, 128, 256, 256, 512, 512],
            down_block_types: vec![
                DownBlock2D,
                DownBlock2D,
                DownBlock2D,
                DownBlock2D,
                AttnDownBlock2D,
                DownBlock2D,
            ],
            up_block_types: vec![
                UpBlock2D,
                AttnUpBlock2D,
                UpBlock2D,
                UpBlock2D,
                UpBlock2D,
                UpBlock2D,
            ],
            layers_per_block: 2,
            attention_head_dim: None,
            norm_num_groups: 32,
            norm_eps: 1e-6,
            flip_sin_to_cos: false,
            freq_shift: 1.0,
            downsample_padding: 0,
            num_class_embeds: None,
        }
    }

    /// Two-level network for tests and smoke runs
    pub fn tiny() -> Self {
        Self {
            sample_size: 16,
            in_channels: 3,
            out_channels: 3,
            block_out_channels: vec![16, 32],
            down_block_types: vec![DownBlockType::DownBlock2D, DownBlockType::AttnDownBlock2D],
            up_block_types: vec![UpBlockType::AttnUpBlock2D, UpBlockType::UpBlock2D],
            layers_per_block: 1,
            attention_head_dim: None,
            norm_num_groups: 8,
            norm_eps: 1e-6,
            flip_sin_to_cos: true,
            freq_shift: 0.0,
            downsample_padding: 1,
            num_class_embeds: None,
        }
    }

    /// Check that the block lists agree with each other
    pub fn validate(&self) -> Result<(), String> {
        let levels = self.block_out_channels.len();
        if levels == 0 {
            return Err("block_out_channels is empty".into());
        }
        if self.down_block_types.len() != levels || self.up_block_types.len() != levels {
            return Err(format!(
                "expected {levels} down and up blocks, got {} and {}",
                self.down_block_types.len(),
                self.up_block_types.len()
            ));
        }
        if let Some(&ch) = self
            .block_out_channels
            .iter()
            .find(|&&ch| ch % self.norm_num_groups != 0)
        {
            return Err(format!(
                "{ch} channels are not divisible into {} groups",
                self.norm_num_groups
            ));
        }
        Ok(())
    }

    /// Spatial reduction between the input and the mid block
    ///
    /// Image sides must be a multiple of this for the skip connections to
    /// line up.
    pub fn downsample_factor(&self) -> usize {
        1 << self.block_out_channels.len().saturating_sub(1)
    }

    /// Build a randomly initialised network
    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet2D<B> {
        UNet2D::new(self, device)
    }
}

/// Timestep MLP: `linear_2(silu(linear_1(x)))`
#[derive(Module, Debug)]
pub struct TimestepEmbedding<B: Backend> {
    pub linear_1: Linear<B>,
    pub linear_2: Linear<B>,
}

impl<B: Backend> TimestepEmbedding<B> {
    fn new(in_dim: usize, embed_dim: usize, device: &B::Device) -> Self {
        Self {
            linear_1: LinearConfig::new(in_dim, embed_dim).init(device),
            linear_2: LinearConfig::new(embed_dim, embed_dim).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear_2.forward(silu(self.linear_1.forward(x)))
    }
}

/// Pixel-space UNet with timestep and optional class conditioning
#[derive(Module, Debug)]
pub struct UNet2D<B: Backend> {
    /// Input convolution
    pub conv_in: Conv2d<B>,
    /// Timestep MLP
    pub time_embedding: TimestepEmbedding<B>,
    /// Class label embedding added to the timestep embedding
    pub class_embedding: Option<Embedding<B>>,

    /// Encoder path
    pub down_blocks: Vec<DownBlock<B>>,
    pub mid_block: MidBlock<B>,
    /// Decoder path
    pub up_blocks: Vec<UpBlock<B>>,

    /// Output group normalization
    pub conv_norm_out: GroupNorm<B>,
    /// Output convolution
    pub conv_out: Conv2d<B>,

    /// Width of the sinusoidal timestep projection
    pub base_channels: usize,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
}

impl<B: Backend> UNet2D<B> {
    /// Creates a new UNet2D
    ///
    /// # Panics
    ///
    /// If the config fails [`UNet2DConfig::validate`].
    pub fn new(config: &UNet2DConfig, device: &B::Device) -> Self {
        if let Err(msg) = config.validate() {
            panic!("invalid UNet2D config: {msg}");
        }

        let groups = config.norm_num_groups;
        let eps = config.norm_eps;
        let ch = config.block_out_channels[0];
        let time_embed_dim = ch * 4;
        let levels = config.block_out_channels.len();

        let conv_in = Conv2dConfig::new([config.in_channels, ch], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        // Channel count of every skip tensor pushed on the way down
        let mut skip_channels = vec![ch];
        let mut down_blocks = Vec::with_capacity(levels);
        let mut output_channel = ch;

        for (level, block_type) in config.down_block_types.iter().enumerate() {
            let input_channel = output_channel;
            output_channel = config.block_out_channels[level];
            let is_final = level == levels - 1;

            let mut resnets = Vec::with_capacity(config.layers_per_block);
            let mut attentions = Vec::new();
            for layer in 0..config.layers_per_block {
                let in_ch = if layer == 0 { input_channel } else { output_channel };
                resnets.push(ResBlock::new(in_ch, output_channel, time_embed_dim, groups, eps, device));
                if *block_type == DownBlockType::AttnDownBlock2D {
                    attentions.push(AttentionBlock::new(
                        output_channel,
                        config.attention_head_dim,
                        groups,
                        eps,
                        device,
                    ));
                }
                skip_channels.push(output_channel);
            }

            let downsampler = if is_final {
                None
            } else {
                skip_channels.push(output_channel);
                Some(Downsample::new(output_channel, config.downsample_padding, device))
            };

            down_blocks.push(DownBlock {
                resnets,
                attentions,
                downsampler,
            });
        }

        let mid_ch = output_channel;
        let mid_block = MidBlock {
            resnets: vec![
                ResBlock::new(mid_ch, mid_ch, time_embed_dim, groups, eps, device),
                ResBlock::new(mid_ch, mid_ch, time_embed_dim, groups, eps, device),
            ],
            attention: AttentionBlock::new(mid_ch, config.attention_head_dim, groups, eps, device),
        };

        let mut up_blocks = Vec::with_capacity(levels);
        let mut prev_output_channel = mid_ch;

        for (level, block_type) in config.up_block_types.iter().enumerate() {
            let output_channel = config.block_out_channels[levels - 1 - level];
            let is_final = level == levels - 1;

            let mut resnets = Vec::with_capacity(config.layers_per_block + 1);
            let mut attentions = Vec::new();
            for layer in 0..=config.layers_per_block {
                let skip_ch = skip_channels
                    .pop()
                    .expect("one skip connection per up resnet");
                let in_ch = if layer == 0 { prev_output_channel } else { output_channel };
                resnets.push(ResBlock::new(
                    in_ch + skip_ch,
                    output_channel,
                    time_embed_dim,
                    groups,
                    eps,
                    device,
                ));
                if *block_type == UpBlockType::AttnUpBlock2D {
                    attentions.push(AttentionBlock::new(
                        output_channel,
                        config.attention_head_dim,
                        groups,
                        eps,
                        device,
                    ));
                }
            }

            let upsampler = (!is_final).then(|| Upsample::new(output_channel, device));
            up_blocks.push(UpBlock {
                resnets,
                attentions,
                upsampler,
            });
            prev_output_channel = output_channel;
        }

        let conv_out = Conv2dConfig::new([ch, config.out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        let class_embedding = config
            .num_class_embeds
            .map(|n| EmbeddingConfig::new(n, time_embed_dim).init(device));

        Self {
            conv_in,
            time_embedding: TimestepEmbedding::new(ch, time_embed_dim, device),
            class_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out: GroupNorm::new(groups, ch, eps, device),
            conv_out,
            base_channels: ch,
            flip_sin_to_cos: config.flip_sin_to_cos,
            freq_shift: config.freq_shift,
        }
    }

    /// Dimension of the timestep (and class) embedding
    pub fn time_embed_dim(&self) -> usize {
        self.time_embedding.linear_1.weight.dims()[1]
    }

    /// See [`UNet2DConfig::downsample_factor`]
    pub fn downsample_factor(&self) -> usize {
        let downsamplers = self
            .down_blocks
            .iter()
            .filter(|block| block.downsampler.is_some())
            .count();
        1 << downsamplers
    }

    /// Number of classes the class embedding was built for
    pub fn num_classes(&self) -> Option<usize> {
        self.class_embedding
            .as_ref()
            .map(|embedding| embedding.weight.dims()[0])
    }

    /// Attach a freshly initialised class embedding
    ///
    /// Replaces any existing one. The rest of the network is untouched, so
    /// this adds conditioning to a pretrained unconditional model.
    pub fn with_class_conditioning(mut self, num_classes: usize, device: &B::Device) -> Self {
        self.class_embedding =
            Some(EmbeddingConfig::new(num_classes, self.time_embed_dim()).init(device));
        self
    }

    /// Predict the noise in `x`
    ///
    /// # Arguments
    /// * `x` - Noisy images [batch, in_channels, h, w]
    /// * `timesteps` - Timestep per sample [batch], or [1] for the whole batch
    /// * `class_labels` - Class per sample [batch] or [1]; ignored without a class embedding
    ///
    /// # Returns
    /// Predicted noise [batch, out_channels, h, w]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        timesteps: Tensor<B, 1>,
        class_labels: Option<Tensor<B, 1, Int>>,
    ) -> Tensor<B, 4> {
        let [batch, _, _, _] = x.dims();

        let timesteps = if timesteps.dims()[0] == 1 && batch > 1 {
            timesteps.repeat_dim(0, batch)
        } else {
            timesteps
        };
        let t_emb = timestep_embedding(
            timesteps,
            self.base_channels,
            self.flip_sin_to_cos,
            self.freq_shift,
        );
        let mut emb = self.time_embedding.forward(t_emb);

        if let (Some(embedding), Some(labels)) = (&self.class_embedding, class_labels) {
            let labels = if labels.dims()[0] == 1 && batch > 1 {
                labels.repeat_dim(0, batch)
            } else {
                labels
            };
            let [n] = labels.dims();
            let class_emb = embedding.forward(labels.reshape([n, 1]));
            let [_, _, dim] = class_emb.dims();
            emb = emb + class_emb.reshape([n, dim]);
        }

        let mut h = self.conv_in.forward(x);

        let mut skips = vec![h.clone()];
        for block in &self.down_blocks {
            h = block.forward(h, emb.clone(), &mut skips);
        }

        h = self.mid_block.forward(h, emb.clone());

        for block in &self.up_blocks {
            h = block.forward(h, emb.clone(), &mut skips);
        }

        let h = self.conv_norm_out.forward(h);
        self.conv_out.forward(silu(h))
    }
}

/// Encoder block: ResNets (+ attention) and an optional downsampler
#[derive(Module, Debug)]
pub struct DownBlock<B: Backend> {
    pub resnets: Vec<ResBlock<B>>,
    /// Empty for plain `DownBlock2D`
    pub attentions: Vec<AttentionBlock<B>>,
    pub downsampler: Option<Downsample<B>>,
}

impl<B: Backend> DownBlock<B> {
    /// Forward pass, pushing one skip tensor per resnet and one after downsampling
    fn forward(
        &self,
        x: Tensor<B, 4>,
        emb: Tensor<B, 2>,
        skips: &mut Vec<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let mut h = x;
        for (i, resnet) in self.resnets.iter().enumerate() {
            h = resnet.forward(h, emb.clone());
            if let Some(attn) = self.attentions.get(i) {
                h = attn.forward(h);
            }
            skips.push(h.clone());
        }

        if let Some(ds) = &self.downsampler {
            h = ds.forward(h);
            skips.push(h.clone());
        }
        h
    }
}

/// Mid block: ResBlock + Attention + ResBlock
#[derive(Module, Debug)]
pub struct MidBlock<B: Backend> {
    pub resnets: Vec<ResBlock<B>>,
    pub attention: AttentionBlock<B>,
}

impl<B: Backend> MidBlock<B> {
    fn forward(&self, x: Tensor<B, 4>, emb: Tensor<B, 2>) -> Tensor<B, 4> {
        let mut h = x;
        for (i, resnet) in self.resnets.iter().enumerate() {
            if i > 0 {
                h = self.attention.forward(h);
            }
            h = resnet.forward(h, emb.clone());
        }
        h
    }
}

/// Decoder block: ResNets fed with popped skips (+ attention), optional upsampler
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    pub resnets: Vec<ResBlock<B>>,
    /// Empty for plain `UpBlock2D`
    pub attentions: Vec<AttentionBlock<B>>,
    pub upsampler: Option<Upsample<B>>,
}

impl<B: Backend> UpBlock<B> {
    fn forward(
        &self,
        x: Tensor<B, 4>,
        emb: Tensor<B, 2>,
        skips: &mut Vec<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let mut h = x;
        for (i, resnet) in self.resnets.iter().enumerate() {
            let skip = skips.pop().expect("one skip connection per up resnet");
            h = resnet.forward(Tensor::cat(vec![h, skip], 1), emb.clone());
            if let Some(attn) = self.attentions.get(i) {
                h = attn.forward(h);
            }
        }

        match &self.upsampler {
            Some(up) => up.forward(h),
            None => h,
        }
    }
}
