//! UNet2D weights in the diffusers layout
//!
//! [`load_unet2d`] reads a `UNet2DModel` folder (`config.json` and
//! `diffusion_pytorch_model.safetensors`) into a [`UNet2D`].
//! [`save_unet2d`] writes a trained network back out in the same layout, so
//! it can be opened with `UNet2DModel.from_pretrained`.
//!
//! Both walk the network with [`visit_unet2d`], which pairs every parameter
//! with its diffusers tensor name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use burn::module::Param;
use burn::nn::{conv::Conv2d, Embedding, Linear};
use burn::prelude::*;
use safetensors::tensor::TensorView;
use safetensors::Dtype;

use xfetus_core::groupnorm::GroupNorm;
use xfetus_unet::{AttentionBlock, ResBlock, UNet2D, UNet2DConfig};

use crate::loader::{LoadError, SafeTensorFile};
use crate::pipeline::{find_component_file, UNET_CONFIG_CANDIDATES, UNET_WEIGHT_CANDIDATES};

/// Error type for UNet2D weight loading and export
#[derive(Debug, thiserror::Error)]
pub enum UnetLoadError {
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Missing tensor: {0}")]
    MissingTensor(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config.json: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Unsupported UNet2D config: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch for {tensor}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        tensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Could not read tensor {tensor}: {reason}")]
    TensorData { tensor: String, reason: String },
}

/// Receives each UNet2D parameter group with its diffusers name
///
/// Names are module prefixes without the `.weight`/`.bias` suffix. Attention
/// projections come with their legacy alias as a second candidate.
pub trait UnetVisitor<B: Backend> {
    fn linear(&mut self, names: &[&str], linear: &mut Linear<B>) -> Result<(), UnetLoadError>;
    fn conv2d(&mut self, name: &str, conv: &mut Conv2d<B>) -> Result<(), UnetLoadError>;
    fn group_norm(&mut self, name: &str, norm: &mut GroupNorm<B>) -> Result<(), UnetLoadError>;
    fn embedding(&mut self, name: &str, embedding: &mut Embedding<B>)
        -> Result<(), UnetLoadError>;
}

/// Walk every parameter of `unet` in state-dict order
pub fn visit_unet2d<B: Backend, V: UnetVisitor<B>>(
    unet: &mut UNet2D<B>,
    visitor: &mut V,
) -> Result<(), UnetLoadError> {
    visitor.conv2d("conv_in", &mut unet.conv_in)?;
    visitor.linear(&["time_embedding.linear_1"], &mut unet.time_embedding.linear_1)?;
    visitor.linear(&["time_embedding.linear_2"], &mut unet.time_embedding.linear_2)?;
    if let Some(embedding) = unet.class_embedding.as_mut() {
        visitor.embedding("class_embedding", embedding)?;
    }

    for (i, block) in unet.down_blocks.iter_mut().enumerate() {
        let prefix = format!("down_blocks.{i}");
        for (j, resnet) in block.resnets.iter_mut().enumerate() {
            visit_resblock(&format!("{prefix}.resnets.{j}"), resnet, visitor)?;
        }
        for (j, attn) in block.attentions.iter_mut().enumerate() {
            visit_attention(&format!("{prefix}.attentions.{j}"), attn, visitor)?;
        }
        if let Some(ds) = block.downsampler.as_mut() {
            visitor.conv2d(&format!("{prefix}.downsamplers.0.conv"), &mut ds.conv)?;
        }
    }

    for (j, resnet) in unet.mid_block.resnets.iter_mut().enumerate() {
        visit_resblock(&format!("mid_block.resnets.{j}"), resnet, visitor)?;
    }
    visit_attention("mid_block.attentions.0", &mut unet.mid_block.attention, visitor)?;

    for (i, block) in unet.up_blocks.iter_mut().enumerate() {
        let prefix = format!("up_blocks.{i}");
        for (j, resnet) in block.resnets.iter_mut().enumerate() {
            visit_resblock(&format!("{prefix}.resnets.{j}"), resnet, visitor)?;
        }
        for (j, attn) in block.attentions.iter_mut().enumerate() {
            visit_attention(&format!("{prefix}.attentions.{j}"), attn, visitor)?;
        }
        if let Some(up) = block.upsampler.as_mut() {
            visitor.conv2d(&format!("{prefix}.upsamplers.0.conv"), &mut up.conv)?;
        }
    }

    visitor.group_norm("conv_norm_out", &mut unet.conv_norm_out)?;
    visitor.conv2d("conv_out", &mut unet.conv_out)
}

fn visit_resblock<B: Backend, V: UnetVisitor<B>>(
    prefix: &str,
    block: &mut ResBlock<B>,
    visitor: &mut V,
) -> Result<(), UnetLoadError> {
    visitor.group_norm(&format!("{prefix}.norm1"), &mut block.norm1)?;
    visitor.conv2d(&format!("{prefix}.conv1"), &mut block.conv1)?;
    visitor.linear(
        &[format!("{prefix}.time_emb_proj").as_str()],
        &mut block.time_emb_proj,
    )?;
    visitor.group_norm(&format!("{prefix}.norm2"), &mut block.norm2)?;
    visitor.conv2d(&format!("{prefix}.conv2"), &mut block.conv2)?;
    if let Some(shortcut) = block.conv_shortcut.as_mut() {
        visitor.conv2d(&format!("{prefix}.conv_shortcut"), shortcut)?;
    }
    Ok(())
}

fn visit_attention<B: Backend, V: UnetVisitor<B>>(
    prefix: &str,
    block: &mut AttentionBlock<B>,
    visitor: &mut V,
) -> Result<(), UnetLoadError> {
    visitor.group_norm(&format!("{prefix}.group_norm"), &mut block.group_norm)?;
    for (current, legacy, linear) in [
        ("to_q", "query", &mut block.to_q),
        ("to_k", "key", &mut block.to_k),
        ("to_v", "value", &mut block.to_v),
        ("to_out.0", "proj_attn", &mut block.to_out),
    ] {
        visitor.linear(
            &[
                format!("{prefix}.{current}").as_str(),
                format!("{prefix}.{legacy}").as_str(),
            ],
            linear,
        )?;
    }
    Ok(())
}

// ============================================================================
// Loading
// ============================================================================

/// Copies tensors from a safetensors file into an initialised network
struct WeightLoader<'a, B: Backend> {
    file: &'a SafeTensorFile,
    device: &'a B::Device,
    loaded: usize,
}

impl<B: Backend> WeightLoader<'_, B> {
    fn tensor<const D: usize>(
        &mut self,
        name: &str,
        expected: [usize; D],
    ) -> Result<Tensor<B, D>, UnetLoadError> {
        let actual = self
            .file
            .shape(name)
            .ok_or_else(|| UnetLoadError::MissingTensor(name.to_string()))?;
        if actual != expected.as_slice() {
            return Err(UnetLoadError::ShapeMismatch {
                tensor: name.to_string(),
                expected: expected.to_vec(),
                actual: actual.to_vec(),
            });
        }
        self.loaded += 1;
        Ok(self.file.load_f32(name, self.device)?)
    }

    /// First candidate prefix whose weight exists in the file
    fn resolve<'n>(&self, names: &[&'n str]) -> Result<&'n str, UnetLoadError> {
        names
            .iter()
            .copied()
            .find(|name| self.file.contains(&format!("{name}.weight")))
            .ok_or_else(|| {
                UnetLoadError::MissingTensor(format!("{}.weight", names.first().unwrap_or(&"")))
            })
    }
}

impl<B: Backend> UnetVisitor<B> for WeightLoader<'_, B> {
    fn linear(&mut self, names: &[&str], linear: &mut Linear<B>) -> Result<(), UnetLoadError> {
        let name = self.resolve(names)?;
        let [d_in, d_out] = linear.weight.dims();

        // PyTorch stores Linear weights as [out_features, in_features]
        let weight: Tensor<B, 2> = self.tensor(&format!("{name}.weight"), [d_out, d_in])?;
        linear.weight = Param::from_tensor(weight.transpose());

        if linear.bias.is_some() {
            let bias = self.tensor(&format!("{name}.bias"), [d_out])?;
            linear.bias = Some(Param::from_tensor(bias));
        }
        Ok(())
    }

    fn conv2d(&mut self, name: &str, conv: &mut Conv2d<B>) -> Result<(), UnetLoadError> {
        let shape = conv.weight.dims();
        let weight = self.tensor(&format!("{name}.weight"), shape)?;
        conv.weight = Param::from_tensor(weight);

        if conv.bias.is_some() {
            let bias = self.tensor(&format!("{name}.bias"), [shape[0]])?;
            conv.bias = Some(Param::from_tensor(bias));
        }
        Ok(())
    }

    fn group_norm(&mut self, name: &str, norm: &mut GroupNorm<B>) -> Result<(), UnetLoadError> {
        let channels = norm.num_channels();
        norm.weight = Param::from_tensor(self.tensor(&format!("{name}.weight"), [channels])?);
        norm.bias = Param::from_tensor(self.tensor(&format!("{name}.bias"), [channels])?);
        Ok(())
    }

    fn embedding(
        &mut self,
        name: &str,
        embedding: &mut Embedding<B>,
    ) -> Result<(), UnetLoadError> {
        let shape = embedding.weight.dims();
        embedding.weight = Param::from_tensor(self.tensor(&format!("{name}.weight"), shape)?);
        Ok(())
    }
}

/// Files making up one diffusers `UNet2DModel`
#[derive(Debug, Clone, PartialEq)]
pub struct UNet2DFiles {
    pub config: PathBuf,
    pub weights: PathBuf,
}

impl UNet2DFiles {
    /// Locate the UNet inside a pipeline folder, a UNet folder, or next to a
    /// `.safetensors` file
    pub fn resolve(path: &Path) -> Result<Self, UnetLoadError> {
        if !path.exists() {
            return Err(UnetLoadError::FileNotFound(path.display().to_string()));
        }

        if path.is_file() {
            let dir = path.parent().unwrap_or(Path::new("."));
            return Ok(Self {
                config: find_component_file(dir, UNET_CONFIG_CANDIDATES)?,
                weights: path.to_path_buf(),
            });
        }

        Ok(Self {
            config: find_component_file(path, UNET_CONFIG_CANDIDATES)?,
            weights: find_component_file(path, UNET_WEIGHT_CANDIDATES)?,
        })
    }
}

/// Read a diffusers UNet2D `config.json`
pub fn load_unet2d_config(path: &Path) -> Result<UNet2DConfig, UnetLoadError> {
    let text = std::fs::read_to_string(path)?;
    let config: UNet2DConfig = serde_json::from_str(&text)?;
    config.validate().map_err(UnetLoadError::InvalidConfig)?;
    Ok(config)
}

/// Load a pretrained UNet2D
///
/// `path` may be a pipeline folder (with a `unet/` subfolder), a UNet folder
/// or a `.safetensors` file with `config.json` beside it. Every parameter of
/// the architecture described by the config must be present with the
/// expected shape; extra tensors in the file are ignored.
pub fn load_unet2d<B: Backend>(
    path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<(UNet2D<B>, UNet2DConfig), UnetLoadError> {
    let files = UNet2DFiles::resolve(path.as_ref())?;
    let config = load_unet2d_config(&files.config)?;

    log::info!("loading UNet2D weights from {}", files.weights.display());
    let file = SafeTensorFile::open(&files.weights)?;

    let mut unet = config.init::<B>(device);
    let mut loader = WeightLoader {
        file: &file,
        device,
        loaded: 0,
    };
    visit_unet2d(&mut unet, &mut loader)?;

    log::debug!(
        "loaded {} of {} tensors from {}",
        loader.loaded,
        file.len(),
        files.weights.display()
    );
    Ok((unet, config))
}

// ============================================================================
// Export
// ============================================================================

/// Collects f32 copies of every parameter under its diffusers name
struct WeightExporter {
    tensors: BTreeMap<String, (Vec<usize>, Vec<u8>)>,
}

impl WeightExporter {
    fn push<B: Backend, const D: usize>(
        &mut self,
        name: String,
        tensor: Tensor<B, D>,
    ) -> Result<(), UnetLoadError> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| UnetLoadError::TensorData {
                tensor: name.clone(),
                reason: format!("{e:?}"),
            })?;
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.tensors.insert(name, (shape, bytes));
        Ok(())
    }
}

impl<B: Backend> UnetVisitor<B> for WeightExporter {
    fn linear(&mut self, names: &[&str], linear: &mut Linear<B>) -> Result<(), UnetLoadError> {
        let name = names.first().copied().unwrap_or_default();
        self.push::<B, 2>(format!("{name}.weight"), linear.weight.val().transpose())?;
        if let Some(bias) = &linear.bias {
            self.push::<B, 1>(format!("{name}.bias"), bias.val())?;
        }
        Ok(())
    }

    fn conv2d(&mut self, name: &str, conv: &mut Conv2d<B>) -> Result<(), UnetLoadError> {
        self.push::<B, 4>(format!("{name}.weight"), conv.weight.val())?;
        if let Some(bias) = &conv.bias {
            self.push::<B, 1>(format!("{name}.bias"), bias.val())?;
        }
        Ok(())
    }

    fn group_norm(&mut self, name: &str, norm: &mut GroupNorm<B>) -> Result<(), UnetLoadError> {
        self.push::<B, 1>(format!("{name}.weight"), norm.weight.val())?;
        self.push::<B, 1>(format!("{name}.bias"), norm.bias.val())
    }

    fn embedding(
        &mut self,
        name: &str,
        embedding: &mut Embedding<B>,
    ) -> Result<(), UnetLoadError> {
        self.push::<B, 2>(format!("{name}.weight"), embedding.weight.val())
    }
}

/// Write `unet` as a diffusers `UNet2DModel` folder
///
/// Creates `dir/config.json` and `dir/diffusion_pytorch_model.safetensors`.
/// `num_class_embeds` in the written config follows the network's class
/// embedding.
pub fn save_unet2d<B: Backend>(
    unet: &UNet2D<B>,
    config: &UNet2DConfig,
    dir: impl AsRef<Path>,
) -> Result<(), UnetLoadError> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let mut config = config.clone();
    config.num_class_embeds = unet.num_classes();
    std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(&config)?)?;

    let mut exporter = WeightExporter {
        tensors: BTreeMap::new(),
    };
    let mut unet = unet.clone();
    visit_unet2d(&mut unet, &mut exporter)?;

    let views = exporter
        .tensors
        .iter()
        .map(|(name, (shape, bytes))| {
            TensorView::new(Dtype::F32, shape.clone(), bytes).map(|view| (name.clone(), view))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let weights = dir.join("diffusion_pytorch_model.safetensors");
    safetensors::serialize_to_file(views, &None, &weights)?;
    log::info!(
        "wrote {} UNet2D tensors to {}",
        exporter.tensors.len(),
        weights.display()
    );
    Ok(())
}
