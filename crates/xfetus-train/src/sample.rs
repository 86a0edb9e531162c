//! Reverse-diffusion previews

use std::path::Path;

use burn::prelude::*;
use burn::tensor::Distribution;
use image::{Rgb, RgbImage};
use xfetus_samplers::Sampler;
use xfetus_unet::UNet2D;

use crate::error::TrainError;

/// Channels of generated images
pub const IMAGE_CHANNELS: usize = 3;

/// Run the full reverse process from Gaussian noise
///
/// `class` conditions every image on the same label; it is ignored by a UNet
/// without a class embedding.
pub fn generate<B: Backend>(
    unet: &UNet2D<B>,
    sampler: &Sampler,
    batch_size: usize,
    image_size: usize,
    class: Option<usize>,
    device: &B::Device,
) -> Tensor<B, 4> {
    generate_with_progress(unet, sampler, batch_size, image_size, class, device, |_, _| {})
}

/// [`generate`], reporting `(step, total)` after every denoising step
pub fn generate_with_progress<B: Backend>(
    unet: &UNet2D<B>,
    sampler: &Sampler,
    batch_size: usize,
    image_size: usize,
    class: Option<usize>,
    device: &B::Device,
    mut on_step: impl FnMut(usize, usize),
) -> Tensor<B, 4> {
    let mut x = Tensor::<B, 4>::random(
        [batch_size, IMAGE_CHANNELS, image_size, image_size],
        Distribution::Normal(0.0, 1.0),
        device,
    );
    let labels = class
        .filter(|_| unet.num_classes().is_some())
        .map(|c| Tensor::<B, 1, Int>::from_ints([c as i32], device));

    let timesteps = sampler.timesteps();
    for (i, &t) in timesteps.iter().enumerate() {
        let model_input = sampler.scale_model_input(x.clone(), t);
        let timestep = Tensor::<B, 1>::from_floats([t as f32], device);
        let noise_pred = unet.forward(model_input, timestep, labels.clone());
        x = sampler.step(noise_pred, t, x);
        on_step(i + 1, timesteps.len());
    }
    x
}

/// Image `index` of a `[batch, channels, h, w]` tensor in [-1, 1] as RGB
///
/// Single-channel images are written as gray.
pub fn to_rgb_image<B: Backend>(images: Tensor<B, 4>, index: usize) -> Result<RgbImage, TrainError> {
    let [_, channels, height, width] = images.dims();
    let values: Vec<f32> = images
        .slice([index..index + 1])
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| TrainError::TensorData(format!("{e:?}")))?;

    let plane = height * width;
    let pixel = |c: usize, i: usize| {
        let c = c.min(channels - 1);
        ((values[c * plane + i] * 0.5 + 0.5).clamp(0.0, 1.0) * 255.0) as u8
    };

    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let i = y as usize * width + x as usize;
        Rgb([pixel(0, i), pixel(1, i), pixel(2, i)])
    }))
}

/// Write the first image of `images` to `path` as PNG
///
/// Returns the mean value over the whole batch.
pub fn save_preview<B: Backend>(images: Tensor<B, 4>, path: &Path) -> Result<f32, TrainError> {
    let mean = images.clone().mean().into_scalar().elem::<f32>();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    to_rgb_image(images, 0)?.save(path)?;
    Ok(mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use xfetus_samplers::{SamplerKind, SchedulerConfig};
    use xfetus_unet::UNet2DConfig;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_rgb_mapping() {
        let device = Default::default();
        let data = TensorData::new(vec![-1.0f32, 1.0, 0.0, 0.0, 2.0, -3.0], [1, 3, 1, 2]);
        let images = Tensor::<TestBackend, 4>::from_data(data, &device);

        let img = to_rgb_image(images, 0).unwrap();
        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(0, 0), &Rgb([0, 127, 255]));
        assert_eq!(img.get_pixel(1, 0), &Rgb([255, 127, 0]));
    }

    #[test]
    fn test_gray_is_replicated() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::ones([2, 1, 2, 2], &device);
        let img = to_rgb_image(images, 1).unwrap();
        assert!(img.pixels().all(|p| *p == Rgb([255, 255, 255])));
    }

    #[test]
    fn test_generate_and_save() {
        let device = Default::default();
        let unet = UNet2DConfig::tiny()
            .init::<TestBackend>(&device)
            .with_class_conditioning(2, &device);
        let config = SchedulerConfig {
            num_train_timesteps: 20,
            rescale_betas_zero_snr: true,
            ..Default::default()
        };
        let mut sampler = SamplerKind::Ddim.build(&config, 0.0);
        sampler.set_timesteps(3).unwrap();

        let mut steps = Vec::new();
        let images = generate_with_progress(&unet, &sampler, 2, 8, Some(1), &device, |i, n| {
            steps.push((i, n))
        });
        assert_eq!(images.dims(), [2, 3, 8, 8]);
        assert_eq!(steps, vec![(1, 3), (2, 3), (3, 3)]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("previews/epoch_0001.png");
        let mean = save_preview(images, &path).unwrap();
        assert!(mean.is_finite());
        assert!(path.is_file());
    }
}
