//! Noise-prediction objective shared by training and validation

use burn::nn::loss::{MseLoss, Reduction};
use burn::prelude::*;
use burn::tensor::Distribution;
use rand::Rng;
use xfetus_samplers::NoiseSchedule;
use xfetus_unet::UNet2D;

/// MSE between the UNet's noise prediction and the true noise
///
/// Each sample gets its own timestep, uniform in `[0, T)` for the `T`
/// training steps of `schedule`.
pub fn noise_prediction_loss<B: Backend, R: Rng + ?Sized>(
    unet: &UNet2D<B>,
    schedule: &NoiseSchedule,
    images: Tensor<B, 4>,
    labels: Option<Tensor<B, 1, Int>>,
    rng: &mut R,
) -> Tensor<B, 1> {
    let [batch, _, _, _] = images.dims();
    let device = images.device();

    let timesteps: Vec<usize> = (0..batch)
        .map(|_| rng.random_range(0..schedule.num_train_steps))
        .collect();
    let noise = Tensor::<B, 4>::random(images.shape(), Distribution::Normal(0.0, 1.0), &device);
    let noisy_images = schedule.add_noise(images, noise.clone(), &timesteps);

    let t: Vec<f32> = timesteps.iter().map(|&t| t as f32).collect();
    let t = Tensor::<B, 1>::from_data(TensorData::new(t, [batch]), &device);

    let noise_pred = unet.forward(noisy_images, t, labels);
    MseLoss::new().forward(noise_pred, noise, Reduction::Mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use xfetus_unet::UNet2DConfig;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_loss_is_scalar_and_positive() {
        let device = Default::default();
        let unet = UNet2DConfig::tiny()
            .init::<TestBackend>(&device)
            .with_class_conditioning(3, &device);
        let schedule = NoiseSchedule::linear(100, 1e-4, 0.02);
        let images = Tensor::<TestBackend, 4>::zeros([3, 3, 8, 8], &device);
        let labels = Tensor::<TestBackend, 1, Int>::from_ints([0, 1, 2], &device);

        let loss = noise_prediction_loss(
            &unet,
            &schedule,
            images,
            Some(labels),
            &mut StdRng::seed_from_u64(0),
        );
        assert_eq!(loss.dims(), [1]);
        let value = loss.into_scalar().elem::<f32>();
        assert!(value.is_finite() && value > 0.0);
    }

    #[test]
    fn test_unconditioned_partial_batch() {
        let device = Default::default();
        let unet = UNet2DConfig::tiny().init::<TestBackend>(&device);
        let schedule = NoiseSchedule::linear(10, 1e-4, 0.02);
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);

        let loss =
            noise_prediction_loss(&unet, &schedule, images, None, &mut StdRng::seed_from_u64(1));
        assert!(loss.into_scalar().elem::<f32>().is_finite());
    }
}
