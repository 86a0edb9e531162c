//! Pretrained UNet2D folders written by `save_unet2d` load back through
//! `load_unet2d`, including the class embedding and the pipeline layout.

use burn::prelude::*;
use burn_ndarray::NdArray;

use xfetus_convert::{load_unet2d, save_unet2d, UnetLoadError};
use xfetus_unet::UNet2DConfig;

type TestBackend = NdArray<f32>;

fn predict(unet: &xfetus_unet::UNet2D<TestBackend>, device: &<TestBackend as Backend>::Device) -> Vec<f32> {
    let x = Tensor::<TestBackend, 4>::ones([1, 3, 16, 16], device) * 0.25;
    let t = Tensor::<TestBackend, 1>::from_floats([42.0], device);
    let labels = Tensor::<TestBackend, 1, Int>::from_ints([2], device);
    unet.forward(x, t, Some(labels))
        .into_data()
        .to_vec()
        .unwrap()
}

#[test]
fn pipeline_folder_reproduces_predictions() {
    let device = Default::default();
    let config = UNet2DConfig::tiny();
    let unet = config
        .init::<TestBackend>(&device)
        .with_class_conditioning(6, &device);

    let dir = tempfile::tempdir().unwrap();
    save_unet2d(&unet, &config, dir.path().join("unet")).unwrap();

    let (loaded, loaded_config) = load_unet2d::<TestBackend>(dir.path(), &device).unwrap();
    assert_eq!(loaded_config.num_class_embeds, Some(6));
    assert_eq!(loaded.num_classes(), Some(6));

    let expected = predict(&unet, &device);
    let actual = predict(&loaded, &device);
    for (a, b) in expected.iter().zip(&actual) {
        assert!((a - b).abs() < 1e-5, "{a} != {b}");
    }
}

#[test]
fn config_mismatch_is_reported() {
    let device = Default::default();
    let config = UNet2DConfig::tiny();
    let unet = config.init::<TestBackend>(&device);

    let dir = tempfile::tempdir().unwrap();
    save_unet2d(&unet, &config, dir.path()).unwrap();

    // Claim wider blocks than the weights have
    let mut wider = config.clone();
    wider.block_out_channels = vec![32, 64];
    std::fs::write(
        dir.path().join("config.json"),
        serde_json::to_string(&wider).unwrap(),
    )
    .unwrap();

    let err = load_unet2d::<TestBackend>(dir.path(), &device).unwrap_err();
    assert!(matches!(err, UnetLoadError::ShapeMismatch { .. }), "{err}");
}
