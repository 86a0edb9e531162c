//! A models directory laid out like the FETAL_PLANES_DB export loads into
//! RGB batches with one label per class file.

use burn_ndarray::NdArray;
use ndarray::Array3;
use ndarray_npy::write_npy;
use rand::rngs::StdRng;
use rand::SeedableRng;

use xfetus_data::{Augmentation, DataLoader, FetalPlaneClass, PrecomputedFetalPlaneDataset};

type TestBackend = NdArray<f32>;

fn write_split(dir: &std::path::Path, filenames: &[String], per_class: usize) {
    for (label, name) in filenames.iter().enumerate() {
        let images = Array3::<u8>::from_elem((per_class, 8, 8), (label * 40) as u8);
        write_npy(dir.join(name), &images).unwrap();
    }
}

#[test]
fn default_filenames_cover_all_classes() {
    let dir = tempfile::tempdir().unwrap();
    let train_files = FetalPlaneClass::default_train_filenames();
    let valid_files = FetalPlaneClass::default_validation_filenames();
    write_split(dir.path(), &train_files, 3);
    write_split(dir.path(), &valid_files, 1);

    let train = PrecomputedFetalPlaneDataset::open(dir.path(), &train_files).unwrap();
    let valid = PrecomputedFetalPlaneDataset::open(dir.path(), &valid_files).unwrap();
    assert_eq!(train.len(), 18);
    assert_eq!(valid.len(), 6);
    assert_eq!(train.num_classes(), FetalPlaneClass::ALL.len());

    let loader = DataLoader::new(&train, 4).with_augmentation(Some(Augmentation::default()));
    assert_eq!(loader.len(), 5);

    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(11);
    let mut total = 0;
    for batch in loader.epoch(&mut rng) {
        let (images, labels) = batch.to_tensors::<TestBackend>(&device);
        let [b, c, h, w] = images.dims();
        assert_eq!((c, h, w), (3, 8, 8));
        assert_eq!(labels.dims(), [b]);
        total += b;

        let values: Vec<f32> = images.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }
    assert_eq!(total, 18);
}
