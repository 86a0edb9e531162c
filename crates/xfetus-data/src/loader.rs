//! Shuffled mini-batches as burn tensors

use burn::prelude::*;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::augment::Augmentation;
use crate::dataset::PrecomputedFetalPlaneDataset;

/// A host-side batch of grayscale images and their labels
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Row-major `[batch, height, width]`
    pub images: Vec<f32>,
    pub labels: Vec<usize>,
    pub height: usize,
    pub width: usize,
}

impl Batch {
    /// Number of images
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Images as `[batch, 3, height, width]` (gray replicated to RGB) and
    /// labels as `[batch]`
    pub fn to_tensors<B: Backend>(&self, device: &B::Device) -> (Tensor<B, 4>, Tensor<B, 1, Int>) {
        let batch = self.len();
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(self.images.clone(), [batch, 1, self.height, self.width]),
            device,
        )
        .repeat_dim(1, 3);

        let labels: Vec<i64> = self.labels.iter().map(|&l| l as i64).collect();
        let labels = Tensor::<B, 1, Int>::from_data(
            TensorData::new(labels, [batch]).convert::<B::IntElem>(),
            device,
        );

        (images, labels)
    }
}

/// Iterates a dataset in mini-batches
///
/// The final batch of an epoch may be smaller than `batch_size`.
#[derive(Debug, Clone)]
pub struct DataLoader<'a> {
    dataset: &'a PrecomputedFetalPlaneDataset,
    batch_size: usize,
    shuffle: bool,
    augmentation: Option<Augmentation>,
}

impl<'a> DataLoader<'a> {
    /// Shuffled loader without augmentation
    ///
    /// # Panics
    ///
    /// If `batch_size` is zero.
    pub fn new(dataset: &'a PrecomputedFetalPlaneDataset, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be greater than zero");
        Self {
            dataset,
            batch_size,
            shuffle: true,
            augmentation: None,
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_augmentation(mut self, augmentation: Option<Augmentation>) -> Self {
        self.augmentation = augmentation;
        self
    }

    /// Number of batches per epoch
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &PrecomputedFetalPlaneDataset {
        self.dataset
    }

    /// One pass over the dataset
    ///
    /// `rng` drives the shuffle and any augmentation.
    pub fn epoch<'r, R: Rng + ?Sized>(&self, rng: &'r mut R) -> Epoch<'a, 'r, R> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut *rng);
        }
        Epoch {
            loader: self.clone(),
            order,
            cursor: 0,
            rng,
        }
    }
}

/// Iterator over the batches of one epoch
pub struct Epoch<'a, 'r, R: Rng + ?Sized> {
    loader: DataLoader<'a>,
    order: Vec<usize>,
    cursor: usize,
    rng: &'r mut R,
}

impl<R: Rng + ?Sized> Iterator for Epoch<'_, '_, R> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        let (height, width) = self.loader.dataset.image_size();

        let mut images = Vec::with_capacity((end - self.cursor) * height * width);
        let mut labels = Vec::with_capacity(end - self.cursor);
        // `order` is a permutation of 0..len()
        for &idx in &self.order[self.cursor..end] {
            let (image, label) = self.loader.dataset.item(idx);
            match &self.loader.augmentation {
                Some(aug) => images.extend(aug.apply(image, &mut *self.rng).iter().copied()),
                None => images.extend(image.iter().copied()),
            }
            labels.push(label);
        }
        self.cursor = end;

        Some(Batch {
            images,
            labels,
            height,
            width,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.cursor).div_ceil(self.loader.batch_size);
        (remaining, Some(remaining))
    }
}

impl<R: Rng + ?Sized> ExactSizeIterator for Epoch<'_, '_, R> {}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use ndarray::Array3;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    fn dataset() -> PrecomputedFetalPlaneDataset {
        // Class c images are filled with the value c
        let arrays = (0..3)
            .map(|c| Array3::from_elem((c + 1, 2, 2), c as f32))
            .collect();
        PrecomputedFetalPlaneDataset::from_arrays(arrays).unwrap()
    }

    #[test]
    fn test_len_counts_partial_batch() {
        let ds = dataset();
        let loader = DataLoader::new(&ds, 4);
        assert_eq!(ds.len(), 6);
        assert_eq!(loader.len(), 2);

        let sizes: Vec<usize> = loader
            .epoch(&mut StdRng::seed_from_u64(0))
            .map(|b| b.len())
            .collect();
        assert_eq!(sizes, vec![4, 2]);
    }

    #[test]
    fn test_batch_pixels_cover_every_label() {
        let ds = dataset();
        let loader = DataLoader::new(&ds, 4).with_augmentation(Some(Augmentation::default()));
        let mut total = 0;
        for batch in loader.epoch(&mut StdRng::seed_from_u64(5)) {
            assert_eq!(batch.images.len(), batch.len() * 2 * 2);
            total += batch.len();
        }
        assert_eq!(total, ds.len());
    }

    #[test]
    fn test_every_image_once_with_matching_label() {
        let ds = dataset();
        let loader = DataLoader::new(&ds, 4);
        let mut seen = Vec::new();
        for batch in loader.epoch(&mut StdRng::seed_from_u64(3)) {
            for (i, &label) in batch.labels.iter().enumerate() {
                assert_eq!(batch.images[i * 4], label as f32);
                seen.push(label);
            }
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn test_unshuffled_order() {
        let ds = dataset();
        let loader = DataLoader::new(&ds, 6).with_shuffle(false);
        let batch = loader.epoch(&mut StdRng::seed_from_u64(0)).next().unwrap();
        assert_eq!(batch.labels, vec![0, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn test_batch_to_tensors_replicates_channels() {
        let device = Default::default();
        let ds = dataset();
        let loader = DataLoader::new(&ds, 2).with_shuffle(false);
        let batch = loader.epoch(&mut StdRng::seed_from_u64(0)).nth(1).unwrap();

        let (images, labels) = batch.to_tensors::<TestBackend>(&device);
        assert_eq!(images.dims(), [2, 3, 2, 2]);
        let values: Vec<f32> = images.into_data().to_vec().unwrap();
        assert!(values.iter().all(|&v| v == 1.0 || v == 2.0));

        let labels: Vec<i64> = labels.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(labels, vec![1, 2]);
    }
}
