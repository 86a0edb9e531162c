//! Fetal Ultrasound Plane Data
//!
//! Loads the precomputed FETAL_PLANES_DB arrays (one `.npy` per class),
//! optionally augments them, and batches them into burn tensors.
//!
//! ```ignore
//! use xfetus_data::{DataLoader, FetalPlaneClass, PrecomputedFetalPlaneDataset};
//!
//! let train = PrecomputedFetalPlaneDataset::open(&dir, &FetalPlaneClass::default_train_filenames())?;
//! let loader = DataLoader::new(&train, 8);
//! for batch in loader.epoch(&mut rng) {
//!     let (images, labels) = batch.to_tensors::<Backend>(&device);
//! }
//! ```

pub mod augment;
pub mod dataset;
pub mod loader;

pub use augment::Augmentation;
pub use dataset::{DataError, FetalPlaneClass, PrecomputedFetalPlaneDataset};
pub use loader::{Batch, DataLoader, Epoch};
