//! Precomputed fetal plane arrays
//!
//! Each class lives in its own `.npy` file holding an `[N, H, W]` stack of
//! grayscale images. The label of an image is the position of its file in
//! the list passed to [`PrecomputedFetalPlaneDataset::open`].

use std::fmt;
use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayView2};
use ndarray_npy::{read_npy, ReadNpyError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("failed to read {path}: {source}")]
    Npy {
        path: PathBuf,
        #[source]
        source: ReadNpyError,
    },

    #[error("{path} holds {actual:?} images, expected {expected:?} like the other files")]
    ImageSizeMismatch {
        path: PathBuf,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("no dataset files given")]
    NoFiles,
}

/// The six planes of the FETAL_PLANES_DB dataset, in label order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetalPlaneClass {
    FetalAbdomen,
    FetalBrain,
    FetalFemur,
    FetalThorax,
    MaternalCervix,
    Other,
}

impl FetalPlaneClass {
    pub const ALL: [FetalPlaneClass; 6] = [
        FetalPlaneClass::FetalAbdomen,
        FetalPlaneClass::FetalBrain,
        FetalPlaneClass::FetalFemur,
        FetalPlaneClass::FetalThorax,
        FetalPlaneClass::MaternalCervix,
        FetalPlaneClass::Other,
    ];

    /// Label index
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// File name stem, e.g. `Fetal_brain`
    pub fn stem(self) -> &'static str {
        match self {
            FetalPlaneClass::FetalAbdomen => "Fetal_abdomen",
            FetalPlaneClass::FetalBrain => "Fetal_brain",
            FetalPlaneClass::FetalFemur => "Fetal_femur",
            FetalPlaneClass::FetalThorax => "Fetal_thorax",
            FetalPlaneClass::MaternalCervix => "Maternal_cervix",
            FetalPlaneClass::Other => "Other",
        }
    }

    pub fn train_filename(self) -> String {
        format!("{}_train.npy", self.stem())
    }

    pub fn validation_filename(self) -> String {
        format!("{}_validation.npy", self.stem())
    }

    /// `<Class>_train.npy` for every class
    pub fn default_train_filenames() -> Vec<String> {
        Self::ALL.iter().map(|c| c.train_filename()).collect()
    }

    /// `<Class>_validation.npy` for every class
    pub fn default_validation_filenames() -> Vec<String> {
        Self::ALL.iter().map(|c| c.validation_filename()).collect()
    }
}

impl fmt::Display for FetalPlaneClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stem().replace('_', " "))
    }
}

/// Class-labelled grayscale images loaded from per-class `.npy` files
#[derive(Debug, Clone)]
pub struct PrecomputedFetalPlaneDataset {
    /// One `[N, H, W]` stack per class
    arrays: Vec<Array3<f32>>,
    /// `(label, row)` for every image
    index: Vec<(usize, usize)>,
    image_size: (usize, usize),
}

impl PrecomputedFetalPlaneDataset {
    /// Load `filenames` from `dir`, labelling each file by its position
    ///
    /// Files may hold f32, f64 or u8 data; u8 is rescaled to [-1, 1]. All
    /// files must share the same image size. Empty files are allowed.
    pub fn open<S: AsRef<str>>(dir: impl AsRef<Path>, filenames: &[S]) -> Result<Self, DataError> {
        if filenames.is_empty() {
            return Err(DataError::NoFiles);
        }
        let dir = dir.as_ref();

        let mut arrays = Vec::with_capacity(filenames.len());
        let mut index = Vec::new();
        let mut image_size = None;

        for (label, name) in filenames.iter().enumerate() {
            let path = dir.join(name.as_ref());
            let array = read_image_stack(&path)?;
            let (n, h, w) = array.dim();

            match image_size {
                None => image_size = Some((h, w)),
                Some(expected) if expected != (h, w) => {
                    return Err(DataError::ImageSizeMismatch {
                        path,
                        expected,
                        actual: (h, w),
                    })
                }
                Some(_) => {}
            }

            log::debug!("{}: {n} images of {h}x{w} (label {label})", path.display());
            index.extend((0..n).map(|row| (label, row)));
            arrays.push(array);
        }

        let dataset = Self {
            arrays,
            index,
            image_size: image_size.unwrap_or((0, 0)),
        };
        log::info!(
            "loaded {} images in {} classes from {}",
            dataset.len(),
            dataset.num_classes(),
            dir.display()
        );
        Ok(dataset)
    }

    /// Build a dataset from in-memory stacks, one per class
    pub fn from_arrays(arrays: Vec<Array3<f32>>) -> Result<Self, DataError> {
        let first = arrays.first().ok_or(DataError::NoFiles)?;
        let (_, h, w) = first.dim();
        let mut index = Vec::new();
        for (label, array) in arrays.iter().enumerate() {
            let (n, ah, aw) = array.dim();
            if (ah, aw) != (h, w) {
                return Err(DataError::ImageSizeMismatch {
                    path: PathBuf::from(format!("<class {label}>")),
                    expected: (h, w),
                    actual: (ah, aw),
                });
            }
            index.extend((0..n).map(|row| (label, row)));
        }
        Ok(Self {
            arrays,
            index,
            image_size: (h, w),
        })
    }

    /// Total number of images
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of classes (files)
    pub fn num_classes(&self) -> usize {
        self.arrays.len()
    }

    /// `(height, width)` shared by every image
    pub fn image_size(&self) -> (usize, usize) {
        self.image_size
    }

    /// Images per class, in label order
    pub fn class_counts(&self) -> Vec<usize> {
        self.arrays.iter().map(|a| a.dim().0).collect()
    }

    /// Image and label at `idx`
    pub fn get(&self, idx: usize) -> Option<(ArrayView2<'_, f32>, usize)> {
        (idx < self.len()).then(|| self.item(idx))
    }

    /// Image and label at `idx`
    ///
    /// # Panics
    ///
    /// If `idx >= len()`.
    pub(crate) fn item(&self, idx: usize) -> (ArrayView2<'_, f32>, usize) {
        let (label, row) = self.index[idx];
        (self.arrays[label].index_axis(ndarray::Axis(0), row), label)
    }
}

/// Read an `[N, H, W]` array stored as f32, f64 or u8
fn read_image_stack(path: &Path) -> Result<Array3<f32>, DataError> {
    let npy_error = |source| DataError::Npy {
        path: path.to_path_buf(),
        source,
    };

    match read_npy::<_, Array3<f32>>(path) {
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        other => return other.map_err(npy_error),
    }

    match read_npy::<_, Array3<f64>>(path) {
        Err(ReadNpyError::WrongDescriptor(_)) => {}
        other => return other.map(|a| a.mapv(|v| v as f32)).map_err(npy_error),
    }

    read_npy::<_, Array3<u8>>(path)
        .map(|a| a.mapv(|v| v as f32 / 127.5 - 1.0))
        .map_err(npy_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use ndarray_npy::write_npy;

    #[test]
    fn test_class_filenames() {
        assert_eq!(FetalPlaneClass::FetalBrain.index(), 1);
        assert_eq!(FetalPlaneClass::FetalBrain.train_filename(), "Fetal_brain_train.npy");
        assert_eq!(
            FetalPlaneClass::MaternalCervix.validation_filename(),
            "Maternal_cervix_validation.npy"
        );
        assert_eq!(FetalPlaneClass::from_index(5), Some(FetalPlaneClass::Other));
        assert_eq!(FetalPlaneClass::from_index(6), None);
        assert_eq!(FetalPlaneClass::FetalThorax.to_string(), "Fetal thorax");
    }

    #[test]
    fn test_open_labels_by_file_position() {
        let dir = tempfile::tempdir().unwrap();
        write_npy(dir.path().join("a.npy"), &Array3::<f32>::zeros((2, 4, 4))).unwrap();
        write_npy(dir.path().join("b.npy"), &Array3::<f64>::ones((3, 4, 4))).unwrap();

        let ds = PrecomputedFetalPlaneDataset::open(dir.path(), &["a.npy", "b.npy"]).unwrap();
        assert_eq!(ds.len(), 5);
        assert_eq!(ds.class_counts(), vec![2, 3]);
        assert_eq!(ds.image_size(), (4, 4));

        let (image, label) = ds.get(4).unwrap();
        assert_eq!(label, 1);
        assert_eq!(image[[0, 0]], 1.0);
        assert!(ds.get(5).is_none());
    }

    #[test]
    fn test_u8_is_rescaled() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = Array3::<u8>::zeros((1, 1, 2));
        data[[0, 0, 1]] = 255;
        write_npy(dir.path().join("u8.npy"), &data).unwrap();

        let ds = PrecomputedFetalPlaneDataset::open(dir.path(), &["u8.npy"]).unwrap();
        let (image, _) = ds.get(0).unwrap();
        assert_eq!(image[[0, 0]], -1.0);
        assert_eq!(image[[0, 1]], 1.0);
    }

    #[test]
    fn test_mismatched_sizes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_npy(dir.path().join("a.npy"), &Array3::<f32>::zeros((1, 4, 4))).unwrap();
        write_npy(dir.path().join("b.npy"), &Array3::<f32>::zeros((1, 8, 8))).unwrap();

        let err = PrecomputedFetalPlaneDataset::open(dir.path(), &["a.npy", "b.npy"]).unwrap_err();
        assert!(matches!(err, DataError::ImageSizeMismatch { .. }));
    }

    #[test]
    fn test_missing_file_and_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = PrecomputedFetalPlaneDataset::open(dir.path(), &["nope.npy"]).unwrap_err();
        assert!(matches!(err, DataError::Npy { .. }));

        let none: [&str; 0] = [];
        let err = PrecomputedFetalPlaneDataset::open(dir.path(), &none).unwrap_err();
        assert!(matches!(err, DataError::NoFiles));
    }
}
