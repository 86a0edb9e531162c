//! Load tensors from .safetensors files

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use burn::prelude::*;
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    #[error("Unsupported dtype {dtype:?} for {tensor}")]
    UnsupportedDtype { tensor: String, dtype: Dtype },

    #[error("Rank mismatch for {tensor}: expected {expected}, got shape {actual:?}")]
    RankMismatch {
        tensor: String,
        expected: usize,
        actual: Vec<usize>,
    },
}

/// A memory-mapped safetensors file
///
/// Only the header is parsed on open; tensor bytes are read on demand.
pub struct SafeTensorFile {
    mmap: Mmap,
    tensors: HashMap<String, TensorInfo>,
}

struct TensorInfo {
    dtype: Dtype,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

impl SafeTensorFile {
    /// Open a safetensors file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let file = File::open(path)?;
        // Safety: the map is read-only and owned by the returned value
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let tensors = {
            let st = SafeTensors::deserialize(&mmap)?;
            let base = mmap.as_ptr() as usize;
            st.tensors()
                .into_iter()
                .map(|(name, view)| {
                    let start = view.data().as_ptr() as usize - base;
                    let info = TensorInfo {
                        dtype: view.dtype(),
                        shape: view.shape().to_vec(),
                        start,
                        end: start + view.data().len(),
                    };
                    (name, info)
                })
                .collect()
        };

        Ok(Self { mmap, tensors })
    }

    /// List all tensor names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    /// Number of tensors in the file
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Check if a tensor exists
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Get tensor shape
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    /// Get tensor dtype
    pub fn dtype(&self, name: &str) -> Option<Dtype> {
        self.tensors.get(name).map(|t| t.dtype)
    }

    /// Load a tensor as f32, converting from fp16/bf16 if needed
    pub fn load_f32<B: Backend, const D: usize>(
        &self,
        name: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let info = self
            .tensors
            .get(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;

        let shape: [usize; D] =
            info.shape
                .clone()
                .try_into()
                .map_err(|actual| LoadError::RankMismatch {
                    tensor: name.to_string(),
                    expected: D,
                    actual,
                })?;

        let data = &self.mmap[info.start..info.end];

        // Byte-wise reads, the mmap gives no alignment guarantee
        let floats: Vec<f32> = match info.dtype {
            Dtype::F32 => data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F16 => data
                .chunks_exact(2)
                .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            Dtype::BF16 => data
                .chunks_exact(2)
                .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            dtype => {
                return Err(LoadError::UnsupportedDtype {
                    tensor: name.to_string(),
                    dtype,
                })
            }
        };

        Ok(Tensor::from_data(TensorData::new(floats, shape), device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use safetensors::tensor::TensorView;

    type TestBackend = NdArray<f32>;

    fn write_fixture(path: &Path) {
        let f32_bytes: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let f16_bytes: Vec<u8> = [0.5f32, -1.5]
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_bits().to_le_bytes())
            .collect();

        let tensors = vec![
            (
                "a.weight".to_string(),
                TensorView::new(Dtype::F32, vec![2, 3], &f32_bytes).unwrap(),
            ),
            (
                "b.bias".to_string(),
                TensorView::new(Dtype::F16, vec![2], &f16_bytes).unwrap(),
            ),
        ];
        safetensors::serialize_to_file(tensors, &None, path).unwrap();
    }

    #[test]
    fn test_load_f32_and_f16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.safetensors");
        write_fixture(&path);

        let file = SafeTensorFile::open(&path).unwrap();
        assert_eq!(file.len(), 2);
        assert_eq!(file.shape("a.weight"), Some(&[2, 3][..]));
        assert_eq!(file.dtype("b.bias"), Some(Dtype::F16));

        let device = Default::default();
        let a: Tensor<TestBackend, 2> = file.load_f32("a.weight", &device).unwrap();
        let values: Vec<f32> = a.into_data().to_vec().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let b: Tensor<TestBackend, 1> = file.load_f32("b.bias", &device).unwrap();
        let values: Vec<f32> = b.into_data().to_vec().unwrap();
        assert_eq!(values, vec![0.5, -1.5]);
    }

    #[test]
    fn test_wrong_rank_and_missing_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.safetensors");
        write_fixture(&path);

        let file = SafeTensorFile::open(&path).unwrap();
        let device = Default::default();

        let err = file
            .load_f32::<TestBackend, 4>("a.weight", &device)
            .unwrap_err();
        assert!(matches!(err, LoadError::RankMismatch { expected: 4, .. }));

        let err = file
            .load_f32::<TestBackend, 1>("missing", &device)
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
