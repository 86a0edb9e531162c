//! Training checkpoints in burn's record format
//!
//! The UNet and the optimizer state are stored as separate full-precision
//! binary records. burn's file recorders always write the `.bin` extension,
//! so [`checkpoint_paths`] normalises the names up front.
//!
//! ```ignore
//! let paths = checkpoint_paths(&models_path, "ddpm-fetal");
//! save_module(unet.clone(), &paths.model)?;
//! save_record(optimizer.to_record(), &paths.optimizer)?;
//!
//! let unet = load_module(unet, &paths.model, &device)?;
//! ```

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::prelude::*;
use burn::record::Record;

pub use burn::record::{
    BinFileRecorder, FullPrecisionSettings, HalfPrecisionSettings, Recorder, RecorderError,
};

/// Error type for serialization operations
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the Burn recorder
    #[error("Record error: {0}")]
    Record(#[from] RecorderError),
}

/// Create a recorder for full precision (f32) binary files
pub fn full_precision_recorder() -> BinFileRecorder<FullPrecisionSettings> {
    BinFileRecorder::new()
}

/// Where a checkpoint's model and optimizer records live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    pub model: PathBuf,
    pub optimizer: PathBuf,
}

/// Model and optimizer record paths for `model_name` under `dir`
///
/// Any extension on `model_name` (e.g. `.pth`) is replaced by `.bin`; the
/// optimizer record gets an `_optim` suffix.
pub fn checkpoint_paths(dir: &Path, model_name: &str) -> CheckpointPaths {
    let model = dir.join(model_name).with_extension("bin");
    let stem = model
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| model_name.to_string());
    CheckpointPaths {
        optimizer: dir.join(format!("{stem}_optim.bin")),
        model,
    }
}

fn ensure_parent(path: &Path) -> Result<(), SerializeError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Save a module's parameters
pub fn save_module<B: Backend, M: Module<B>>(module: M, path: &Path) -> Result<(), SerializeError> {
    ensure_parent(path)?;
    module.save_file(path.to_path_buf(), &full_precision_recorder())?;
    Ok(())
}

/// Load parameters saved by [`save_module`] into `module`
pub fn load_module<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    device: &B::Device,
) -> Result<M, SerializeError> {
    Ok(module.load_file(path.to_path_buf(), &full_precision_recorder(), device)?)
}

/// Save any record (e.g. optimizer state)
pub fn save_record<B: Backend, R: Record<B>>(record: R, path: &Path) -> Result<(), SerializeError> {
    ensure_parent(path)?;
    Recorder::<B>::record(&full_precision_recorder(), record, path.to_path_buf())?;
    Ok(())
}

/// Load a record saved by [`save_record`]
pub fn load_record<B: Backend, R: Record<B>>(
    path: &Path,
    device: &B::Device,
) -> Result<R, SerializeError> {
    Ok(Recorder::<B>::load(&full_precision_recorder(), path.to_path_buf(), device)?)
}
