//! Locating the parts of a diffusers pipeline folder
//!
//! A `DDPMPipeline` checkpoint looks like:
//!
//! ```text
//! ddpm-celebahq-256/
//! ├── model_index.json
//! ├── scheduler/scheduler_config.json
//! └── unet/
//!     ├── config.json
//!     └── diffusion_pytorch_model.safetensors
//! ```
//!
//! The UNet folder on its own (config and weights at the root) is accepted too.

use std::path::{Path, PathBuf};

use xfetus_samplers::SchedulerConfig;

use crate::unet2d::UnetLoadError;

pub(crate) const UNET_CONFIG_CANDIDATES: &[&str] = &["unet/config.json", "config.json"];

pub(crate) const UNET_WEIGHT_CANDIDATES: &[&str] = &[
    "unet/diffusion_pytorch_model.safetensors",
    "diffusion_pytorch_model.safetensors",
    "unet.safetensors",
];

const SCHEDULER_CONFIG_CANDIDATES: &[&str] =
    &["scheduler/scheduler_config.json", "scheduler_config.json"];

/// Find a component file from possible locations under `dir`
pub(crate) fn find_component_file(dir: &Path, candidates: &[&str]) -> Result<PathBuf, UnetLoadError> {
    candidates
        .iter()
        .map(|candidate| dir.join(candidate))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            UnetLoadError::FileNotFound(format!(
                "Could not find any of {:?} in {}",
                candidates,
                dir.display()
            ))
        })
}

/// Read the pipeline's training scheduler config
///
/// Falls back to [`SchedulerConfig::default`] (the DDPM linear schedule)
/// when the folder has none.
pub fn load_scheduler_config(path: impl AsRef<Path>) -> Result<SchedulerConfig, UnetLoadError> {
    let path = path.as_ref();
    let dir = if path.is_file() {
        path.parent().unwrap_or(Path::new("."))
    } else {
        path
    };

    match find_component_file(dir, SCHEDULER_CONFIG_CANDIDATES) {
        Ok(file) => {
            log::debug!("reading scheduler config {}", file.display());
            let text = std::fs::read_to_string(&file)?;
            Ok(serde_json::from_str(&text)?)
        }
        Err(_) => {
            log::warn!(
                "no scheduler config under {}, using the default linear schedule",
                dir.display()
            );
            Ok(SchedulerConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfetus_samplers::BetaSchedule;

    #[test]
    fn test_scheduler_config_from_pipeline_folder() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("scheduler")).unwrap();
        std::fs::write(
            dir.path().join("scheduler/scheduler_config.json"),
            r#"{"_class_name": "DDPMScheduler", "beta_schedule": "scaled_linear", "num_train_timesteps": 500}"#,
        )
        .unwrap();

        let config = load_scheduler_config(dir.path()).unwrap();
        assert_eq!(config.num_train_timesteps, 500);
        assert_eq!(config.beta_schedule, BetaSchedule::ScaledLinear);
    }

    #[test]
    fn test_scheduler_config_defaults_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_scheduler_config(dir.path()).unwrap();
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn test_find_component_prefers_first_candidate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("unet")).unwrap();
        std::fs::write(dir.path().join("unet/config.json"), "{}").unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();

        let found = find_component_file(dir.path(), UNET_CONFIG_CANDIDATES).unwrap();
        assert_eq!(found, dir.path().join("unet/config.json"));
    }
}
