//! Experiment Configuration Module
//!
//! An experiment file bundles everything the CLI needs for one model:
//!
//! ```toml
//! [model]
//! architecture = "edsr"
//! nb_residual = 16
//!
//! [dataset]
//! scale = 2
//! lr_size = 24
//! stride = 24
//!
//! [paths]
//! train_dir = "data/train"
//! val_dir = "data/val"
//! test_dir = "data/Set5"
//!
//! [training]
//! nb_epochs = 50
//! batch_size = 16
//! ```
//!
//! Every section and field is optional; omitted values take the defaults of
//! the matching config type.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetConfig;
use crate::model::{
    EdsrConfig, ResNetSrConfig, SrArchitecture, SrcnnConfig, UpscaleMode, DEFAULT_OUTPUT_DIR,
    DEFAULT_WEIGHT_DIR,
};
use crate::training::FitConfig;
use crate::utils::error::{Result, SrError};

/// Load any TOML config file
pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| SrError::Config(format!("Failed to read config {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| SrError::Config(format!("Failed to parse config {}: {e}", path.display())))
}

/// Network selection and topology overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub architecture: SrArchitecture,
    /// Variant tag; defaults to `x<scale>`
    pub model_type: Option<String>,
    pub weight_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Trunk width (`n`) of ResNetSR and EDSR
    pub filters: Option<usize>,
    /// Trunk kernel size (`f`) of ResNetSR and EDSR
    pub kernel_size: Option<usize>,
    pub nb_residual: Option<usize>,
    pub res_scale: Option<f64>,
    pub upscale_mode: Option<UpscaleMode>,
    pub batch_norm: Option<bool>,
    pub f1: Option<usize>,
    pub f2: Option<usize>,
    pub f3: Option<usize>,
    pub n1: Option<usize>,
    pub n2: Option<usize>,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            architecture: SrArchitecture::Edsr,
            model_type: None,
            weight_dir: PathBuf::from(DEFAULT_WEIGHT_DIR),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            filters: None,
            kernel_size: None,
            nb_residual: None,
            res_scale: None,
            upscale_mode: None,
            batch_norm: None,
            f1: None,
            f2: None,
            f3: None,
            n1: None,
            n2: None,
        }
    }
}

impl ModelSection {
    pub fn srcnn_config(&self) -> SrcnnConfig {
        let mut config = SrcnnConfig::new();
        if let Some(f1) = self.f1 {
            config.f1 = f1;
        }
        if let Some(f2) = self.f2 {
            config.f2 = f2;
        }
        if let Some(f3) = self.f3 {
            config.f3 = f3;
        }
        if let Some(n1) = self.n1 {
            config.n1 = n1;
        }
        if let Some(n2) = self.n2 {
            config.n2 = n2;
        }
        config
    }

    pub fn resnet_config(&self, scale: usize) -> ResNetSrConfig {
        let mut config = ResNetSrConfig::new().with_scale(scale);
        if let Some(n) = self.filters {
            config.n = n;
        }
        if let Some(f) = self.kernel_size {
            config.f = f;
        }
        if let Some(nb) = self.nb_residual {
            config.nb_residual = nb;
        }
        if let Some(mode) = self.upscale_mode {
            config.upscale_mode = mode;
        }
        if let Some(bn) = self.batch_norm {
            config.batch_norm = bn;
        }
        config
    }

    pub fn edsr_config(&self, scale: usize) -> EdsrConfig {
        let mut config = EdsrConfig::new().with_scale(scale);
        if let Some(n) = self.filters {
            config.n = n;
        }
        if let Some(f) = self.kernel_size {
            config.f = f;
        }
        if let Some(nb) = self.nb_residual {
            config.nb_residual = nb;
        }
        if let Some(res_scale) = self.res_scale {
            config.res_scale = res_scale;
        }
        if let Some(mode) = self.upscale_mode {
            config.upscale_mode = mode;
        }
        if let Some(bn) = self.batch_norm {
            config.batch_norm = bn;
        }
        config
    }
}

/// Image directories used by the CLI commands
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub train_dir: Option<PathBuf>,
    pub val_dir: Option<PathBuf>,
    pub test_dir: Option<PathBuf>,
}

/// A complete experiment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub model: ModelSection,
    pub dataset: DatasetConfig,
    pub paths: PathsSection,
    pub training: FitConfig,
}

impl ExperimentConfig {
    /// Defaults for `architecture`, with the input mode it needs
    pub fn for_architecture(architecture: SrArchitecture) -> Self {
        let mut config = Self::default();
        config.model.architecture = architecture;
        config.dataset.interpolate_input = architecture == SrArchitecture::Srcnn;
        config
    }

    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_toml_config(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SrError::Serialization(format!("Failed to serialize config: {e}")))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Check that the dataset produces inputs the chosen network accepts
    pub fn validate(&self) -> Result<()> {
        self.dataset.validate()?;
        self.training.validate()?;

        let srcnn = self.model.architecture == SrArchitecture::Srcnn;
        if srcnn != self.dataset.interpolate_input {
            return Err(SrError::Config(format!(
                "{} needs dataset.interpolate_input = {}",
                self.model.architecture, srcnn
            )));
        }
        Ok(())
    }

    /// Model variant tag, `x<scale>` unless set explicitly
    pub fn model_type(&self) -> String {
        self.model
            .model_type
            .clone()
            .unwrap_or_else(|| format!("x{}", self.dataset.scale))
    }

    /// `[height, width]` of the network input patches
    pub fn input_size(&self) -> [usize; 2] {
        let size = self.dataset.input_size();
        [size, size]
    }

    pub fn channels(&self) -> usize {
        self.dataset.channels
    }

    /// Required directory from the `[paths]` section
    pub fn require_dir(dir: &Option<PathBuf>, name: &str) -> Result<PathBuf> {
        dir.clone()
            .ok_or_else(|| SrError::Config(format!("paths.{} is not set", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::SrLoss;
    use tempfile::TempDir;

    #[test]
    fn test_parse_partial_experiment() {
        let toml = r#"
            [model]
            architecture = "resnetsr"
            filters = 32
            upscale_mode = "bilinear"

            [dataset]
            scale = 3
            lr_size = 12

            [training]
            loss = "mae"
        "#;
        let config: ExperimentConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.model_type(), "x3");
        assert_eq!(config.input_size(), [12, 12]);
        assert_eq!(config.training.loss, SrLoss::Mae);

        let resnet = config.model.resnet_config(config.dataset.scale);
        assert_eq!(resnet.n, 32);
        assert_eq!(resnet.scale, 3);
        assert_eq!(resnet.upscale_mode, UpscaleMode::Bilinear);
        assert_eq!(resnet.nb_residual, 5);
    }

    #[test]
    fn test_srcnn_requires_interpolated_inputs() {
        let mut config = ExperimentConfig::for_architecture(SrArchitecture::Srcnn);
        assert!(config.validate().is_ok());
        assert_eq!(config.input_size(), [32, 32]);

        config.dataset.interpolate_input = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exp.toml");

        let mut config = ExperimentConfig::for_architecture(SrArchitecture::Edsr);
        config.model.nb_residual = Some(4);
        config.paths.train_dir = Some(PathBuf::from("data/train"));
        config.save(&path).unwrap();

        let loaded = ExperimentConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.model.edsr_config(2).nb_residual, 4);
        assert!(ExperimentConfig::require_dir(&loaded.paths.test_dir, "test_dir").is_err());
    }
}
