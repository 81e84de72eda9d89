//! Best-weights checkpointing.
//!
//! This module provides:
//! - Checkpoint metadata saved next to the weight file
//! - A monitor that keeps only the best weights seen so far

use std::fs;
use std::path::{Path, PathBuf};

use burn::{module::Module, tensor::backend::Backend};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::save_network_weights;
use crate::utils::error::{Result, SrError};

/// Metadata written as `<weight path>.json` beside the weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub model_name: String,
    /// 1-based epoch the weights come from
    pub epoch: usize,
    /// Name of the monitored quantity, e.g. `val_loss`
    pub monitor: String,
    pub monitor_value: f64,
    pub val_psnr: f64,
    pub num_parameters: usize,
    pub timestamp: String,
}

impl CheckpointMetadata {
    pub fn new(
        model_name: &str,
        epoch: usize,
        monitor: &str,
        monitor_value: f64,
        val_psnr: f64,
        num_parameters: usize,
    ) -> Self {
        Self {
            model_name: model_name.to_string(),
            epoch,
            monitor: monitor.to_string(),
            monitor_value,
            val_psnr,
            num_parameters,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Save metadata to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SrError::Serialization(format!("Failed to serialize checkpoint: {}", e)))?;
        fs::write(path, json)?;

        debug!("Checkpoint metadata saved to {:?}", path);
        Ok(())
    }

    /// Load metadata from file
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let metadata = serde_json::from_str(&json)
            .map_err(|e| SrError::Serialization(format!("Failed to deserialize checkpoint: {}", e)))?;
        Ok(metadata)
    }
}

/// Sidecar metadata path for a weight path
pub fn metadata_path(weight_path: &Path) -> PathBuf {
    let mut file = weight_path.as_os_str().to_owned();
    file.push(".json");
    PathBuf::from(file)
}

/// Whether lower or higher monitored values are better
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    Min,
    Max,
}

impl MonitorMode {
    fn improves(&self, value: f64, best: f64) -> bool {
        match self {
            MonitorMode::Min => value < best,
            MonitorMode::Max => value > best,
        }
    }
}

/// Save-best-only, weights-only checkpoint
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    weight_path: PathBuf,
    monitor: String,
    mode: MonitorMode,
    best: Option<f64>,
    best_epoch: Option<usize>,
}

impl BestCheckpoint {
    /// Checkpoint writing to `weight_path` (without extension)
    pub fn new(weight_path: impl Into<PathBuf>, monitor: &str, mode: MonitorMode) -> Self {
        Self {
            weight_path: weight_path.into(),
            monitor: monitor.to_string(),
            mode,
            best: None,
            best_epoch: None,
        }
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// Whether `value` would replace the current best
    pub fn is_improvement(&self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self.best {
            None => true,
            Some(best) => self.mode.improves(value, best),
        }
    }

    /// Save `network` if `metadata.monitor_value` improves on the best so far
    ///
    /// Returns whether weights were written.
    pub fn update<B: Backend, M: Module<B>>(
        &mut self,
        network: &M,
        metadata: &CheckpointMetadata,
    ) -> Result<bool> {
        let value = metadata.monitor_value;
        if !self.is_improvement(value) {
            return Ok(false);
        }

        save_network_weights::<B, M>(network, &self.weight_path)?;
        metadata.save(&metadata_path(&self.weight_path))?;

        if let Some(previous) = self.best {
            debug!(
                "{} improved from {:.6} to {:.6}",
                self.monitor, previous, value
            );
        }
        self.best = Some(value);
        self.best_epoch = Some(metadata.epoch);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{with_recorder_extension, SrNetwork, Srcnn, SrcnnConfig};
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn metadata(epoch: usize, value: f64) -> CheckpointMetadata {
        CheckpointMetadata::new("SRCNN", epoch, "val_loss", value, 30.0, 10)
    }

    #[test]
    fn test_min_mode_keeps_best_only() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let network =
            Srcnn::<TestBackend>::init(&SrcnnConfig::new().with_n1(2).with_n2(2), 1, &device).unwrap();

        let weight_path = dir.path().join("weights").join("SRCNN Weights x1");
        let mut checkpoint = BestCheckpoint::new(&weight_path, "val_loss", MonitorMode::Min);

        assert!(checkpoint.update::<TestBackend, _>(&network, &metadata(1, 0.5)).unwrap());
        assert!(!checkpoint.update::<TestBackend, _>(&network, &metadata(2, 0.7)).unwrap());
        assert!(checkpoint.update::<TestBackend, _>(&network, &metadata(3, 0.2)).unwrap());
        assert!(!checkpoint.update::<TestBackend, _>(&network, &metadata(4, f64::NAN)).unwrap());

        assert_eq!(checkpoint.best(), Some(0.2));
        assert_eq!(checkpoint.best_epoch(), Some(3));
        assert!(with_recorder_extension(&weight_path).is_file());

        let saved = CheckpointMetadata::load(&metadata_path(&weight_path)).unwrap();
        assert_eq!(saved.epoch, 3);
        assert_eq!(saved.monitor, "val_loss");
    }

    #[test]
    fn test_max_mode() {
        let checkpoint = BestCheckpoint {
            weight_path: PathBuf::from("unused"),
            monitor: "val_psnr".to_string(),
            mode: MonitorMode::Max,
            best: Some(30.0),
            best_epoch: Some(1),
        };
        assert!(checkpoint.is_improvement(31.0));
        assert!(!checkpoint.is_improvement(29.0));
    }
}
