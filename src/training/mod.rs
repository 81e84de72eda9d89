//! Training module for super-resolution networks
//!
//! This module provides:
//! - `SrModel::fit`, a hand-written Burn training loop over patch stores
//! - Loss selection (MSE or MAE) with PSNR as the reported metric
//! - Best-weights checkpointing on the validation loss
//! - A TensorBoard event log of scalars, weight histograms and SR samples

pub mod checkpoint;
pub mod events;
pub mod trainer;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use burn::{
    nn::loss::{MseLoss, Reduction},
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, SrError};

pub use checkpoint::{BestCheckpoint, CheckpointMetadata, MonitorMode};
pub use events::{EventLog, Histogram};

/// Default number of training epochs
pub const DEFAULT_EPOCHS: usize = 100;

/// Default batch size
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// Default learning rate
pub const DEFAULT_LEARNING_RATE: f64 = 1e-4;

/// Quantity the best checkpoint monitors
pub const MONITOR: &str = "val_loss";

/// Pixel loss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrLoss {
    #[default]
    Mse,
    Mae,
}

impl SrLoss {
    /// Mean loss over every element of the batch
    pub fn forward<B: Backend>(&self, pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        match self {
            SrLoss::Mse => MseLoss::new().forward(pred, target, Reduction::Mean),
            SrLoss::Mae => (pred - target).abs().mean(),
        }
    }
}

impl fmt::Display for SrLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SrLoss::Mse => write!(f, "mse"),
            SrLoss::Mae => write!(f, "mae"),
        }
    }
}

impl FromStr for SrLoss {
    type Err = SrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mse" | "mean_squared_error" => Ok(SrLoss::Mse),
            "mae" | "mean_absolute_error" => Ok(SrLoss::Mae),
            other => Err(SrError::Config(format!("Unknown loss '{}'", other))),
        }
    }
}

/// Options for `SrModel::fit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub batch_size: usize,
    pub learning_rate: f64,
    pub loss: SrLoss,
    /// Reshuffle the training patches every epoch
    pub shuffle: bool,
    pub nb_epochs: usize,
    /// Write the TensorBoard event log under `log_dir`
    pub save_history: bool,
    pub log_dir: PathBuf,
    /// Log a histogram of every convolution kernel after each epoch
    pub weight_histograms: bool,
    /// Log the network output for the first validation patch after each epoch
    pub sr_images: bool,
    /// Load batch rows on a thread pool of `workers` threads
    pub multiprocess: bool,
    pub workers: usize,
    pub seed: u64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            learning_rate: DEFAULT_LEARNING_RATE,
            loss: SrLoss::Mse,
            shuffle: true,
            nb_epochs: DEFAULT_EPOCHS,
            save_history: true,
            log_dir: PathBuf::from("./logs"),
            weight_histograms: true,
            sr_images: true,
            multiprocess: false,
            workers: 4,
            seed: 42,
        }
    }
}

impl FitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SrError::Config("batch_size must be positive".to_string()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(SrError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.multiprocess && self.workers == 0 {
            return Err(SrError::Config(
                "multiprocess loading needs at least one worker".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metrics of one finished epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1-based
    pub epoch: usize,
    pub train_loss: f64,
    pub train_psnr: f64,
    pub val_loss: f64,
    pub val_psnr: f64,
}

/// Everything `fit` observed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitHistory {
    pub epochs: Vec<EpochRecord>,
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
    pub steps: usize,
}

impl FitHistory {
    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray;

    #[test]
    fn test_losses() {
        let device = Default::default();
        let pred = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.0f32, 0.5, 1.0, 1.0], [1, 1, 2, 2]),
            &device,
        );
        let target = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);

        let mse: f32 = SrLoss::Mse.forward(pred.clone(), target.clone()).into_scalar();
        let mae: f32 = SrLoss::Mae.forward(pred, target).into_scalar();

        assert!((mse - 2.25 / 4.0).abs() < 1e-6);
        assert!((mae - 2.5 / 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_fit_config_from_partial_toml() {
        let config: FitConfig = toml::from_str("batch_size = 4\nloss = \"mae\"").unwrap();
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.loss, SrLoss::Mae);
        assert_eq!(config.nb_epochs, DEFAULT_EPOCHS);
        assert!(config.validate().is_ok());

        let bad = FitConfig {
            learning_rate: 0.0,
            ..FitConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_loss_parsing() {
        assert_eq!("MSE".parse::<SrLoss>().unwrap(), SrLoss::Mse);
        assert!("huber".parse::<SrLoss>().is_err());
    }
}
