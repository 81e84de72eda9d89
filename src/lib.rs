//! # srnet
//!
//! Super-resolution convolutional networks on the Burn framework: the SRCNN,
//! ResNetSR and EDSR topologies, a patch dataset pipeline, a training loop
//! with best-weights checkpointing, and PSNR evaluation on whole images.
//!
//! ## Modules
//!
//! - `dataset`: image decoding, patch slicing/merging, the on-disk patch store and batching
//! - `model`: the `SrNetwork` trait, the `SrModel` driver and the three topologies
//! - `training`: `SrModel::fit`, checkpoints and the event log
//! - `inference`: `SrModel::gen_sr_img` and `SrModel::evaluate`
//! - `config`: TOML experiment files
//! - `utils`: errors, logging and PSNR
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use srnet::backend::{default_device, TrainingBackend};
//! use srnet::dataset::{DatasetConfig, SrDataset};
//! use srnet::model::{Edsr, EdsrConfig, SrModel};
//! use srnet::training::FitConfig;
//!
//! let config = DatasetConfig::default();
//! let train = SrDataset::new("data/train", config.clone())?;
//! let val = SrDataset::new("data/val", config)?;
//! train.save()?;
//! val.save()?;
//!
//! let mut model: SrModel<TrainingBackend, Edsr<TrainingBackend>> =
//!     SrModel::new("x2", [16, 16], 3, EdsrConfig::new(), &default_device())?;
//! model.fit(&train, &val, &FitConfig::default())?;
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::ExperimentConfig;
pub use dataset::{DatasetConfig, SliceMode, SrDataset, SrImage};
pub use inference::{EvaluationReport, SrOutput};
pub use model::{
    Edsr, EdsrConfig, ResNetSr, ResNetSrConfig, SrArchitecture, SrModel, SrNetwork, Srcnn,
    SrcnnConfig, UpscaleMode,
};
pub use training::{FitConfig, FitHistory, SrLoss};
pub use utils::error::{Result, SrError};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
