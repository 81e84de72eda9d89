//! Super-resolution networks built with the Burn framework
//!
//! This module provides:
//! - The [`SrNetwork`] trait every topology implements
//! - [`SrModel`], the driver owning a network, its name and its weight file
//! - Shared residual and upscale blocks
//! - The SRCNN, ResNetSR and EDSR topologies
//!
//! Training lives in [`crate::training`], inference in [`crate::inference`];
//! both are exposed as methods on [`SrModel`].

pub mod blocks;
pub mod edsr;
pub mod resnet_sr;
pub mod srcnn;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use burn::{
    config::Config,
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::utils::error::{Result, SrError};
use crate::utils::format_number;

pub use blocks::{ResidualBlock, UpscaleBlock, UpscaleMode, SUPPORTED_SCALES};
pub use edsr::{Edsr, EdsrConfig};
pub use resnet_sr::{ResNetSr, ResNetSrConfig};
pub use srcnn::{Srcnn, SrcnnConfig};

/// Default directory for weight files
pub const DEFAULT_WEIGHT_DIR: &str = "weights";

/// Default directory for generated SR images
pub const DEFAULT_OUTPUT_DIR: &str = "results";

/// Recorder for weight files; full precision so resumed training is lossless
pub type WeightRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Extension the weight recorder gives weight files
pub const WEIGHT_EXTENSION: &str = "mpk";

/// Default number of patches per inference batch
pub const DEFAULT_PREDICT_BATCH_SIZE: usize = 32;

/// A super-resolution topology
///
/// Implementors are plain Burn modules; `init` is the graph construction
/// step and may fail, for example on an unsupported scale.
pub trait SrNetwork<B: Backend>: Module<B> + Sized {
    type Config: Config + fmt::Debug;

    /// Family name used in model names and weight files
    const FAMILY: &'static str;

    fn init(config: &Self::Config, channels: usize, device: &B::Device) -> Result<Self>;

    /// `[batch, channels, h, w]` -> `[batch, channels, h * scale, w * scale]`
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Spatial upscale factor between input and output
    fn scale(&self) -> usize;

    /// Convolution kernels by layer name
    fn kernels(&self) -> Vec<(String, Tensor<B, 4>)>;

    /// Whether inputs are LR images already interpolated to HR size
    fn interpolated_input(&self) -> bool {
        false
    }
}

/// Topologies selectable at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrArchitecture {
    Srcnn,
    #[serde(alias = "resnet_sr")]
    ResNetSr,
    Edsr,
}

impl SrArchitecture {
    pub fn family(&self) -> &'static str {
        match self {
            Self::Srcnn => "SRCNN",
            Self::ResNetSr => "ResNetSR",
            Self::Edsr => "EDSR",
        }
    }
}

impl fmt::Display for SrArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.family())
    }
}

impl FromStr for SrArchitecture {
    type Err = SrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "srcnn" => Ok(Self::Srcnn),
            "resnetsr" | "resnet" => Ok(Self::ResNetSr),
            "edsr" => Ok(Self::Edsr),
            other => Err(SrError::Config(format!("Unknown architecture '{}'", other))),
        }
    }
}

/// A named network together with its weight file
///
/// The network is built as soon as the model is constructed. Weights are
/// only read from disk through [`SrModel::load_weights`] or
/// `create_model(true)`.
#[derive(Debug)]
pub struct SrModel<B: Backend, N: SrNetwork<B>> {
    model_name: String,
    model_type: String,
    weight_dir: PathBuf,
    output_dir: PathBuf,
    input_size: [usize; 2],
    channels: usize,
    predict_batch_size: usize,
    config: N::Config,
    network: N,
    device: B::Device,
}

impl<B: Backend, N: SrNetwork<B>> SrModel<B, N> {
    /// Build the network for `config`
    ///
    /// # Arguments
    /// * `model_type` - Variant tag, e.g. `x2`, appended to the family name
    /// * `input_size` - `[height, width]` of the network input patches
    /// * `channels` - 1 for luma, 3 for RGB
    pub fn new(
        model_type: &str,
        input_size: [usize; 2],
        channels: usize,
        config: N::Config,
        device: &B::Device,
    ) -> Result<Self> {
        if channels != 1 && channels != 3 {
            return Err(SrError::Config(format!(
                "channels must be 1 or 3, got {}",
                channels
            )));
        }
        if input_size.contains(&0) {
            return Err(SrError::Config("input size must be positive".to_string()));
        }
        validate_model_type(model_type)?;

        let network = N::init(&config, channels, device)?;
        let model_name = format!("{}{}", N::FAMILY, model_type);
        info!(
            "Built {} ({} parameters)",
            model_name,
            format_number(network.num_params())
        );

        Ok(Self {
            model_name,
            model_type: model_type.to_string(),
            weight_dir: PathBuf::from(DEFAULT_WEIGHT_DIR),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            input_size,
            channels,
            predict_batch_size: DEFAULT_PREDICT_BATCH_SIZE,
            config,
            network,
            device: device.clone(),
        })
    }

    pub fn with_weight_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.weight_dir = dir.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_predict_batch_size(mut self, batch_size: usize) -> Self {
        self.predict_batch_size = batch_size.max(1);
        self
    }

    /// Rebuild the network, optionally loading the saved weights
    pub fn create_model(&mut self, load_weights: bool) -> Result<()> {
        self.network = N::init(&self.config, self.channels, &self.device)?;
        if load_weights {
            self.load_weights()?;
        }
        Ok(())
    }

    /// Replace the network weights with the ones on disk
    pub fn load_weights(&mut self) -> Result<()> {
        let file = self.weight_file();
        if !file.is_file() {
            return Err(SrError::Checkpoint(format!(
                "Weight file not found: {:?}",
                file
            )));
        }

        let recorder = WeightRecorder::new();
        self.network = self
            .network
            .clone()
            .load_file(self.weight_path(), &recorder, &self.device)
            .map_err(|e| SrError::Checkpoint(format!("Failed to load {:?}: {:?}", file, e)))?;

        info!("Loaded weights for {} from {:?}", self.model_name, file);
        Ok(())
    }

    /// Write the current weights, returning the file written
    pub fn save_weights(&self) -> Result<PathBuf> {
        save_network_weights::<B, N>(&self.network, &self.weight_path())?;
        Ok(self.weight_file())
    }

    /// `<family><model_type>`, e.g. `EDSRx2`
    pub fn name(&self) -> &str {
        &self.model_name
    }

    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    /// Weight path without the recorder extension
    pub fn weight_path(&self) -> PathBuf {
        self.weight_dir
            .join(format!("{} Weights {}", N::FAMILY, self.model_type))
    }

    /// Weight file as written by the recorder
    pub fn weight_file(&self) -> PathBuf {
        with_recorder_extension(&self.weight_path())
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn input_size(&self) -> [usize; 2] {
        self.input_size
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn predict_batch_size(&self) -> usize {
        self.predict_batch_size
    }

    pub fn config(&self) -> &N::Config {
        &self.config
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn set_network(&mut self, network: N) {
        self.network = network;
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn scale(&self) -> usize {
        self.network.scale()
    }

    pub fn num_params(&self) -> usize {
        self.network.num_params()
    }

    /// Check that stored patches fit this model's input and output
    pub fn check_shapes(&self, data_shape: [usize; 3], label_shape: [usize; 3]) -> Result<()> {
        let [h, w] = self.input_size;
        let scale = self.scale();
        let expected_data = [self.channels, h, w];
        let expected_label = [self.channels, h * scale, w * scale];

        if data_shape != expected_data || label_shape != expected_label {
            return Err(SrError::Model(format!(
                "{} expects patches {:?} -> {:?}, dataset provides {:?} -> {:?}",
                self.model_name, expected_data, expected_label, data_shape, label_shape
            )));
        }
        Ok(())
    }

    /// Human-readable overview of the model
    pub fn summary(&self) -> String {
        let [h, w] = self.input_size;
        let scale = self.scale();
        format!(
            "Model: {}\n  Family:      {}\n  Input:       {}x{}x{} ({})\n  Output:      {}x{}x{}\n  Scale:       x{}\n  Parameters:  {}\n  Weights:     {}\n  Config:      {:?}",
            self.model_name,
            N::FAMILY,
            self.channels,
            h,
            w,
            if self.network.interpolated_input() {
                "interpolated LR"
            } else {
                "LR"
            },
            self.channels,
            h * scale,
            w * scale,
            scale,
            format_number(self.num_params()),
            self.weight_file().display(),
            self.config,
        )
    }
}

/// Model types end up in weight file names
///
/// The recorder replaces anything after a dot with its own extension, so a
/// dotted type would be saved under a different name than it is loaded from.
fn validate_model_type(model_type: &str) -> Result<()> {
    if model_type.contains(['.', '/', '\\']) {
        return Err(SrError::Config(format!(
            "model type '{}' must not contain '.', '/' or '\\'",
            model_type
        )));
    }
    Ok(())
}

/// Save a network with the weight recorder, creating parent directories
pub fn save_network_weights<B: Backend, M: Module<B>>(network: &M, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let recorder = WeightRecorder::new();
    network
        .clone()
        .save_file(path.to_path_buf(), &recorder)
        .map_err(|e| SrError::Checkpoint(format!("Failed to save {:?}: {:?}", path, e)))
}

/// Append the recorder's file extension to a weight path
pub fn with_recorder_extension(path: &Path) -> PathBuf {
    let mut file = path.as_os_str().to_owned();
    file.push(".");
    file.push(WEIGHT_EXTENSION);
    PathBuf::from(file)
}
