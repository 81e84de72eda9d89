//! Metrics Module for Image Reconstruction
//!
//! PSNR in two forms:
//! - [`psnr`]: plain numeric comparison of two pixel buffers, used on merged images
//! - [`psnr_tensor`]: per-sample PSNR on Burn tensors, reported by the training loop
//!
//! Pixel values are expected in `[0, 1]`, so the default peak is `1.0`.

use burn::tensor::{backend::Backend, ElementConversion, Tensor};
use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, SrError};

/// Peak signal value for images normalized to [0, 1]
pub const DEFAULT_PEAK: f64 = 1.0;

/// Lower bound on the MSE inside [`psnr_tensor`] so identical batches stay finite
pub const MSE_FLOOR: f64 = 1e-10;

/// Mean squared error between two equally sized buffers
pub fn mse(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(SrError::Dataset(format!(
            "Cannot compare buffers of different length ({} vs {})",
            a.len(),
            b.len()
        )));
    }
    if a.is_empty() {
        return Err(SrError::Dataset("Cannot compare empty buffers".to_string()));
    }

    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum();

    Ok(sum / a.len() as f64)
}

/// Peak signal-to-noise ratio in dB
///
/// Returns `f64::INFINITY` when the buffers are identical.
pub fn psnr(a: &[f32], b: &[f32], peak: f64) -> Result<f64> {
    let mse = mse(a, b)?;
    if mse == 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(10.0 * (peak * peak / mse).log10())
}

/// Per-sample PSNR of a batch `[batch, channels, height, width]`
///
/// Returns a tensor of shape `[batch]`. Differentiable, so it can sit next to
/// the loss inside the training graph.
pub fn psnr_tensor<B: Backend>(pred: Tensor<B, 4>, target: Tensor<B, 4>, peak: f64) -> Tensor<B, 1> {
    let [batch, channels, height, width] = pred.dims();

    let diff = pred - target;
    let mse = (diff.clone() * diff)
        .reshape([batch, channels * height * width])
        .mean_dim(1)
        .reshape([batch])
        .clamp_min(MSE_FLOOR);

    mse.recip()
        .mul_scalar(peak * peak)
        .log()
        .mul_scalar(10.0 / std::f64::consts::LN_10)
}

/// Mean PSNR over a batch as a plain number
pub fn batch_psnr<B: Backend>(pred: Tensor<B, 4>, target: Tensor<B, 4>) -> f64 {
    psnr_tensor(pred, target, DEFAULT_PEAK)
        .mean()
        .into_scalar()
        .elem::<f64>()
}

/// Running average of a scalar metric
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricMeter {
    sum: f64,
    count: usize,
}

impl MetricMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value observed on `n` samples
    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Average of all updates, `0.0` when nothing was recorded
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}
