//! Building blocks shared by the residual super-resolution networks
//!
//! - `ResidualBlock`: conv -> [BN] -> ReLU -> conv -> [BN] -> scale -> add skip
//! - `PixelShuffle`: sub-pixel rearrangement of `C * r^2` channels into an `r`x larger image
//! - `UpscaleBlock`: one or two upsampling stages for a 2x, 3x or 4x network

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        interpolate::{Interpolate2d, Interpolate2dConfig, InterpolateMode},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, SrError};

/// Upscale factors an `UpscaleBlock` can be built for
pub const SUPPORTED_SCALES: [usize; 3] = [2, 3, 4];

/// `same`-padded square convolution
pub fn conv_same<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
        .with_padding(PaddingConfig2d::Same)
        .init(device)
}

/// Residual block with optional batch normalization
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: Option<BatchNorm<B>>,
    pub conv2: Conv2d<B>,
    pub bn2: Option<BatchNorm<B>>,
    pub relu: Relu,
    /// Multiplier on the residual branch before the skip addition
    res_scale: f64,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(
        filters: usize,
        kernel_size: usize,
        batch_norm: bool,
        res_scale: f64,
        device: &B::Device,
    ) -> Self {
        let bn = || {
            if batch_norm {
                Some(BatchNormConfig::new(filters).init(device))
            } else {
                None
            }
        };

        Self {
            conv1: conv_same(filters, filters, kernel_size, device),
            bn1: bn(),
            conv2: conv_same(filters, filters, kernel_size, device),
            bn2: bn(),
            relu: Relu::new(),
            res_scale,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let skip = x.clone();

        let x = self.conv1.forward(x);
        let x = match &self.bn1 {
            Some(bn) => bn.forward(x),
            None => x,
        };
        let x = self.relu.forward(x);

        let x = self.conv2.forward(x);
        let x = match &self.bn2 {
            Some(bn) => bn.forward(x),
            None => x,
        };

        let x = if self.res_scale != 1.0 {
            x.mul_scalar(self.res_scale)
        } else {
            x
        };

        x + skip
    }

    pub fn kernels(&self, prefix: &str) -> Vec<(String, Tensor<B, 4>)> {
        vec![
            (format!("{}.conv1", prefix), self.conv1.weight.val()),
            (format!("{}.conv2", prefix), self.conv2.weight.val()),
        ]
    }
}

/// Sub-pixel upscaling: `[b, c*r*r, h, w]` -> `[b, c, h*r, w*r]`
#[derive(Module, Clone, Debug)]
pub struct PixelShuffle {
    factor: usize,
}

impl PixelShuffle {
    pub fn new(factor: usize) -> Self {
        Self { factor }
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let r = self.factor;
        let [batch, channels, height, width] = x.dims();
        let out_channels = channels / (r * r);

        x.reshape([batch, out_channels, r, r, height, width])
            .permute([0, 1, 4, 2, 5, 3])
            .reshape([batch, out_channels, height * r, width * r])
    }
}

/// How an upscale stage enlarges its input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpscaleMode {
    /// Nearest-neighbour upsample, then conv + ReLU
    Nearest,
    /// Bilinear upsample, then conv + ReLU
    Bilinear,
    /// Conv to `filters * r^2` features, then pixel shuffle
    SubPixel,
    /// Strided transposed convolution + ReLU
    Deconvolution,
}

impl Default for UpscaleMode {
    fn default() -> Self {
        Self::Nearest
    }
}

impl std::str::FromStr for UpscaleMode {
    type Err = SrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "bilinear" => Ok(Self::Bilinear),
            "subpixel" | "sub_pixel" | "sub-pixel" => Ok(Self::SubPixel),
            "deconv" | "deconvolution" => Ok(Self::Deconvolution),
            other => Err(SrError::Config(format!("Unknown upscale mode '{}'", other))),
        }
    }
}

/// Stage factors for an overall upscale factor
pub fn stage_factors(scale: usize) -> Result<Vec<usize>> {
    match scale {
        2 => Ok(vec![2]),
        3 => Ok(vec![3]),
        4 => Ok(vec![2, 2]),
        other => Err(SrError::UnsupportedScale(other)),
    }
}

/// A single upsampling stage keeping `filters` channels
#[derive(Module, Debug)]
pub struct UpscaleStage<B: Backend> {
    pub interpolate: Option<Interpolate2d>,
    pub conv: Option<Conv2d<B>>,
    pub shuffle: Option<PixelShuffle>,
    pub deconv: Option<ConvTranspose2d<B>>,
    pub relu: Option<Relu>,
}

impl<B: Backend> UpscaleStage<B> {
    pub fn new(
        mode: UpscaleMode,
        factor: usize,
        filters: usize,
        kernel_size: usize,
        device: &B::Device,
    ) -> Self {
        let empty = Self {
            interpolate: None,
            conv: None,
            shuffle: None,
            deconv: None,
            relu: None,
        };

        match mode {
            UpscaleMode::Nearest | UpscaleMode::Bilinear => {
                let interpolate_mode = if mode == UpscaleMode::Nearest {
                    InterpolateMode::Nearest
                } else {
                    InterpolateMode::Linear
                };
                Self {
                    interpolate: Some(
                        Interpolate2dConfig::new()
                            .with_scale_factor(Some([factor as f32, factor as f32]))
                            .with_mode(interpolate_mode)
                            .init(),
                    ),
                    conv: Some(conv_same(filters, filters, kernel_size, device)),
                    relu: Some(Relu::new()),
                    ..empty
                }
            }
            UpscaleMode::SubPixel => Self {
                conv: Some(conv_same(filters, filters * factor * factor, kernel_size, device)),
                shuffle: Some(PixelShuffle::new(factor)),
                ..empty
            },
            UpscaleMode::Deconvolution => {
                // Output side is (h - 1) * stride - 2 * padding + kernel = h * factor
                let (kernel, padding) = if factor == 2 { (4, 1) } else { (factor, 0) };
                Self {
                    deconv: Some(
                        ConvTranspose2dConfig::new([filters, filters], [kernel, kernel])
                            .with_stride([factor, factor])
                            .with_padding([padding, padding])
                            .init(device),
                    ),
                    relu: Some(Relu::new()),
                    ..empty
                }
            }
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.interpolate {
            Some(interpolate) => interpolate.forward(x),
            None => x,
        };
        let x = match &self.deconv {
            Some(deconv) => deconv.forward(x),
            None => x,
        };
        let x = match &self.conv {
            Some(conv) => conv.forward(x),
            None => x,
        };
        let x = match &self.shuffle {
            Some(shuffle) => shuffle.forward(x),
            None => x,
        };
        match &self.relu {
            Some(relu) => relu.forward(x),
            None => x,
        }
    }

    pub fn kernels(&self, prefix: &str) -> Vec<(String, Tensor<B, 4>)> {
        let mut kernels = Vec::new();
        if let Some(conv) = &self.conv {
            kernels.push((format!("{}.conv", prefix), conv.weight.val()));
        }
        if let Some(deconv) = &self.deconv {
            kernels.push((format!("{}.deconv", prefix), deconv.weight.val()));
        }
        kernels
    }
}

/// Upsampling for a whole network: one stage for 2x/3x, two 2x stages for 4x
#[derive(Module, Debug)]
pub struct UpscaleBlock<B: Backend> {
    pub stages: Vec<UpscaleStage<B>>,
    scale: usize,
}

impl<B: Backend> UpscaleBlock<B> {
    /// Fails with `UnsupportedScale` unless `scale` is 2, 3 or 4
    pub fn new(
        scale: usize,
        mode: UpscaleMode,
        filters: usize,
        kernel_size: usize,
        device: &B::Device,
    ) -> Result<Self> {
        let stages = stage_factors(scale)?
            .into_iter()
            .map(|factor| UpscaleStage::new(mode, factor, filters, kernel_size, device))
            .collect();

        Ok(Self { stages, scale })
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.stages.iter().fold(x, |x, stage| stage.forward(x))
    }

    pub fn kernels(&self, prefix: &str) -> Vec<(String, Tensor<B, 4>)> {
        self.stages
            .iter()
            .enumerate()
            .flat_map(|(i, stage)| stage.kernels(&format!("{}.{}", prefix, i)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_pixel_shuffle_layout() {
        let device = Default::default();
        // One output channel, factor 2: channel k fills offset (k / 2, k % 2)
        let data: Vec<f32> = vec![0.0, 1.0, 2.0, 3.0];
        let x = Tensor::<TestBackend, 4>::from_data(TensorData::new(data, [1, 4, 1, 1]), &device);

        let y = PixelShuffle::new(2).forward(x);
        assert_eq!(y.dims(), [1, 1, 2, 2]);

        let values: Vec<f32> = y.into_data().to_vec().unwrap();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_pixel_shuffle_shape() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::zeros([2, 27, 5, 6], &device);
        let y = PixelShuffle::new(3).forward(x);
        assert_eq!(y.dims(), [2, 3, 15, 18]);
    }

    #[test]
    fn test_residual_block_keeps_shape() {
        let device = Default::default();
        let block = ResidualBlock::<TestBackend>::new(8, 3, true, 1.0, &device);
        let x = Tensor::<TestBackend, 4>::ones([1, 8, 6, 6], &device);
        assert_eq!(block.forward(x).dims(), [1, 8, 6, 6]);
    }

    #[test]
    fn test_upscale_block_all_modes_and_scales() {
        let device = Default::default();
        let modes = [
            UpscaleMode::Nearest,
            UpscaleMode::Bilinear,
            UpscaleMode::SubPixel,
            UpscaleMode::Deconvolution,
        ];

        for mode in modes {
            for scale in SUPPORTED_SCALES {
                let block = UpscaleBlock::<TestBackend>::new(scale, mode, 4, 3, &device).unwrap();
                let x = Tensor::<TestBackend, 4>::ones([1, 4, 5, 7], &device);
                assert_eq!(
                    block.forward(x).dims(),
                    [1, 4, 5 * scale, 7 * scale],
                    "mode {:?} scale {}",
                    mode,
                    scale
                );
            }
        }
    }

    #[test]
    fn test_upscale_block_kernels() {
        let device = Default::default();
        let block = UpscaleBlock::<TestBackend>::new(4, UpscaleMode::SubPixel, 4, 3, &device).unwrap();
        let kernels = block.kernels("upscale");

        let names: Vec<&str> = kernels.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["upscale.0.conv", "upscale.1.conv"]);
        assert_eq!(kernels[0].1.dims(), [16, 4, 3, 3]);
    }

    #[test]
    fn test_upscale_block_rejects_unsupported_scale() {
        let device = Default::default();
        for scale in [0, 1, 5, 8] {
            let result = UpscaleBlock::<TestBackend>::new(scale, UpscaleMode::SubPixel, 4, 3, &device);
            assert!(matches!(result, Err(SrError::UnsupportedScale(s)) if s == scale));
        }
    }

    #[test]
    fn test_upscale_mode_from_str() {
        assert_eq!("subpixel".parse::<UpscaleMode>().unwrap(), UpscaleMode::SubPixel);
        assert_eq!("Deconv".parse::<UpscaleMode>().unwrap(), UpscaleMode::Deconvolution);
        assert!("bicubic".parse::<UpscaleMode>().is_err());
    }
}
