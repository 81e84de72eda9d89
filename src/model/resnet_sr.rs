//! ResNetSR
//!
//! A stack of batch-normalized residual blocks on LR features, a global skip
//! back to the first feature map, and an upscale block. The final conv is
//! linear.

use burn::{
    config::Config,
    module::Module,
    nn::{conv::Conv2d, Relu},
    tensor::{backend::Backend, Tensor},
};

use super::blocks::{conv_same, stage_factors, ResidualBlock, UpscaleBlock, UpscaleMode};
use super::SrNetwork;
use crate::utils::error::SrError;

#[derive(Config, Debug)]
pub struct ResNetSrConfig {
    /// Feature maps in the residual trunk
    #[config(default = "64")]
    pub n: usize,

    /// Kernel size of every trunk convolution
    #[config(default = "3")]
    pub f: usize,

    #[config(default = "5")]
    pub nb_residual: usize,

    /// Upscale factor, 2, 3 or 4
    #[config(default = "2")]
    pub scale: usize,

    #[config(default = "UpscaleMode::Nearest")]
    pub upscale_mode: UpscaleMode,

    #[config(default = "true")]
    pub batch_norm: bool,
}

impl ResNetSrConfig {
    pub fn validate(&self) -> crate::Result<()> {
        stage_factors(self.scale)?;
        if self.f == 0 || self.f % 2 == 0 {
            return Err(SrError::Config(format!(
                "f must be a positive odd kernel size, got {}",
                self.f
            )));
        }
        if self.n == 0 {
            return Err(SrError::Config("n must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Module, Debug)]
pub struct ResNetSr<B: Backend> {
    pub sr_res_conv1: Conv2d<B>,
    pub residuals: Vec<ResidualBlock<B>>,
    pub upscale: UpscaleBlock<B>,
    pub sr_res_conv_final: Conv2d<B>,
    pub relu: Relu,
}

impl<B: Backend> SrNetwork<B> for ResNetSr<B> {
    type Config = ResNetSrConfig;

    const FAMILY: &'static str = "ResNetSR";

    fn init(config: &ResNetSrConfig, channels: usize, device: &B::Device) -> crate::Result<Self> {
        config.validate()?;

        let residuals = (0..config.nb_residual)
            .map(|_| ResidualBlock::new(config.n, config.f, config.batch_norm, 1.0, device))
            .collect();

        Ok(Self {
            sr_res_conv1: conv_same(channels, config.n, config.f, device),
            residuals,
            upscale: UpscaleBlock::new(config.scale, config.upscale_mode, config.n, config.f, device)?,
            sr_res_conv_final: conv_same(config.n, channels, config.f, device),
            relu: Relu::new(),
        })
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x0 = self.relu.forward(self.sr_res_conv1.forward(x));

        let x = self
            .residuals
            .iter()
            .fold(x0.clone(), |x, block| block.forward(x));
        let x = x + x0;

        let x = self.upscale.forward(x);
        self.sr_res_conv_final.forward(x)
    }

    fn scale(&self) -> usize {
        self.upscale.scale()
    }

    fn kernels(&self) -> Vec<(String, Tensor<B, 4>)> {
        let mut kernels = vec![("sr_res_conv1".to_string(), self.sr_res_conv1.weight.val())];
        for (i, block) in self.residuals.iter().enumerate() {
            kernels.extend(block.kernels(&format!("residual{}", i)));
        }
        kernels.extend(self.upscale.kernels("upscale"));
        kernels.push(("sr_res_conv_final".to_string(), self.sr_res_conv_final.weight.val()));
        kernels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn small_config(scale: usize) -> ResNetSrConfig {
        ResNetSrConfig::new()
            .with_n(8)
            .with_nb_residual(2)
            .with_scale(scale)
    }

    #[test]
    fn test_output_is_input_times_scale() {
        let device = Default::default();
        for scale in [2, 3, 4] {
            let model = ResNetSr::<TestBackend>::init(&small_config(scale), 3, &device).unwrap();
            let input = Tensor::<TestBackend, 4>::zeros([2, 3, 6, 5], &device);

            assert_eq!(model.forward(input).dims(), [2, 3, 6 * scale, 5 * scale]);
            assert_eq!(model.scale(), scale);
        }
    }

    #[test]
    fn test_bilinear_upscale_single_channel() {
        let device = Default::default();
        let config = small_config(2).with_upscale_mode(UpscaleMode::Bilinear);
        let model = ResNetSr::<TestBackend>::init(&config, 1, &device).unwrap();
        let input = Tensor::<TestBackend, 4>::zeros([1, 1, 8, 8], &device);
        assert_eq!(model.forward(input).dims(), [1, 1, 16, 16]);
    }

    #[test]
    fn test_unsupported_scale_fails() {
        let device = Default::default();
        let result = ResNetSr::<TestBackend>::init(&small_config(5), 3, &device);
        assert!(matches!(result, Err(SrError::UnsupportedScale(5))));
    }
}
