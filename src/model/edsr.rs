//! EDSR (Enhanced Deep Super-Resolution)
//!
//! Residual blocks without batch normalization by default, scaled residual
//! branches, a global skip, then sub-pixel upscaling.

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
pub struct EdsrConfig {
    /// Feature maps in the residual trunk
    #[config(default = "64")]
    pub n: usize,

    /// Kernel size of every trunk convolution
    #[config(default = "3")]
    pub f: usize,

    #[config(default = "10")]
    pub nb_residual: usize,

    /// Multiplier applied to each residual branch before the skip
    #[config(default = "1.0")]
    pub res_scale: f64,

    /// Upscale factor, 2, 3 or 4
    #[config(default = "2")]
    pub scale: usize,

    #[config(default = "UpscaleMode::SubPixel")]
    pub upscale_mode: UpscaleMode,

    #[config(default = "false")]
    pub batch_norm: bool,
}

impl EdsrConfig {
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
        if !(self.res_scale > 0.0) {
            return Err(SrError::Config(format!(
                "res_scale must be positive, got {}",
                self.res_scale
            )));
        }
        Ok(())
    }
}

#[derive(Module, Debug)]
pub struct Edsr<B: Backend> {
    pub sr_conv1: Conv2d<B>,
    pub residuals: Vec<ResidualBlock<B>>,
    pub sr_conv2: Conv2d<B>,
    pub sr_conv3: Conv2d<B>,
    pub upscale: UpscaleBlock<B>,
    pub sr_conv_final: Conv2d<B>,
    pub relu: Relu,
}

impl<B: Backend> SrNetwork<B> for Edsr<B> {
    type Config = EdsrConfig;

    const FAMILY: &'static str = "EDSR";

    fn init(config: &EdsrConfig, channels: usize, device: &B::Device) -> crate::Result<Self> {
        config.validate()?;

        let residuals = (0..config.nb_residual)
            .map(|_| {
                ResidualBlock::new(config.n, config.f, config.batch_norm, config.res_scale, device)
            })
            .collect();

        Ok(Self {
            sr_conv1: conv_same(channels, config.n, config.f, device),
            residuals,
            sr_conv2: conv_same(config.n, config.n, config.f, device),
            sr_conv3: conv_same(config.n, config.n, config.f, device),
            upscale: UpscaleBlock::new(config.scale, config.upscale_mode, config.n, config.f, device)?,
            sr_conv_final: conv_same(config.n, channels, config.f, device),
            relu: Relu::new(),
        })
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x0 = self.relu.forward(self.sr_conv1.forward(x));

        let x = self
            .residuals
            .iter()
            .fold(x0.clone(), |x, block| block.forward(x));
        let x = self.relu.forward(self.sr_conv2.forward(x));
        let x = x + x0;

        let x = self.sr_conv3.forward(x);
        let x = self.upscale.forward(x);
        self.relu.forward(self.sr_conv_final.forward(x))
    }

    fn scale(&self) -> usize {
        self.upscale.scale()
    }

    fn kernels(&self) -> Vec<(String, Tensor<B, 4>)> {
        let mut kernels = vec![("sr_conv1".to_string(), self.sr_conv1.weight.val())];
        for (i, block) in self.residuals.iter().enumerate() {
            kernels.extend(block.kernels(&format!("residual{}", i)));
        }
        kernels.push(("sr_conv2".to_string(), self.sr_conv2.weight.val()));
        kernels.push(("sr_conv3".to_string(), self.sr_conv3.weight.val()));
        kernels.extend(self.upscale.kernels("upscale"));
        kernels.push(("sr_conv_final".to_string(), self.sr_conv_final.weight.val()));
        kernels
    }
}
