//! SRCNN
//!
//! Three convolutions mapping a bicubic-interpolated LR image to its HR
//! reconstruction: patch extraction, non-linear mapping, reconstruction.
//! The network does not change the spatial size.

use burn::{
    config::Config,
    module::Module,
    nn::{conv::Conv2d, Relu},
    tensor::{backend::Backend, Tensor},
};

use super::blocks::conv_same;
use super::SrNetwork;
use crate::utils::error::SrError;

/// Configuration for the SRCNN model
#[derive(Config, Debug)]
pub struct SrcnnConfig {
    /// Kernel size of the patch extraction layer
    #[config(default = "9")]
    pub f1: usize,

    /// Kernel size of the mapping layer
    #[config(default = "1")]
    pub f2: usize,

    /// Kernel size of the reconstruction layer
    #[config(default = "5")]
    pub f3: usize,

    /// Filters in the patch extraction layer
    #[config(default = "64")]
    pub n1: usize,

    /// Filters in the mapping layer
    #[config(default = "32")]
    pub n2: usize,
}

impl SrcnnConfig {
    pub fn validate(&self) -> crate::Result<()> {
        for (name, k) in [("f1", self.f1), ("f2", self.f2), ("f3", self.f3)] {
            if k == 0 || k % 2 == 0 {
                return Err(SrError::Config(format!(
                    "{} must be a positive odd kernel size, got {}",
                    name, k
                )));
            }
        }
        if self.n1 == 0 || self.n2 == 0 {
            return Err(SrError::Config("filter counts must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Module, Debug)]
pub struct Srcnn<B: Backend> {
    pub level1: Conv2d<B>,
    pub level2: Conv2d<B>,
    pub output: Conv2d<B>,
    pub relu: Relu,
}

impl<B: Backend> SrNetwork<B> for Srcnn<B> {
    type Config = SrcnnConfig;

    const FAMILY: &'static str = "SRCNN";

    fn init(config: &SrcnnConfig, channels: usize, device: &B::Device) -> crate::Result<Self> {
        config.validate()?;

        Ok(Self {
            level1: conv_same(channels, config.n1, config.f1, device),
            level2: conv_same(config.n1, config.n2, config.f2, device),
            output: conv_same(config.n2, channels, config.f3, device),
            relu: Relu::new(),
        })
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.level1.forward(x));
        let x = self.relu.forward(self.level2.forward(x));
        self.output.forward(x)
    }

    fn scale(&self) -> usize {
        1
    }

    fn kernels(&self) -> Vec<(String, Tensor<B, 4>)> {
        vec![
            ("level1".to_string(), self.level1.weight.val()),
            ("level2".to_string(), self.level2.weight.val()),
            ("output".to_string(), self.output.weight.val()),
        ]
    }

    fn interpolated_input(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_srcnn_keeps_spatial_shape() {
        let device = Default::default();
        let config = SrcnnConfig::new().with_n1(8).with_n2(4);
        let model = Srcnn::<TestBackend>::init(&config, 3, &device).unwrap();

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 17, 23], &device);
        assert_eq!(model.forward(input).dims(), [2, 3, 17, 23]);
        assert_eq!(model.scale(), 1);

        let kernels = model.kernels();
        assert_eq!(kernels.len(), 3);
        assert_eq!(kernels[0].1.dims(), [8, 3, 9, 9]);
    }

    #[test]
    fn test_srcnn_single_channel() {
        let device = Default::default();
        let model = Srcnn::<TestBackend>::init(&SrcnnConfig::new(), 1, &device).unwrap();
        let input = Tensor::<TestBackend, 4>::zeros([1, 1, 12, 12], &device);
        assert_eq!(model.forward(input).dims(), [1, 1, 12, 12]);
    }

    #[test]
    fn test_srcnn_rejects_even_kernel() {
        let device = Default::default();
        let config = SrcnnConfig::new().with_f1(8);
        assert!(Srcnn::<TestBackend>::init(&config, 3, &device).is_err());
    }
}
