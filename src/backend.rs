//! Backend selection
//!
//! The CLI trains on `Autodiff<DefaultBackend>` and runs inference on the
//! plain backend. `cuda` wins when enabled, otherwise NdArray on the CPU.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
pub type DefaultBackend = burn_ndarray::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray"), not(feature = "cpu")))]
compile_error!("At least one backend (cuda, ndarray, or cpu) must be enabled!");

/// Backend used by `fit`
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Backend used by `gen_sr_img` and `evaluate`
pub type InferenceBackend = DefaultBackend;

pub type Device = <DefaultBackend as Backend>::Device;

pub fn default_device() -> Device {
    Device::default()
}

/// Human-readable name of the compiled backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
    {
        "NdArray (CPU)"
    }
}
