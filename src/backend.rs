//! Compile-time backend selection
//!
//! `cuda` builds run on the first GPU; every other build runs on the CPU
//! through ndarray.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
pub type DefaultBackend = burn_ndarray::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray"), not(feature = "cpu")))]
compile_error!("Enable one of the `cuda`, `ndarray` or `cpu` features");

/// Backend used by the inference service (no gradient tracking)
pub type InferenceBackend = DefaultBackend;

/// Backend used for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Device the service and trainer use unless told otherwise
pub fn default_device() -> <DefaultBackend as Backend>::Device {
    <DefaultBackend as Backend>::Device::default()
}

/// Human-readable backend name for logs and the CLI
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(not(feature = "cuda"))]
    {
        "NdArray (CPU)"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_and_inference_share_device() {
        let device = default_device();
        let inner: <TrainingBackend as Backend>::Device = device.clone();
        assert_eq!(inner, device);
        assert!(!backend_name().is_empty());
    }
}
