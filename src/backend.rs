//! Backend selection.
//!
//! The device is picked once at startup from the enabled cargo features: `wgpu` runs on
//! the best adapter wgpu can find, otherwise inference runs on the CPU with `ndarray`.
//! Neither backend tracks gradients, so every forward pass is pure inference.

use burn::tensor::Device;

cfg_if::cfg_if! {
    if #[cfg(feature = "wgpu")] {
        pub type InferenceBackend = burn::backend::Wgpu;
    } else if #[cfg(feature = "ndarray")] {
        pub type InferenceBackend = burn::backend::NdArray<f32>;
    } else {
        compile_error!("Enable one of the `ndarray` or `wgpu` features to select a backend");
    }
}

/// Device inference runs on.
pub fn default_device() -> Device<InferenceBackend> {
    Default::default()
}
