//! Compute backend selection.
//!
//! Generic stage code is written once against `AutodiffBackend`; the
//! configured [`DeviceType`] picks the concrete backend at runtime.

use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
use burn::tensor::backend::AutodiffBackend;

use crate::config::DeviceType;

/// CPU backend with autodiff
pub type CpuBackend = Autodiff<NdArray>;

/// GPU backend with autodiff
#[cfg(feature = "wgpu")]
pub type GpuBackend = Autodiff<burn::backend::Wgpu>;

/// Work that runs on whichever backend the configuration selects
pub trait BackendTask {
    type Output;

    fn run<B: AutodiffBackend>(self, device: B::Device) -> Self::Output;
}

/// Run `task` on the backend for `device`.
///
/// Without the `wgpu` feature a GPU request falls back to the CPU backend.
pub fn dispatch<T: BackendTask>(device: DeviceType, task: T) -> T::Output {
    tracing::info!("Compute device: {}", device);
    match device {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            task.run::<GpuBackend>(burn::backend::wgpu::WgpuDevice::default())
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            tracing::warn!("built without the wgpu feature, falling back to CPU (NdArray)");
            task.run::<CpuBackend>(NdArrayDevice::Cpu)
        }
        DeviceType::Cpu => task.run::<CpuBackend>(NdArrayDevice::Cpu),
    }
}
