//! Total-variation image regularisation on CPU and GPU.
//!
//! Two iterative TV denoisers, ROF-TV (explicit time marching) and FGP-TV
//! (fast gradient projection on the dual), operate on 2D and 3D
//! single-precision [`Image`]s. Each call names the [`Device`] it runs on; the
//! CPU path parallelises over rows with rayon and the GPU path runs WGSL
//! compute shaders through wgpu. Both share one discretisation, so their
//! outputs agree to within float rounding.
//!
//! ```
//! use tv_regularisers::{fgp_tv, FgpTvParams, Image, Shape, TvMethod};
//!
//! let noisy = Image::new(
//!     Shape::D2 { height: 4, width: 4 },
//!     vec![0.1, 0.9, 0.2, 0.8, 0.9, 0.1, 0.8, 0.2, 0.1, 0.9, 0.2, 0.8, 0.9, 0.1, 0.8, 0.2],
//! )
//! .unwrap();
//! let params = FgpTvParams::new(0.04, 50, 1e-8).with_method(TvMethod::Isotropic);
//! let clean = fgp_tv(&noisy, &params).unwrap();
//! assert_eq!(clean.shape(), noisy.shape());
//! ```

pub mod backend;
pub mod device;
pub mod error;
pub mod fgp;
pub mod image;
mod kernel;
pub mod metrics;
pub mod regularisers;
pub mod rof;

pub use backend::{Backend, CpuBackend, GpuBackend, GpuConfig};
pub use device::Device;
pub use error::{DeviceError, Error, Result};
pub use fgp::{fgp_tv, FgpTvParams, TvMethod};
pub use image::{Image, Shape};
pub use metrics::{rmse, total_variation};
pub use regularisers::Regulariser;
pub use rof::{rof_tv, RofTvParams};

/// Zero-initialised image of `shape` resident on `device`.
pub fn allocate(shape: Shape, device: Device) -> Result<Image> {
    device.backend()?.allocate(shape)
}

/// Copy of `image` resident on `device`.
///
/// Images already on `device` are returned as a shared handle. Uploads open a
/// new GPU context; use [`GpuBackend::transfer`] to keep images on one device.
pub fn transfer(image: &Image, device: Device) -> Result<Image> {
    if image.device() == device {
        return Ok(image.clone());
    }
    device.backend()?.transfer(image)
}
