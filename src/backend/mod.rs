//! Execution backends.
//!
//! Both backends run the same discretisation from [`crate::kernel`]; they
//! differ only in where the per-sample passes execute.

pub mod cpu;
pub mod gpu;
mod shaders;

pub use cpu::CpuBackend;
pub use gpu::{GpuBackend, GpuConfig};

use crate::device::Device;
use crate::error::Result;
use crate::fgp::FgpTvParams;
use crate::image::{Image, Shape};
use crate::rof::RofTvParams;

/// An execution target able to hold images and run the solvers.
///
/// Solver methods validate their parameters first and always return a
/// host-resident image of the input's shape.
pub trait Backend: Send + Sync {
    fn device(&self) -> Device;

    /// Zero-initialised image resident on this backend.
    fn allocate(&self, shape: Shape) -> Result<Image>;

    /// Copy of `image` resident on this backend; shares the samples when they
    /// already live there.
    fn transfer(&self, image: &Image) -> Result<Image>;

    fn rof_tv(&self, input: &Image, params: &RofTvParams) -> Result<Image>;

    fn fgp_tv(&self, input: &Image, params: &FgpTvParams) -> Result<Image>;
}
