//! Rudin-Osher-Fatemi TV denoising by explicit time marching.
//!
//! Minimises `½‖u − f‖² + λ·TV(u)` with forward-Euler steps
//! `u ← u + τ·(λ·div(∇u/|∇u|) − (u − f))`, starting from `u = f` and running
//! exactly `number_of_iterations` steps.

use log::debug;
use web_time::Instant;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::image::Image;

/// Parameters of one ROF-TV call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RofTvParams {
    /// Regularisation weight λ.
    pub regularisation_parameter: f32,
    pub number_of_iterations: usize,
    /// Time-marching step τ. Stability is the caller's responsibility.
    pub time_marching_parameter: f32,
    pub device: Device,
}

impl Default for RofTvParams {
    fn default() -> Self {
        Self {
            regularisation_parameter: 0.04,
            number_of_iterations: 50,
            time_marching_parameter: 0.0025,
            device: Device::Cpu,
        }
    }
}

impl RofTvParams {
    pub fn new(
        regularisation_parameter: f32,
        number_of_iterations: usize,
        time_marching_parameter: f32,
    ) -> Self {
        Self {
            regularisation_parameter,
            number_of_iterations,
            time_marching_parameter,
            ..Default::default()
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn validate(&self) -> Result<()> {
        positive("regularisation_parameter", self.regularisation_parameter)?;
        positive("time_marching_parameter", self.time_marching_parameter)?;
        if self.number_of_iterations < 1 {
            return Err(Error::invalid(
                "number_of_iterations",
                "at least one iteration is required",
            ));
        }
        Ok(())
    }
}

pub(crate) fn positive(name: &'static str, value: f32) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(Error::invalid(
            name,
            format!("must be a positive finite number, got {value}"),
        ));
    }
    Ok(())
}

/// Denoises `input` with ROF-TV on the device named in `params`.
///
/// Returns a new host image of the same shape; `input` is left untouched.
///
/// # Example
///
/// ```
/// use tv_regularisers::{rof_tv, Image, RofTvParams, Shape};
///
/// let input = Image::new(Shape::D2 { height: 2, width: 2 }, vec![0.5; 4]).unwrap();
/// let output = rof_tv(&input, &RofTvParams::default()).unwrap();
/// assert_eq!(output.shape(), input.shape());
/// ```
pub fn rof_tv(input: &Image, params: &RofTvParams) -> Result<Image> {
    params.validate()?;
    let backend = params.device.backend()?;
    backend.rof_tv(input, params)
}

/// Per-iteration work a backend provides for ROF-TV.
pub(crate) trait RofKernels {
    /// One explicit step: fluxes from the current iterate, then the update.
    fn step(&mut self) -> Result<()>;

    /// Hands back the final iterate as a host image.
    fn finish(self) -> Result<Image>;
}

pub(crate) fn iterate<K: RofKernels>(
    mut kernels: K,
    params: &RofTvParams,
    device: Device,
) -> Result<Image> {
    let start_time = Instant::now();
    for _ in 0..params.number_of_iterations {
        kernels.step()?;
    }
    let output = kernels.finish()?;
    debug!(
        "ROF-TV ({device}): {} iterations, λ={}, τ={} in {:?}",
        params.number_of_iterations,
        params.regularisation_parameter,
        params.time_marching_parameter,
        start_time.elapsed()
    );
    Ok(output)
}
