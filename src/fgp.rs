//! Fast Gradient Projection TV denoising (Beck & Teboulle).
//!
//! Works on the dual of the ROF problem: a gradient step on the dual
//! variable, a projection onto the per-pixel unit ball, and a Nesterov
//! extrapolation with `t_{k+1} = (1 + sqrt(1 + 4 t_k²)) / 2`. The primal
//! image is recovered as `u = f − λ·div R` at the start of every iteration.

use log::{debug, info, trace};
use web_time::Instant;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::kernel;
use crate::rof::positive;

/// Discrete TV norm used by the dual projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TvMethod {
    /// Euclidean norm of the gradient per pixel.
    #[default]
    Isotropic,
    /// Sum of absolute partial differences per pixel.
    Anisotropic,
}

impl TryFrom<i32> for TvMethod {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(TvMethod::Isotropic),
            1 => Ok(TvMethod::Anisotropic),
            other => Err(Error::invalid(
                "methodTV",
                format!("expected 0 (isotropic) or 1 (anisotropic), got {other}"),
            )),
        }
    }
}

/// Parameters of one FGP-TV call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FgpTvParams {
    /// Regularisation weight λ.
    pub regularisation_parameter: f32,
    /// Iteration budget.
    pub number_of_iterations: usize,
    /// Relative-change tolerance for early stopping; 0 disables it.
    pub tolerance_constant: f32,
    pub method: TvMethod,
    /// Clip the primal image to non-negative values.
    pub nonneg: bool,
    /// Log per-iteration diagnostics at `info` level.
    pub printing_out: bool,
    pub device: Device,
}

impl Default for FgpTvParams {
    fn default() -> Self {
        Self {
            regularisation_parameter: 0.04,
            number_of_iterations: 50,
            tolerance_constant: 1e-8,
            method: TvMethod::Isotropic,
            nonneg: false,
            printing_out: false,
            device: Device::Cpu,
        }
    }
}

impl FgpTvParams {
    pub fn new(
        regularisation_parameter: f32,
        number_of_iterations: usize,
        tolerance_constant: f32,
    ) -> Self {
        Self {
            regularisation_parameter,
            number_of_iterations,
            tolerance_constant,
            ..Default::default()
        }
    }

    pub fn with_method(mut self, method: TvMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_nonneg(mut self, nonneg: bool) -> Self {
        self.nonneg = nonneg;
        self
    }

    pub fn with_printing_out(mut self, printing_out: bool) -> Self {
        self.printing_out = printing_out;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn validate(&self) -> Result<()> {
        positive("regularisation_parameter", self.regularisation_parameter)?;
        if self.number_of_iterations < 1 {
            return Err(Error::invalid(
                "number_of_iterations",
                "at least one iteration is required",
            ));
        }
        if !self.tolerance_constant.is_finite() || self.tolerance_constant < 0.0 {
            return Err(Error::invalid(
                "tolerance_constant",
                format!("must be a finite non-negative number, got {}", self.tolerance_constant),
            ));
        }
        Ok(())
    }
}

/// Denoises `input` with FGP-TV on the device named in `params`.
///
/// Returns a new host image of the same shape; `input` is left untouched.
pub fn fgp_tv(input: &Image, params: &FgpTvParams) -> Result<Image> {
    params.validate()?;
    let backend = params.device.backend()?;
    backend.fgp_tv(input, params)
}

/// Per-iteration work a backend provides for FGP-TV.
///
/// The dual fields are stored interleaved: component `a` of sample `i` sits
/// at `i * ndim + a`.
pub(crate) trait FgpKernels {
    /// Keeps the current primal as the previous one, then
    /// `u = f − λ·div R`, clipped to `>= 0` when requested.
    fn primal(&mut self) -> Result<()>;

    /// `P = proj(R + step·∇⁻u)`.
    fn dual(&mut self) -> Result<()>;

    /// `R = P + momentum·(P − P_prev)`, then `P_prev = P`.
    fn extrapolate(&mut self, momentum: f32) -> Result<()>;

    /// `‖u − u_prev‖ / ‖u‖`.
    fn relative_change(&mut self) -> Result<f32>;

    fn finish(self) -> Result<Image>;
}

/// How an FGP solve ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    Converged { iteration: usize },
    BudgetExhausted,
}

pub(crate) fn iterate<K: FgpKernels>(
    mut kernels: K,
    params: &FgpTvParams,
    device: Device,
) -> Result<Image> {
    let start_time = Instant::now();
    let check_tolerance = params.tolerance_constant > 0.0;
    let mut t = 1.0f32;
    let mut hits = 0usize;
    let mut termination = Termination::BudgetExhausted;

    for iteration in 0..params.number_of_iterations {
        kernels.primal()?;
        kernels.dual()?;
        let t_next = kernel::next_momentum(t);
        kernels.extrapolate((t - 1.0) / t_next)?;
        t = t_next;

        if !check_tolerance || iteration == 0 {
            if params.printing_out {
                info!("FGP-TV iteration {}: t = {t:.4}", iteration + 1);
            }
            continue;
        }

        let change = kernels.relative_change()?;
        if params.printing_out {
            info!("FGP-TV iteration {}: relative change {change:.3e}", iteration + 1);
        } else {
            trace!("FGP-TV iteration {}: relative change {change:.3e}", iteration + 1);
        }
        if change < params.tolerance_constant {
            hits += 1;
            if hits >= kernel::TOLERANCE_HITS {
                termination = Termination::Converged {
                    iteration: iteration + 1,
                };
                break;
            }
        }
    }

    let output = kernels.finish()?;
    let iterations = match termination {
        Termination::Converged { iteration } => iteration,
        Termination::BudgetExhausted => params.number_of_iterations,
    };
    if params.printing_out {
        info!("FGP-TV iterations stopped at iteration {iterations} ({termination:?})");
    }
    debug!(
        "FGP-TV ({device}): {iterations} iterations, λ={}, {:?} in {:?}",
        params.regularisation_parameter,
        params.method,
        start_time.elapsed()
    );
    Ok(output)
}
