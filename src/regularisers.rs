//! Positional call surface and the [`Regulariser`] trait.
//!
//! The free functions here take the flat argument lists reconstruction scripts
//! are written against (integer switches, device names as strings) and map
//! them onto the typed parameter structs.

use crate::device::Device;
use crate::error::{Error, Result};
use crate::fgp::{self, FgpTvParams, TvMethod};
use crate::image::Image;
use crate::rof::{self, RofTvParams};

/// A denoiser usable as the proximal step of an outer reconstruction loop.
pub trait Regulariser {
    fn name(&self) -> &'static str;

    fn regularise(&self, input: &Image) -> Result<Image>;
}

impl Regulariser for RofTvParams {
    fn name(&self) -> &'static str {
        "ROF_TV"
    }

    fn regularise(&self, input: &Image) -> Result<Image> {
        rof::rof_tv(input, self)
    }
}

impl Regulariser for FgpTvParams {
    fn name(&self) -> &'static str {
        "FGP_TV"
    }

    fn regularise(&self, input: &Image) -> Result<Image> {
        fgp::fgp_tv(input, self)
    }
}

fn iterations(value: i32) -> Result<usize> {
    usize::try_from(value).map_err(|_| {
        Error::invalid(
            "number_of_iterations",
            format!("must be non-negative, got {value}"),
        )
    })
}

fn switch(name: &'static str, value: i32) -> Result<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Error::invalid(name, format!("expected 0 or 1, got {other}"))),
    }
}

/// ROF-TV with positional arguments; `device` is `"cpu"` or `"gpu"`.
pub fn rof_tv(
    input: &Image,
    regularisation_parameter: f32,
    number_of_iterations: i32,
    time_marching_parameter: f32,
    device: &str,
) -> Result<Image> {
    let params = RofTvParams::new(
        regularisation_parameter,
        iterations(number_of_iterations)?,
        time_marching_parameter,
    )
    .with_device(device.parse::<Device>()?);
    rof::rof_tv(input, &params)
}

/// FGP-TV with positional arguments.
///
/// `method_tv` is 0 (isotropic) or 1 (anisotropic); `nonneg` and
/// `printing_out` are 0 or 1.
#[allow(clippy::too_many_arguments)]
pub fn fgp_tv(
    input: &Image,
    regularisation_parameter: f32,
    number_of_iterations: i32,
    tolerance_constant: f32,
    method_tv: i32,
    nonneg: i32,
    printing_out: i32,
    device: &str,
) -> Result<Image> {
    let params = FgpTvParams::new(
        regularisation_parameter,
        iterations(number_of_iterations)?,
        tolerance_constant,
    )
    .with_method(TvMethod::try_from(method_tv)?)
    .with_nonneg(switch("nonneg", nonneg)?)
    .with_printing_out(switch("printing_out", printing_out)?)
    .with_device(device.parse::<Device>()?);
    fgp::fgp_tv(input, &params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Shape;

    fn input() -> Image {
        let data = (0..64).map(|i| ((i * 13) % 17) as f32 / 17.0).collect();
        Image::new(Shape::D2 { height: 8, width: 8 }, data).unwrap()
    }

    #[test]
    fn positional_calls_match_typed_calls() {
        let input = input();

        let positional = rof_tv(&input, 0.04, 20, 0.0025, "cpu").unwrap();
        let typed = rof::rof_tv(&input, &RofTvParams::new(0.04, 20, 0.0025)).unwrap();
        assert_eq!(positional.as_slice().unwrap(), typed.as_slice().unwrap());

        let positional = fgp_tv(&input, 0.04, 20, 1e-8, 1, 1, 0, "CPU").unwrap();
        let params = FgpTvParams::new(0.04, 20, 1e-8)
            .with_method(TvMethod::Anisotropic)
            .with_nonneg(true);
        let typed = fgp::fgp_tv(&input, &params).unwrap();
        assert_eq!(positional.as_slice().unwrap(), typed.as_slice().unwrap());
    }

    #[test]
    fn rejects_bad_switches_and_devices() {
        let input = input();
        let cases = [
            (fgp_tv(&input, 0.04, 10, 0.0, 2, 0, 0, "cpu"), "methodTV"),
            (fgp_tv(&input, 0.04, 10, 0.0, 0, -1, 0, "cpu"), "nonneg"),
            (fgp_tv(&input, 0.04, 10, 0.0, 0, 0, 3, "cpu"), "printing_out"),
            (fgp_tv(&input, 0.04, 10, 0.0, 0, 0, 0, "tpu"), "device"),
            (rof_tv(&input, 0.04, -5, 0.0025, "cpu"), "number_of_iterations"),
            (rof_tv(&input, 0.04, 0, 0.0025, "cpu"), "number_of_iterations"),
        ];
        for (result, expected) in cases {
            match result {
                Err(Error::InvalidParameter { name, .. }) => assert_eq!(name, expected),
                other => panic!("expected InvalidParameter({expected}), got {other:?}"),
            }
        }
    }

    #[test]
    fn regularisers_are_interchangeable() {
        let input = input();
        let regularisers: Vec<Box<dyn Regulariser>> = vec![
            Box::new(RofTvParams::new(0.04, 10, 0.0025)),
            Box::new(FgpTvParams::new(0.04, 10, 0.0)),
        ];
        let names: Vec<_> = regularisers.iter().map(|r| r.name()).collect();
        assert_eq!(names, ["ROF_TV", "FGP_TV"]);
        for regulariser in &regularisers {
            let output = regulariser.regularise(&input).unwrap();
            assert_eq!(output.shape(), input.shape());
        }
    }
}
