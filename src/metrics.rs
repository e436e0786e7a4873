//! Image quality measures used to evaluate the solvers.

use crate::error::{Error, Result};
use crate::fgp::TvMethod;
use crate::image::Image;
use crate::kernel::Grid;

/// Root-mean-square difference between two images of the same shape.
///
/// GPU-resident images are downloaded first. The sum is accumulated in f64.
pub fn rmse(a: &Image, b: &Image) -> Result<f32> {
    if a.shape() != b.shape() {
        return Err(Error::invalid(
            "image",
            format!("shape mismatch: {:?} vs {:?}", a.shape(), b.shape()),
        ));
    }
    let (a, b) = (a.to_host()?, b.to_host()?);
    let (a, b) = (host(&a)?, host(&b)?);

    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum();
    Ok((sum / a.len() as f64).sqrt() as f32)
}

/// Discrete total variation: the sum over samples of the forward-difference
/// gradient norm, with a zero difference on the last sample of each axis.
pub fn total_variation(image: &Image, method: TvMethod) -> Result<f64> {
    let host_image = image.to_host()?;
    let u = host(&host_image)?;
    let grid = Grid::new(image.shape());
    let [nx, ny, nz] = grid.extents;

    let mut total = 0.0f64;
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let coord = [x, y, z];
                let idx = (z * ny + y) * nx + x;
                let mut l1 = 0.0f64;
                let mut l2 = 0.0f64;
                for axis in 0..grid.ndim {
                    let d = if coord[axis] + 1 < grid.extents[axis] {
                        u[idx + grid.stride(axis)] as f64 - u[idx] as f64
                    } else {
                        0.0
                    };
                    l1 += d.abs();
                    l2 += d * d;
                }
                total += match method {
                    TvMethod::Isotropic => l2.sqrt(),
                    TvMethod::Anisotropic => l1,
                };
            }
        }
    }
    Ok(total)
}

fn host(image: &Image) -> Result<&[f32]> {
    image
        .as_slice()
        .ok_or_else(|| Error::invalid("image", "image is not resident on the host"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Shape;
    use approx::assert_abs_diff_eq;

    fn image(height: usize, width: usize, data: Vec<f32>) -> Image {
        Image::new(Shape::D2 { height, width }, data).unwrap()
    }

    #[test]
    fn rmse_of_known_difference() {
        let a = image(2, 2, vec![0.0, 0.0, 0.0, 0.0]);
        let b = image(2, 2, vec![1.0, -1.0, 1.0, -1.0]);
        assert_abs_diff_eq!(rmse(&a, &b).unwrap(), 1.0);
        assert_eq!(rmse(&a, &a).unwrap(), 0.0);
    }

    #[test]
    fn rmse_rejects_shape_mismatch() {
        let a = image(2, 3, vec![0.0; 6]);
        let b = image(3, 2, vec![0.0; 6]);
        assert!(matches!(rmse(&a, &b), Err(Error::InvalidParameter { .. })));
    }

    #[test]
    fn total_variation_norms() {
        // single step of height 1 along x, seen by both rows
        let step = image(2, 3, vec![0.0, 1.0, 1.0, 0.0, 1.0, 1.0]);
        assert_abs_diff_eq!(total_variation(&step, TvMethod::Isotropic).unwrap(), 2.0);
        assert_abs_diff_eq!(total_variation(&step, TvMethod::Anisotropic).unwrap(), 2.0);

        // diagonal gradient: the norms differ at the corner sample
        let corner = image(2, 2, vec![0.0, 1.0, 1.0, 1.0]);
        assert_abs_diff_eq!(
            total_variation(&corner, TvMethod::Isotropic).unwrap(),
            2f64.sqrt(),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(total_variation(&corner, TvMethod::Anisotropic).unwrap(), 2.0);
    }

    #[test]
    fn constant_volume_has_no_variation() {
        let volume = Image::new(
            Shape::D3 {
                depth: 2,
                height: 2,
                width: 2,
            },
            vec![3.0; 8],
        )
        .unwrap();
        assert_eq!(total_variation(&volume, TvMethod::Isotropic).unwrap(), 0.0);
    }
}
