//! Discretisation shared by the CPU and GPU execution paths.
//!
//! Every per-sample formula used by the solvers lives here. The CPU backend
//! calls these functions directly and the WGSL in `backend::shaders` mirrors
//! them line for line, with the scalar constants passed in through uniforms.
//!
//! Neighbours follow a reflective rule: the forward neighbour of the last
//! sample along an axis is the previous sample, the backward neighbour of the
//! first sample is the next one, and an axis of extent 1 maps onto itself.

use crate::fgp::TvMethod;
use crate::image::Shape;

/// Stabiliser of the gradient magnitude in the ROF flux.
pub(crate) const ROF_EPSILON: f32 = 1.0e-8;

/// Number of tolerance hits after which FGP stops early.
pub(crate) const TOLERANCE_HITS: usize = 5;

/// Sample grid with the fastest axis first: `[width, height, depth]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Grid {
    pub extents: [usize; 3],
    pub ndim: usize,
}

impl Grid {
    pub fn new(shape: Shape) -> Self {
        let [depth, height, width] = shape.extents();
        Self {
            extents: [width, height, depth],
            ndim: shape.ndim(),
        }
    }

    pub fn len(&self) -> usize {
        self.extents.iter().product()
    }

    pub fn width(&self) -> usize {
        self.extents[0]
    }

    /// Number of width-runs (rows across all slices).
    pub fn rows(&self) -> usize {
        self.extents[1] * self.extents[2]
    }

    pub fn stride(&self, axis: usize) -> usize {
        match axis {
            0 => 1,
            1 => self.extents[0],
            _ => self.extents[0] * self.extents[1],
        }
    }

    /// Coordinates of the first sample of `row`.
    pub fn row_coord(&self, row: usize) -> [usize; 3] {
        [0, row % self.extents[1], row / self.extents[1]]
    }

    pub fn forward(&self, idx: usize, coord: &[usize; 3], axis: usize) -> usize {
        let (c, n, s) = (coord[axis], self.extents[axis], self.stride(axis));
        if c + 1 < n {
            idx + s
        } else if c > 0 {
            idx - s
        } else {
            idx
        }
    }

    pub fn backward(&self, idx: usize, coord: &[usize; 3], axis: usize) -> usize {
        let (c, n, s) = (coord[axis], self.extents[axis], self.stride(axis));
        if c > 0 {
            idx - s
        } else if c + 1 < n {
            idx + s
        } else {
            idx
        }
    }
}

#[inline]
fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[inline]
pub(crate) fn minmod(a: f32, b: f32) -> f32 {
    0.5 * (sign(a) + sign(b)) * a.abs().min(b.abs())
}

/// Lower bound on the gradient magnitude in the ROF flux denominator.
///
/// The explicit update is a convex combination of neighbours when every
/// flux weight `w` satisfies `2·d·λ·τ·w <= 1`. Bounding the magnitude below
/// by `4·d·λ·τ` keeps the centre weight at least one half, so gradients
/// smaller than the bound are smoothed instead of amplified. Larger
/// gradients see the unmodified flux.
pub(crate) fn rof_min_norm(ndim: usize, lambda: f32, tau: f32) -> f32 {
    4.0 * ndim as f32 * lambda * tau
}

/// Normalised forward difference of `u` along `axis`.
///
/// The denominator combines the forward difference along `axis` with the
/// minmod of the one-sided differences along every other axis, plus
/// [`ROF_EPSILON`], and is never smaller than `min_norm`.
#[inline]
pub(crate) fn rof_flux(
    u: &[f32],
    grid: &Grid,
    idx: usize,
    coord: &[usize; 3],
    axis: usize,
    min_norm: f32,
) -> f32 {
    let center = u[idx];
    let mut numer = 0.0f32;
    let mut denom = ROF_EPSILON;
    for b in 0..grid.ndim {
        let forward = u[grid.forward(idx, coord, b)] - center;
        if b == axis {
            numer = forward;
            denom += forward * forward;
        } else {
            let backward = center - u[grid.backward(idx, coord, b)];
            let m = minmod(forward, backward);
            denom += m * m;
        }
    }
    numer / denom.sqrt().max(min_norm)
}

/// Backward-difference divergence of the interleaved ROF flux field.
#[inline]
pub(crate) fn rof_divergence(flux: &[f32], grid: &Grid, idx: usize, coord: &[usize; 3]) -> f32 {
    let nd = grid.ndim;
    let mut div = 0.0f32;
    for a in 0..nd {
        div += flux[idx * nd + a] - flux[grid.backward(idx, coord, a) * nd + a];
    }
    div
}

/// Divergence of the interleaved dual field, with zero outside the domain.
#[inline]
pub(crate) fn fgp_divergence(r: &[f32], grid: &Grid, idx: usize, coord: &[usize; 3]) -> f32 {
    let nd = grid.ndim;
    let mut div = 0.0f32;
    for a in 0..nd {
        let prev = if coord[a] > 0 {
            r[(idx - grid.stride(a)) * nd + a]
        } else {
            0.0
        };
        div += r[idx * nd + a] - prev;
    }
    div
}

/// `u - u[next]` along `axis`, zero on the last sample.
#[inline]
pub(crate) fn fgp_gradient(
    u: &[f32],
    grid: &Grid,
    idx: usize,
    coord: &[usize; 3],
    axis: usize,
) -> f32 {
    if coord[axis] + 1 < grid.extents[axis] {
        u[idx] - u[idx + grid.stride(axis)]
    } else {
        0.0
    }
}

/// Projects one dual vector onto the unit ball of the chosen norm.
#[inline]
pub(crate) fn project(components: &mut [f32], method: TvMethod) {
    match method {
        TvMethod::Isotropic => {
            let norm2: f32 = components.iter().map(|v| v * v).sum();
            if norm2 > 1.0 {
                let scale = 1.0 / norm2.sqrt();
                components.iter_mut().for_each(|v| *v *= scale);
            }
        }
        TvMethod::Anisotropic => {
            components.iter_mut().for_each(|v| *v /= v.abs().max(1.0));
        }
    }
}

/// Step size of the dual gradient step, `1 / (4·d·λ)`.
pub(crate) fn dual_step(ndim: usize, lambda: f32) -> f32 {
    1.0 / (4.0 * ndim as f32 * lambda)
}

/// `t_{k+1} = (1 + sqrt(1 + 4 t_k²)) / 2`
pub(crate) fn next_momentum(t: f32) -> f32 {
    (1.0 + (1.0 + 4.0 * t * t).sqrt()) * 0.5
}

/// `‖u_k − u_{k−1}‖ / ‖u_k‖` from the summed squares.
pub(crate) fn relative_change(diff_sq: f64, norm_sq: f64) -> f32 {
    if norm_sq > 0.0 {
        (diff_sq.sqrt() / norm_sq.sqrt()) as f32
    } else if diff_sq > 0.0 {
        f32::INFINITY
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn reflective_neighbours() {
        let grid = Grid::new(Shape::D2 { height: 3, width: 4 });
        assert_eq!(grid.len(), 12);
        assert_eq!(grid.rows(), 3);

        // last column reflects onto the previous one
        let coord = [3, 1, 0];
        let idx = 7;
        assert_eq!(grid.forward(idx, &coord, 0), 6);
        assert_eq!(grid.backward(idx, &coord, 0), 6);
        // first row reflects onto the next one
        let coord = [2, 0, 0];
        assert_eq!(grid.backward(2, &coord, 1), 6);
        assert_eq!(grid.forward(2, &coord, 1), 6);
    }

    #[test]
    fn unit_extent_maps_onto_itself() {
        let grid = Grid::new(Shape::D2 { height: 1, width: 5 });
        let coord = [2, 0, 0];
        assert_eq!(grid.forward(2, &coord, 1), 2);
        assert_eq!(grid.backward(2, &coord, 1), 2);
    }

    #[test]
    fn row_coordinates_in_3d() {
        let grid = Grid::new(Shape::D3 {
            depth: 2,
            height: 3,
            width: 4,
        });
        assert_eq!(grid.rows(), 6);
        assert_eq!(grid.row_coord(4), [0, 1, 1]);
        assert_eq!(grid.stride(2), 12);
    }

    #[test]
    fn minmod_picks_smallest_agreeing_slope() {
        assert_eq!(minmod(0.3, 0.1), 0.1);
        assert_eq!(minmod(-0.3, -0.1), -0.1);
        assert_eq!(minmod(0.3, -0.1), 0.0);
        assert_eq!(minmod(0.0, 2.0), 0.0);
    }

    #[test]
    fn flux_is_bounded_by_one() {
        let grid = Grid::new(Shape::D2 { height: 2, width: 3 });
        let u = [0.0, 1.0, 5.0, 0.5, 0.25, 2.0];
        for idx in 0..u.len() {
            let coord = [idx % 3, idx / 3, 0];
            for axis in 0..2 {
                assert!(rof_flux(&u, &grid, idx, &coord, axis, 0.0).abs() <= 1.0);
                assert!(rof_flux(&u, &grid, idx, &coord, axis, 0.3).abs() <= 1.0);
            }
        }
    }

    #[test]
    fn flux_weight_is_bounded_by_the_step() {
        assert_abs_diff_eq!(rof_min_norm(2, 0.04, 0.0025), 8e-4, epsilon = 1e-10);
        assert_abs_diff_eq!(rof_min_norm(3, 0.04, 0.0025), 1.2e-3, epsilon = 1e-10);

        let (lambda, tau) = (0.04f32, 0.0025f32);
        let min_norm = rof_min_norm(2, lambda, tau);
        let grid = Grid::new(Shape::D2 { height: 1, width: 2 });
        for step in [1e-7f32, 1e-5, 1e-4] {
            // tiny gradients get a bounded weight
            let u = [0.0, step];
            let weight = rof_flux(&u, &grid, 0, &[0, 0, 0], 0, min_norm) / step;
            assert!(2.0 * 2.0 * lambda * tau * weight <= 0.5 + 1e-6);
        }

        // gradients above the bound are untouched
        let u = [0.0, 1.0 / 255.0];
        assert_eq!(
            rof_flux(&u, &grid, 0, &[0, 0, 0], 0, min_norm),
            rof_flux(&u, &grid, 0, &[0, 0, 0], 0, 0.0)
        );
    }

    #[test]
    fn projection_rules() {
        let mut p = [3.0, 4.0];
        project(&mut p, TvMethod::Isotropic);
        assert_abs_diff_eq!(p[0], 0.6, epsilon = 1e-6);
        assert_abs_diff_eq!(p[1], 0.8, epsilon = 1e-6);

        let mut p = [0.3, 0.4];
        project(&mut p, TvMethod::Isotropic);
        assert_eq!(p, [0.3, 0.4]);

        let mut p = [3.0, -0.5, -2.0];
        project(&mut p, TvMethod::Anisotropic);
        assert_eq!(p, [1.0, -0.5, -1.0]);
    }

    #[test]
    fn momentum_sequence() {
        let t1 = next_momentum(1.0);
        assert_abs_diff_eq!(t1, (1.0 + 5f32.sqrt()) / 2.0, epsilon = 1e-6);
        assert!(next_momentum(t1) > t1);
        assert_abs_diff_eq!(dual_step(2, 0.04), 1.0 / 0.32, epsilon = 1e-4);
    }

    #[test]
    fn relative_change_edge_cases() {
        assert_eq!(relative_change(0.0, 0.0), 0.0);
        assert!(relative_change(1.0, 0.0).is_infinite());
        assert_abs_diff_eq!(relative_change(1.0, 4.0), 0.5);
    }
}
