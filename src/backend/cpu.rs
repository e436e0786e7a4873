use std::sync::Arc;

use log::debug;
use ndarray::{par_azip, ArrayView1, ArrayViewMut1};
use rayon::prelude::*;

use super::Backend;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::fgp::{self, FgpKernels, FgpTvParams, TvMethod};
use crate::image::{Image, Shape};
use crate::kernel::{self, Grid};
use crate::rof::{self, RofKernels, RofTvParams};

/// Host backend. Stencil passes run in parallel over rows with rayon.
#[derive(Debug, Clone, Default)]
pub struct CpuBackend {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl CpuBackend {
    /// Runs on the global rayon pool.
    pub fn new() -> Self {
        Self { pool: None }
    }

    /// Runs on a dedicated pool of `threads` workers.
    pub fn with_threads(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(Error::invalid("threads", "thread count must be > 0"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("tv-cpu-{i}"))
            .build()
            .map_err(|e| Error::invalid("threads", format!("failed to build thread pool: {e}")))?;
        debug!("CPU backend: dedicated pool with {threads} threads");
        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    /// Dedicated pool sized to the number of logical cores.
    pub fn with_available_threads() -> Result<Self> {
        Self::with_threads(num_cpus::get())
    }

    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }
}

impl Backend for CpuBackend {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn allocate(&self, shape: Shape) -> Result<Image> {
        Image::zeros(shape)
    }

    fn transfer(&self, image: &Image) -> Result<Image> {
        image.to_host()
    }

    fn rof_tv(&self, input: &Image, params: &RofTvParams) -> Result<Image> {
        params.validate()?;
        let host = self.transfer(input)?;
        let kernels = CpuRof::new(self, &host, params)?;
        rof::iterate(kernels, params, Device::Cpu)
    }

    fn fgp_tv(&self, input: &Image, params: &FgpTvParams) -> Result<Image> {
        params.validate()?;
        let host = self.transfer(input)?;
        let kernels = CpuFgp::new(self, &host, params)?;
        fgp::iterate(kernels, params, Device::Cpu)
    }
}

fn host_samples(image: &Image) -> Result<&[f32]> {
    image
        .as_slice()
        .ok_or_else(|| Error::invalid("input", "image is not resident on the host"))
}

fn try_zeroed(len: usize) -> Result<Vec<f32>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|_| Error::Allocation {
        bytes: len.saturating_mul(std::mem::size_of::<f32>()),
    })?;
    data.resize(len, 0.0);
    Ok(data)
}

fn try_copy(samples: &[f32]) -> Result<Vec<f32>> {
    let mut data = try_zeroed(samples.len())?;
    data.copy_from_slice(samples);
    Ok(data)
}

struct CpuRof<'a> {
    backend: &'a CpuBackend,
    shape: Shape,
    grid: Grid,
    source: &'a [f32],
    u: Vec<f32>,
    flux: Vec<f32>,
    lambda: f32,
    tau: f32,
    min_norm: f32,
}

impl<'a> CpuRof<'a> {
    fn new(backend: &'a CpuBackend, input: &'a Image, params: &RofTvParams) -> Result<Self> {
        let shape = input.shape();
        let grid = Grid::new(shape);
        let source = host_samples(input)?;
        Ok(Self {
            backend,
            shape,
            grid,
            source,
            u: try_copy(source)?,
            flux: try_zeroed(grid.len() * grid.ndim)?,
            lambda: params.regularisation_parameter,
            tau: params.time_marching_parameter,
            min_norm: kernel::rof_min_norm(
                grid.ndim,
                params.regularisation_parameter,
                params.time_marching_parameter,
            ),
        })
    }
}

impl RofKernels for CpuRof<'_> {
    fn step(&mut self) -> Result<()> {
        let grid = self.grid;
        let (nd, width) = (grid.ndim, grid.width());
        let (lambda, tau, min_norm) = (self.lambda, self.tau, self.min_norm);
        let source = self.source;
        let u = &mut self.u;
        let flux = &mut self.flux;

        self.backend.install(|| {
            let current: &[f32] = u;
            flux.par_chunks_mut(width * nd)
                .enumerate()
                .for_each(|(row, out)| {
                    let [_, y, z] = grid.row_coord(row);
                    let base = row * width;
                    for x in 0..width {
                        let coord = [x, y, z];
                        for axis in 0..nd {
                            out[x * nd + axis] =
                                kernel::rof_flux(current, &grid, base + x, &coord, axis, min_norm);
                        }
                    }
                });

            let flux: &[f32] = flux;
            u.par_chunks_mut(width)
                .zip(source.par_chunks(width))
                .enumerate()
                .for_each(|(row, (u_row, f_row))| {
                    let [_, y, z] = grid.row_coord(row);
                    let base = row * width;
                    for x in 0..width {
                        let div = kernel::rof_divergence(flux, &grid, base + x, &[x, y, z]);
                        let value = u_row[x];
                        u_row[x] = value + tau * (lambda * div - (value - f_row[x]));
                    }
                });
        });
        Ok(())
    }

    fn finish(self) -> Result<Image> {
        Image::new(self.shape, self.u)
    }
}

struct CpuFgp<'a> {
    backend: &'a CpuBackend,
    shape: Shape,
    grid: Grid,
    source: &'a [f32],
    u: Vec<f32>,
    u_prev: Vec<f32>,
    r: Vec<f32>,
    p: Vec<f32>,
    p_prev: Vec<f32>,
    lambda: f32,
    step: f32,
    method: TvMethod,
    nonneg: bool,
}

impl<'a> CpuFgp<'a> {
    fn new(backend: &'a CpuBackend, input: &'a Image, params: &FgpTvParams) -> Result<Self> {
        let shape = input.shape();
        let grid = Grid::new(shape);
        let (n, dual_len) = (grid.len(), grid.len() * grid.ndim);
        Ok(Self {
            backend,
            shape,
            grid,
            source: host_samples(input)?,
            u: try_zeroed(n)?,
            u_prev: try_zeroed(n)?,
            r: try_zeroed(dual_len)?,
            p: try_zeroed(dual_len)?,
            p_prev: try_zeroed(dual_len)?,
            lambda: params.regularisation_parameter,
            step: kernel::dual_step(grid.ndim, params.regularisation_parameter),
            method: params.method,
            nonneg: params.nonneg,
        })
    }
}

impl FgpKernels for CpuFgp<'_> {
    fn primal(&mut self) -> Result<()> {
        std::mem::swap(&mut self.u, &mut self.u_prev);
        let grid = self.grid;
        let width = grid.width();
        let (lambda, nonneg) = (self.lambda, self.nonneg);
        let (source, r) = (self.source, &self.r);
        let u = &mut self.u;

        self.backend.install(|| {
            u.par_chunks_mut(width)
                .zip(source.par_chunks(width))
                .enumerate()
                .for_each(|(row, (u_row, f_row))| {
                    let [_, y, z] = grid.row_coord(row);
                    let base = row * width;
                    for x in 0..width {
                        let div = kernel::fgp_divergence(r, &grid, base + x, &[x, y, z]);
                        let value = f_row[x] - lambda * div;
                        u_row[x] = if nonneg { value.max(0.0) } else { value };
                    }
                });
        });
        Ok(())
    }

    fn dual(&mut self) -> Result<()> {
        let grid = self.grid;
        let (nd, width) = (grid.ndim, grid.width());
        let (step, method) = (self.step, self.method);
        let (u, r) = (&self.u, &self.r);
        let p = &mut self.p;

        self.backend.install(|| {
            p.par_chunks_mut(width * nd)
                .enumerate()
                .for_each(|(row, out)| {
                    let [_, y, z] = grid.row_coord(row);
                    let base = row * width;
                    let mut components = [0.0f32; 3];
                    for x in 0..width {
                        let idx = base + x;
                        let coord = [x, y, z];
                        for axis in 0..nd {
                            let grad = kernel::fgp_gradient(u, &grid, idx, &coord, axis);
                            components[axis] = r[idx * nd + axis] + step * grad;
                        }
                        kernel::project(&mut components[..nd], method);
                        out[x * nd..(x + 1) * nd].copy_from_slice(&components[..nd]);
                    }
                });
        });
        Ok(())
    }

    fn extrapolate(&mut self, momentum: f32) -> Result<()> {
        let r = ArrayViewMut1::from(self.r.as_mut_slice());
        let p = ArrayView1::from(self.p.as_slice());
        let p_prev = ArrayViewMut1::from(self.p_prev.as_mut_slice());

        self.backend.install(|| {
            par_azip!((r in r, &p in p, p_prev in p_prev) {
                *r = p + momentum * (p - *p_prev);
                *p_prev = p;
            });
        });
        Ok(())
    }

    fn relative_change(&mut self) -> Result<f32> {
        let width = self.grid.width();
        let (u, u_prev) = (&self.u, &self.u_prev);

        // per-row partials keep the summation order fixed between runs
        let partials: Vec<(f32, f32)> = self.backend.install(|| {
            u.par_chunks(width)
                .zip(u_prev.par_chunks(width))
                .map(|(row, prev)| {
                    row.iter().zip(prev).fold((0.0f32, 0.0f32), |(diff, norm), (&v, &w)| {
                        let d = v - w;
                        (diff + d * d, norm + v * v)
                    })
                })
                .collect()
        });
        let (diff_sq, norm_sq) = partials
            .iter()
            .fold((0.0f64, 0.0f64), |(d, n), &(pd, pn)| (d + pd as f64, n + pn as f64));
        Ok(kernel::relative_change(diff_sq, norm_sq))
    }

    fn finish(self) -> Result<Image> {
        Image::new(self.shape, self.u)
    }
}
