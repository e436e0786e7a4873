use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use log::{debug, error, info, warn};
use wgpu::util::DeviceExt;

use super::shaders;
use super::Backend;
use crate::device::Device;
use crate::error::{DeviceError, Error, Result};
use crate::fgp::{self, FgpKernels, FgpTvParams, TvMethod};
use crate::image::{Image, Shape};
use crate::kernel::{self, Grid};
use crate::rof::{self, RofKernels, RofTvParams};

const GRID_WORKGROUP: u32 = 16;
const ROW_WORKGROUP: u32 = 64;

const STORAGE_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

const FLAG_NONNEG: u32 = 1;
const FLAG_ANISOTROPIC: u32 = 2;

/// Adapter selection for [`GpuBackend::with_config`].
#[derive(Debug, Clone)]
pub struct GpuConfig {
    pub backends: wgpu::Backends,
    pub power_preference: wgpu::PowerPreference,
    /// Request a software adapter even when hardware is present.
    pub force_fallback_adapter: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            backends: wgpu::Backends::PRIMARY,
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct RofUniforms {
    nx: u32,
    ny: u32,
    nz: u32,
    ndim: u32,
    lambda: f32,
    tau: f32,
    eps: f32,
    min_norm: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct FgpUniforms {
    nx: u32,
    ny: u32,
    nz: u32,
    ndim: u32,
    lambda: f32,
    dual_step: f32,
    momentum: f32,
    flags: u32,
}

/// Logical device plus the limits it was created with.
#[derive(Debug)]
pub(crate) struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    limits: wgpu::Limits,
}

impl GpuContext {
    async fn request(config: &GpuConfig) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: config.backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: config.power_preference,
                compatible_surface: None,
                force_fallback_adapter: config.force_fallback_adapter,
            })
            .await
            .ok_or_else(|| {
                DeviceError::Unavailable(format!("no adapter for backends {:?}", config.backends))
            })?;

        let adapter_info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("tv-regularisers"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(DeviceError::from)?;

        device.on_uncaptured_error(Box::new(|e: wgpu::Error| {
            error!("uncaptured wgpu error: {e}")
        }));
        info!(
            "GPU backend: {} ({:?}, {:?})",
            adapter_info.name, adapter_info.backend, adapter_info.device_type
        );

        Ok(Self {
            device,
            queue,
            adapter_name: adapter_info.name,
            limits,
        })
    }

    fn max_binding_bytes(&self) -> u64 {
        (self.limits.max_storage_buffer_binding_size as u64).min(self.limits.max_buffer_size)
    }

    fn check_fits(&self, bytes: u64) -> Result<()> {
        let limit = self.max_binding_bytes();
        if bytes > limit {
            return Err(DeviceError::OutOfMemory {
                requested: bytes,
                limit,
            }
            .into());
        }
        Ok(())
    }

    /// Storage buffer of `len` samples, zeroed or filled from `contents`.
    fn create_storage(
        &self,
        label: &str,
        len: usize,
        contents: Option<&[f32]>,
    ) -> Result<wgpu::Buffer> {
        let size = len
            .checked_mul(std::mem::size_of::<f32>())
            .map(|bytes| bytes as u64)
            .unwrap_or(u64::MAX);
        self.check_fits(size)?;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = match contents {
            Some(data) => self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage: STORAGE_USAGE,
            }),
            None => self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: STORAGE_USAGE,
                mapped_at_creation: false,
            }),
        };
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            debug!("allocation of {label} failed: {e}");
            return Err(DeviceError::OutOfMemory {
                requested: size,
                limit: self.max_binding_bytes(),
            }
            .into());
        }
        Ok(buffer)
    }

    fn create_uniform<T: Pod>(&self, label: &str, value: &T) -> wgpu::Buffer {
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::bytes_of(value),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        })
    }

    /// Records `steps` into one compute pass and submits it.
    fn dispatch(
        &self,
        label: &str,
        bind_group: &wgpu::BindGroup,
        steps: &[(&wgpu::ComputePipeline, [u32; 3])],
    ) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            for &(pipeline, [x, y, z]) in steps {
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.dispatch_workgroups(x, y, z);
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn copy(&self, source: &wgpu::Buffer, destination: &wgpu::Buffer, size: u64) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("copy") });
        encoder.copy_buffer_to_buffer(source, 0, destination, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Blocking readback of the first `len` samples of `source`.
    fn read_f32(&self, source: &wgpu::Buffer, len: usize) -> Result<Vec<f32>> {
        let size = (len * std::mem::size_of::<f32>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        self.copy(source, &staging, size);

        let slice = staging.slice(..);
        let (sender, receiver) = futures_channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        pollster::block_on(receiver)
            .map_err(|_| DeviceError::Canceled)?
            .map_err(DeviceError::from)?;

        let mapped = slice.get_mapped_range();
        let data = bytemuck::cast_slice::<u8, f32>(&mapped).to_vec();
        drop(mapped);
        staging.unmap();
        Ok(data)
    }

    /// Workgroup counts covering `grid` with 16x16 tiles, one slice per z.
    fn grid_workgroups(&self, grid: &Grid) -> Result<[u32; 3]> {
        let [nx, ny, nz] = grid.extents;
        let groups = [
            nx.div_ceil(GRID_WORKGROUP as usize),
            ny.div_ceil(GRID_WORKGROUP as usize),
            nz,
        ];
        let max = self.limits.max_compute_workgroups_per_dimension as usize;
        if groups.iter().any(|&g| g > max) {
            return Err(DeviceError::Unsupported(format!(
                "{groups:?} workgroups exceed the per-dimension limit of {max}"
            ))
            .into());
        }
        Ok(groups.map(|g| g as u32))
    }

    /// Workgroup counts giving one invocation per row, folded into y when
    /// the row count exceeds the x limit.
    fn row_workgroups(&self, rows: usize) -> Result<[u32; 3]> {
        let max = self.limits.max_compute_workgroups_per_dimension as usize;
        let total = rows.div_ceil(ROW_WORKGROUP as usize);
        let x = total.clamp(1, max);
        let y = total.div_ceil(x);
        if y > max {
            return Err(
                DeviceError::Unsupported(format!("{rows} rows exceed the dispatch limit")).into(),
            );
        }
        Ok([x as u32, y as u32, 1])
    }
}

/// Image samples resident in GPU memory.
#[derive(Debug)]
pub struct GpuBuffer {
    buffer: wgpu::Buffer,
    len: usize,
    context: Arc<GpuContext>,
}

impl GpuBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Blocking copy of the samples back to host memory.
    pub fn download(&self) -> Result<Vec<f32>> {
        self.context.read_f32(&self.buffer, self.len)
    }
}

#[derive(Debug)]
struct RofPipelines {
    layout: wgpu::BindGroupLayout,
    flux: wgpu::ComputePipeline,
    update: wgpu::ComputePipeline,
}

#[derive(Debug)]
struct FgpPipelines {
    layout: wgpu::BindGroupLayout,
    primal: wgpu::ComputePipeline,
    dual: wgpu::ComputePipeline,
    extrapolate: wgpu::ComputePipeline,
    residual: wgpu::ComputePipeline,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Compiles `source` and builds one pipeline per entry point over a single
/// bind group layout.
fn build_pipelines<const N: usize>(
    device: &wgpu::Device,
    label: &str,
    source: String,
    layout_entries: &[wgpu::BindGroupLayoutEntry],
    entry_points: [&str; N],
) -> Result<(wgpu::BindGroupLayout, [wgpu::ComputePipeline; N])> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: layout_entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });
    let pipelines = entry_points.map(|entry_point| {
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry_point),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some(entry_point),
            compilation_options: Default::default(),
            cache: None,
        })
    });

    if let Some(e) = pollster::block_on(device.pop_error_scope()) {
        return Err(DeviceError::Driver(format!("{label}: {e}")).into());
    }
    Ok((bind_group_layout, pipelines))
}

const SCOPE_FILTERS: [wgpu::ErrorFilter; 3] = [
    wgpu::ErrorFilter::Validation,
    wgpu::ErrorFilter::OutOfMemory,
    wgpu::ErrorFilter::Internal,
];

/// Captures every device error raised while a solve records and runs its
/// passes, so they reach the caller instead of the uncaptured-error handler.
struct ErrorScope<'a> {
    device: &'a wgpu::Device,
    open: bool,
}

impl<'a> ErrorScope<'a> {
    fn open(device: &'a wgpu::Device) -> Self {
        for filter in SCOPE_FILTERS {
            device.push_error_scope(filter);
        }
        Self { device, open: true }
    }

    /// Pops the scopes, innermost first, and reports the first error.
    fn pop(&mut self) -> Option<wgpu::Error> {
        self.open = false;
        let mut first = None;
        for _ in SCOPE_FILTERS {
            if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
                first.get_or_insert(e);
            }
        }
        first
    }

    fn close(mut self) -> Result<()> {
        match self.pop() {
            Some(e) => Err(DeviceError::Driver(e.to_string()).into()),
            None => Ok(()),
        }
    }
}

impl Drop for ErrorScope<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Some(e) = self.pop() {
                warn!("GPU error discarded with a failed solve: {e}");
            }
        }
    }
}

/// wgpu compute backend. Cloning shares the device and the compiled
/// pipelines.
#[derive(Debug, Clone)]
pub struct GpuBackend {
    context: Arc<GpuContext>,
    rof: Arc<RofPipelines>,
    fgp: Arc<FgpPipelines>,
}

impl GpuBackend {
    /// Opens the default adapter. Fails with [`DeviceError::Unavailable`]
    /// when there is none.
    pub fn new() -> Result<Self> {
        Self::with_config(GpuConfig::default())
    }

    pub fn with_config(config: GpuConfig) -> Result<Self> {
        pollster::block_on(Self::request(config))
    }

    async fn request(config: GpuConfig) -> Result<Self> {
        let context = GpuContext::request(&config).await?;

        let (layout, [flux, update]) = build_pipelines(
            &context.device,
            "ROF-TV",
            format!("{}{}", shaders::COMMON, shaders::ROF),
            &[
                storage_entry(0, true),
                storage_entry(1, false),
                storage_entry(2, false),
                uniform_entry(3),
            ],
            ["rof_flux", "rof_update"],
        )?;
        let rof = RofPipelines { layout, flux, update };

        let (layout, [primal, dual, extrapolate, residual]) = build_pipelines(
            &context.device,
            "FGP-TV",
            format!("{}{}", shaders::COMMON, shaders::FGP),
            &[
                storage_entry(0, true),
                storage_entry(1, false),
                storage_entry(2, false),
                storage_entry(3, false),
                storage_entry(4, false),
                storage_entry(5, false),
                storage_entry(6, false),
                uniform_entry(7),
            ],
            ["fgp_primal", "fgp_dual", "fgp_extrapolate", "fgp_residual"],
        )?;
        let fgp = FgpPipelines {
            layout,
            primal,
            dual,
            extrapolate,
            residual,
        };

        Ok(Self {
            context: Arc::new(context),
            rof: Arc::new(rof),
            fgp: Arc::new(fgp),
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.context.adapter_name
    }

    fn wrap(&self, shape: Shape, buffer: wgpu::Buffer) -> Image {
        Image::from_gpu(
            shape,
            Arc::new(GpuBuffer {
                buffer,
                len: shape.len(),
                context: Arc::clone(&self.context),
            }),
        )
    }

    /// Grid of `shape`, rejecting extents the shaders cannot index.
    fn grid(&self, shape: Shape) -> Result<Grid> {
        let grid = Grid::new(shape);
        let dual_len = grid.len().checked_mul(grid.ndim).unwrap_or(usize::MAX);
        if dual_len > u32::MAX as usize {
            return Err(DeviceError::Unsupported(format!(
                "{shape:?} needs {dual_len} dual samples, more than 32-bit indexing allows"
            ))
            .into());
        }
        Ok(grid)
    }

    /// `input` as a buffer on this device, uploading when needed.
    fn resident(&self, input: &Image) -> Result<Arc<GpuBuffer>> {
        let image = self.transfer(input)?;
        image
            .gpu_buffer()
            .cloned()
            .ok_or_else(|| Error::invalid("input", "image is not resident on the GPU"))
    }
}

impl Backend for GpuBackend {
    fn device(&self) -> Device {
        Device::Gpu
    }

    fn allocate(&self, shape: Shape) -> Result<Image> {
        shape.validate()?;
        let buffer = self.context.create_storage("image", shape.len(), None)?;
        Ok(self.wrap(shape, buffer))
    }

    fn transfer(&self, image: &Image) -> Result<Image> {
        if let Some(buffer) = image.gpu_buffer() {
            if Arc::ptr_eq(&buffer.context, &self.context) {
                return Ok(image.clone());
            }
        }
        let host = image.to_host()?;
        let samples = host
            .as_slice()
            .ok_or_else(|| Error::invalid("image", "host copy is not contiguous"))?;
        let buffer = self.context.create_storage("image", samples.len(), Some(samples))?;
        Ok(self.wrap(image.shape(), buffer))
    }

    fn rof_tv(&self, input: &Image, params: &RofTvParams) -> Result<Image> {
        params.validate()?;
        let kernels = GpuRof::new(self, input, params)?;
        rof::iterate(kernels, params, Device::Gpu)
    }

    fn fgp_tv(&self, input: &Image, params: &FgpTvParams) -> Result<Image> {
        params.validate()?;
        let kernels = GpuFgp::new(self, input, params)?;
        fgp::iterate(kernels, params, Device::Gpu)
    }
}

struct GpuRof<'a> {
    backend: &'a GpuBackend,
    scope: ErrorScope<'a>,
    shape: Shape,
    workgroups: [u32; 3],
    bind_group: wgpu::BindGroup,
    u: wgpu::Buffer,
    _source: Arc<GpuBuffer>,
    _flux: wgpu::Buffer,
    _uniforms: wgpu::Buffer,
}

impl<'a> GpuRof<'a> {
    fn new(backend: &'a GpuBackend, input: &Image, params: &RofTvParams) -> Result<Self> {
        let context = &backend.context;
        let scope = ErrorScope::open(&context.device);
        let shape = input.shape();
        let grid = backend.grid(shape)?;
        let workgroups = context.grid_workgroups(&grid)?;
        let source = backend.resident(input)?;

        let u = context.create_storage("rof u", grid.len(), None)?;
        let flux = context.create_storage("rof flux", grid.len() * grid.ndim, None)?;
        context.copy(&source.buffer, &u, (grid.len() * std::mem::size_of::<f32>()) as u64);

        let [nx, ny, nz] = grid.extents;
        let uniforms = context.create_uniform(
            "rof params",
            &RofUniforms {
                nx: nx as u32,
                ny: ny as u32,
                nz: nz as u32,
                ndim: grid.ndim as u32,
                lambda: params.regularisation_parameter,
                tau: params.time_marching_parameter,
                eps: kernel::ROF_EPSILON,
                min_norm: kernel::rof_min_norm(
                    grid.ndim,
                    params.regularisation_parameter,
                    params.time_marching_parameter,
                ),
            },
        );

        let bind_group = context.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ROF-TV"),
            layout: &backend.rof.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: source.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: u.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: flux.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: uniforms.as_entire_binding(),
                },
            ],
        });

        Ok(Self {
            backend,
            scope,
            shape,
            workgroups,
            bind_group,
            u,
            _source: source,
            _flux: flux,
            _uniforms: uniforms,
        })
    }
}

impl RofKernels for GpuRof<'_> {
    fn step(&mut self) -> Result<()> {
        let pipelines = &self.backend.rof;
        self.backend.context.dispatch(
            "ROF-TV step",
            &self.bind_group,
            &[(&pipelines.flux, self.workgroups), (&pipelines.update, self.workgroups)],
        );
        Ok(())
    }

    fn finish(self) -> Result<Image> {
        let data = self.backend.context.read_f32(&self.u, self.shape.len());
        self.scope.close()?;
        Image::new(self.shape, data?)
    }
}

struct GpuFgp<'a> {
    backend: &'a GpuBackend,
    scope: ErrorScope<'a>,
    shape: Shape,
    rows: usize,
    workgroups: [u32; 3],
    row_workgroups: [u32; 3],
    bind_group: wgpu::BindGroup,
    params: FgpUniforms,
    uniforms: wgpu::Buffer,
    u: wgpu::Buffer,
    partials: wgpu::Buffer,
    _source: Arc<GpuBuffer>,
    _workspace: [wgpu::Buffer; 4],
}

impl<'a> GpuFgp<'a> {
    fn new(backend: &'a GpuBackend, input: &Image, params: &FgpTvParams) -> Result<Self> {
        let context = &backend.context;
        let scope = ErrorScope::open(&context.device);
        let shape = input.shape();
        let grid = backend.grid(shape)?;
        let workgroups = context.grid_workgroups(&grid)?;
        let rows = grid.rows();
        let row_workgroups = context.row_workgroups(rows)?;
        let source = backend.resident(input)?;

        let (n, dual_len) = (grid.len(), grid.len() * grid.ndim);
        let u = context.create_storage("fgp u", n, None)?;
        let u_prev = context.create_storage("fgp u_prev", n, None)?;
        let r = context.create_storage("fgp r", dual_len, None)?;
        let p = context.create_storage("fgp p", dual_len, None)?;
        let p_prev = context.create_storage("fgp p_prev", dual_len, None)?;
        let partials = context.create_storage("fgp partials", 2 * rows, None)?;

        let mut flags = 0;
        if params.nonneg {
            flags |= FLAG_NONNEG;
        }
        if params.method == TvMethod::Anisotropic {
            flags |= FLAG_ANISOTROPIC;
        }
        let [nx, ny, nz] = grid.extents;
        let uniform_values = FgpUniforms {
            nx: nx as u32,
            ny: ny as u32,
            nz: nz as u32,
            ndim: grid.ndim as u32,
            lambda: params.regularisation_parameter,
            dual_step: kernel::dual_step(grid.ndim, params.regularisation_parameter),
            momentum: 0.0,
            flags,
        };
        let uniforms = context.create_uniform("fgp params", &uniform_values);

        let bind_group = context.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("FGP-TV"),
            layout: &backend.fgp.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: source.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: u.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: u_prev.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: r.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: p.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: p_prev.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: partials.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: uniforms.as_entire_binding(),
                },
            ],
        });

        Ok(Self {
            backend,
            scope,
            shape,
            rows,
            workgroups,
            row_workgroups,
            bind_group,
            params: uniform_values,
            uniforms,
            u,
            partials,
            _source: source,
            _workspace: [u_prev, r, p, p_prev],
        })
    }

    fn run(&self, label: &str, pipeline: &wgpu::ComputePipeline, workgroups: [u32; 3]) {
        self.backend
            .context
            .dispatch(label, &self.bind_group, &[(pipeline, workgroups)]);
    }
}

impl FgpKernels for GpuFgp<'_> {
    fn primal(&mut self) -> Result<()> {
        self.run("FGP-TV primal", &self.backend.fgp.primal, self.workgroups);
        Ok(())
    }

    fn dual(&mut self) -> Result<()> {
        self.run("FGP-TV dual", &self.backend.fgp.dual, self.workgroups);
        Ok(())
    }

    fn extrapolate(&mut self, momentum: f32) -> Result<()> {
        self.params.momentum = momentum;
        self.backend
            .context
            .queue
            .write_buffer(&self.uniforms, 0, bytemuck::bytes_of(&self.params));
        self.run("FGP-TV extrapolate", &self.backend.fgp.extrapolate, self.workgroups);
        Ok(())
    }

    fn relative_change(&mut self) -> Result<f32> {
        self.run("FGP-TV residual", &self.backend.fgp.residual, self.row_workgroups);
        let partials = self.backend.context.read_f32(&self.partials, 2 * self.rows)?;
        let (diff_sq, norm_sq) = partials.chunks_exact(2).fold((0.0f64, 0.0f64), |(d, n), pair| {
            (d + pair[0] as f64, n + pair[1] as f64)
        });
        Ok(kernel::relative_change(diff_sq, norm_sq))
    }

    fn finish(self) -> Result<Image> {
        let data = self.backend.context.read_f32(&self.u, self.shape.len());
        self.scope.close()?;
        Image::new(self.shape, data?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::metrics::rmse;

    fn gpu() -> Option<GpuBackend> {
        match GpuBackend::new() {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("skipping GPU test: {e}");
                None
            }
        }
    }

    fn textured(height: usize, width: usize) -> Image {
        let data = (0..height * width)
            .map(|i| {
                let (y, x) = ((i / width) as f32, (i % width) as f32);
                let stripe = if (x + y) as usize % 7 == 0 { 0.2 } else { 0.0 };
                0.5 + 0.3 * (0.4 * x).sin() * (0.3 * y).cos() + stripe
            })
            .collect();
        Image::new(Shape::D2 { height, width }, data).unwrap()
    }

    #[test]
    fn transfer_round_trips_and_shares_resident_images() {
        let Some(backend) = gpu() else { return };
        let input = textured(19, 23);
        let resident = backend.transfer(&input).unwrap();
        assert_eq!(resident.device(), Device::Gpu);
        assert!(resident.as_slice().is_none());

        let again = backend.transfer(&resident).unwrap();
        assert!(Arc::ptr_eq(again.gpu_buffer().unwrap(), resident.gpu_buffer().unwrap()));

        let back = resident.to_host().unwrap();
        assert_eq!(back.as_slice().unwrap(), input.as_slice().unwrap());
    }

    #[test]
    fn allocate_is_zeroed() {
        let Some(backend) = gpu() else { return };
        let image = backend
            .allocate(Shape::D3 {
                depth: 2,
                height: 3,
                width: 5,
            })
            .unwrap();
        assert_eq!(image.gpu_buffer().unwrap().len(), 30);
        assert!(image.to_host().unwrap().as_slice().unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn oversized_allocation_is_out_of_memory() {
        let Some(backend) = gpu() else { return };
        let result = backend.allocate(Shape::D3 {
            depth: 4096,
            height: 4096,
            width: 4096,
        });
        assert!(matches!(
            result,
            Err(Error::Device(DeviceError::OutOfMemory { .. }))
        ));
    }

    #[test]
    fn overflowing_shape_is_an_allocation_error() {
        let Some(backend) = gpu() else { return };
        let result = backend.allocate(Shape::D2 {
            height: usize::MAX,
            width: 2,
        });
        assert!(matches!(result, Err(Error::Allocation { .. })));
    }

    #[test]
    fn scoped_errors_surface_as_driver_errors() {
        let Some(backend) = gpu() else { return };
        let context = &backend.context;
        let source = context.create_storage("source", 4, None).unwrap();
        let destination = context.create_storage("destination", 4, None).unwrap();

        // copying past the end of both buffers fails validation
        let scope = ErrorScope::open(&context.device);
        context.copy(&source, &destination, 1024);
        assert!(matches!(
            scope.close(),
            Err(Error::Device(DeviceError::Driver(_)))
        ));

        let scope = ErrorScope::open(&context.device);
        context.copy(&source, &destination, 16);
        assert!(scope.close().is_ok());
    }

    #[test]
    fn dropped_solves_release_their_error_scope() {
        let Some(backend) = gpu() else { return };
        let params = RofTvParams::new(0.04, 5, 0.0025);
        let kernels = GpuRof::new(&backend, &textured(8, 8), &params).unwrap();
        drop(kernels);

        let scope = ErrorScope::open(&backend.context.device);
        assert!(scope.close().is_ok());

        let zeros = Image::zeros(Shape::D2 { height: 8, width: 8 }).unwrap();
        let output = backend.rof_tv(&zeros, &params).unwrap();
        assert_eq!(output.as_slice().unwrap(), zeros.as_slice().unwrap());
    }

    #[test]
    fn solvers_match_cpu() {
        let Some(backend) = gpu() else { return };
        let cpu = CpuBackend::new();
        let input = textured(37, 41);

        let params = RofTvParams::new(0.04, 40, 0.0025);
        let expected = cpu.rof_tv(&input, &params).unwrap();
        let actual = backend.rof_tv(&input, &params).unwrap();
        assert!(rmse(&expected, &actual).unwrap() < 1e-5);

        for method in [TvMethod::Isotropic, TvMethod::Anisotropic] {
            let params = FgpTvParams::new(0.04, 40, 0.0).with_method(method).with_nonneg(true);
            let expected = cpu.fgp_tv(&input, &params).unwrap();
            let actual = backend.fgp_tv(&input, &params).unwrap();
            assert!(rmse(&expected, &actual).unwrap() < 1e-5, "{method:?}");
        }
    }

    #[test]
    fn volumes_match_cpu() {
        let Some(backend) = gpu() else { return };
        let shape = Shape::D3 {
            depth: 5,
            height: 18,
            width: 21,
        };
        let data = (0..shape.len()).map(|i| ((i * 7919) % 101) as f32 / 101.0).collect();
        let input = Image::new(shape, data).unwrap();

        let params = FgpTvParams::new(0.05, 30, 1e-6);
        let expected = CpuBackend::new().fgp_tv(&input, &params).unwrap();
        let actual = backend.fgp_tv(&input, &params).unwrap();
        assert_eq!(actual.shape(), shape);
        assert!(rmse(&expected, &actual).unwrap() < 1e-5);
    }

    #[test]
    fn repeated_runs_are_identical() {
        let Some(backend) = gpu() else { return };
        let input = backend.transfer(&textured(32, 32)).unwrap();
        let params = FgpTvParams::new(0.04, 25, 1e-6);
        let a = backend.fgp_tv(&input, &params).unwrap();
        let b = backend.fgp_tv(&input, &params).unwrap();
        assert_eq!(a.as_slice().unwrap(), b.as_slice().unwrap());
    }
}
