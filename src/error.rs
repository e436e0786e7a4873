/// Errors raised by the GPU execution path.
#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    /// No compatible adapter could be found.
    #[error("no compatible GPU adapter available: {0}")]
    Unavailable(String),

    /// The adapter refused to create a logical device.
    #[error("failed to request GPU device")]
    RequestDevice(#[from] wgpu::RequestDeviceError),

    /// The request does not fit the device's memory limits.
    #[error("GPU allocation of {requested} bytes exceeds the device limit of {limit} bytes")]
    OutOfMemory { requested: u64, limit: u64 },

    /// The driver reported an error while recording or running work.
    #[error("GPU driver error: {0}")]
    Driver(String),

    /// Mapping a staging buffer for readback failed.
    #[error("failed to map GPU buffer")]
    BufferMap(#[from] wgpu::BufferAsyncError),

    /// The readback callback was dropped before it fired.
    #[error("GPU readback was canceled")]
    Canceled,

    /// The image exceeds a dispatch or indexing limit of the device.
    #[error("unsupported on this GPU: {0}")]
    Unsupported(String),
}

/// Errors returned by the regularisation engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Out-of-range or non-physical input, reported before any computation.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// The requested device is unavailable or out of memory.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Host memory could not be reserved for an image buffer.
    #[error("failed to allocate {bytes} bytes of host memory")]
    Allocation { bytes: usize },
}

impl Error {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
