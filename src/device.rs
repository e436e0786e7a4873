use std::fmt;
use std::str::FromStr;

use crate::backend::{Backend, CpuBackend, GpuBackend};
use crate::error::{Error, Result};

/// Execution target for one solver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Reference path on the host, parallelised with rayon.
    #[default]
    Cpu,
    /// Parallel path on a wgpu adapter.
    Gpu,
}

impl Device {
    /// Builds the backend for this device.
    ///
    /// The GPU backend requests a fresh adapter on every call and fails with
    /// [`crate::DeviceError::Unavailable`] when none is present.
    pub fn backend(self) -> Result<Box<dyn Backend>> {
        match self {
            Device::Cpu => Ok(Box::new(CpuBackend::new())),
            Device::Gpu => Ok(Box::new(GpuBackend::new()?)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Gpu => "gpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" => Ok(Device::Gpu),
            other => Err(Error::invalid(
                "device",
                format!("expected \"cpu\" or \"gpu\", got {other:?}"),
            )),
        }
    }
}
