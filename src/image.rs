use std::sync::Arc;

use ndarray::{Array2, Array3, ArrayD, ArrayViewD, IxDyn};

use crate::backend::gpu::GpuBuffer;
use crate::device::Device;
use crate::error::{Error, Result};

/// Extents of a 2D or 3D image, slowest axis first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    D2 { height: usize, width: usize },
    D3 { depth: usize, height: usize, width: usize },
}

impl Shape {
    pub fn ndim(&self) -> usize {
        match self {
            Shape::D2 { .. } => 2,
            Shape::D3 { .. } => 3,
        }
    }

    /// `[depth, height, width]`, with `depth == 1` for 2D shapes.
    pub fn extents(&self) -> [usize; 3] {
        match *self {
            Shape::D2 { height, width } => [1, height, width],
            Shape::D3 {
                depth,
                height,
                width,
            } => [depth, height, width],
        }
    }

    /// Dimensions in the order ndarray expects them.
    pub fn dims(&self) -> Vec<usize> {
        match *self {
            Shape::D2 { height, width } => vec![height, width],
            Shape::D3 {
                depth,
                height,
                width,
            } => vec![depth, height, width],
        }
    }

    /// Number of samples, saturating at `usize::MAX`.
    pub fn len(&self) -> usize {
        self.extents()
            .iter()
            .try_fold(1usize, |acc, &e| acc.checked_mul(e))
            .unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the sample buffer in bytes, failing on overflow.
    pub fn byte_len(&self) -> Result<usize> {
        self.extents()
            .iter()
            .try_fold(std::mem::size_of::<f32>(), |acc, &e| acc.checked_mul(e))
            .ok_or(Error::Allocation { bytes: usize::MAX })
    }

    pub fn from_dims(dims: &[usize]) -> Result<Self> {
        let shape = match *dims {
            [height, width] => Shape::D2 { height, width },
            [depth, height, width] => Shape::D3 {
                depth,
                height,
                width,
            },
            _ => {
                return Err(Error::invalid(
                    "input",
                    format!("expected a 2D or 3D image, got {} dimensions", dims.len()),
                ))
            }
        };
        shape.validate()?;
        Ok(shape)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.extents().contains(&0) {
            return Err(Error::invalid(
                "input",
                format!("image extents must be non-zero, got {:?}", self.dims()),
            ));
        }
        self.byte_len()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Storage {
    Host(Arc<ArrayD<f32>>),
    Gpu(Arc<GpuBuffer>),
}

/// Dense single-precision image, row-major, resident on the host or a GPU.
///
/// Clones share the underlying samples, on the host and on the GPU alike.
/// Images are never written after construction.
#[derive(Debug, Clone)]
pub struct Image {
    shape: Shape,
    storage: Storage,
}

impl Image {
    /// Creates a host image from row-major samples.
    pub fn new(shape: Shape, data: Vec<f32>) -> Result<Self> {
        shape.validate()?;
        if data.len() != shape.len() {
            return Err(Error::invalid(
                "input",
                format!(
                    "data length ({}) does not match the image size ({})",
                    data.len(),
                    shape.len()
                ),
            ));
        }
        let array = ArrayD::from_shape_vec(IxDyn(&shape.dims()), data)
            .map_err(|e| Error::invalid("input", e.to_string()))?;
        Ok(Self {
            shape,
            storage: Storage::Host(Arc::new(array)),
        })
    }

    /// Wraps a 2D or 3D array, copying it into standard layout if needed.
    pub fn from_array(array: ArrayD<f32>) -> Result<Self> {
        let shape = Shape::from_dims(array.shape())?;
        let array = if array.is_standard_layout() {
            array
        } else {
            array.as_standard_layout().into_owned()
        };
        Ok(Self {
            shape,
            storage: Storage::Host(Arc::new(array)),
        })
    }

    /// Zero-initialised host image.
    pub fn zeros(shape: Shape) -> Result<Self> {
        shape.validate()?;
        let bytes = shape.byte_len()?;
        let mut data: Vec<f32> = Vec::new();
        data.try_reserve_exact(shape.len())
            .map_err(|_| Error::Allocation { bytes })?;
        data.resize(shape.len(), 0.0);
        Self::new(shape, data)
    }

    pub(crate) fn from_gpu(shape: Shape, buffer: Arc<GpuBuffer>) -> Self {
        Self {
            shape,
            storage: Storage::Gpu(buffer),
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    /// Device the samples currently live on.
    pub fn device(&self) -> Device {
        match self.storage {
            Storage::Host(_) => Device::Cpu,
            Storage::Gpu(_) => Device::Gpu,
        }
    }

    /// Host samples in row-major order, or `None` for GPU-resident images.
    pub fn as_slice(&self) -> Option<&[f32]> {
        match &self.storage {
            Storage::Host(array) => array.as_slice(),
            Storage::Gpu(_) => None,
        }
    }

    pub fn view(&self) -> Option<ArrayViewD<'_, f32>> {
        match &self.storage {
            Storage::Host(array) => Some(array.view()),
            Storage::Gpu(_) => None,
        }
    }

    pub(crate) fn gpu_buffer(&self) -> Option<&Arc<GpuBuffer>> {
        match &self.storage {
            Storage::Host(_) => None,
            Storage::Gpu(buffer) => Some(buffer),
        }
    }

    /// Host-resident copy; shares the array when already on the host.
    pub fn to_host(&self) -> Result<Image> {
        match &self.storage {
            Storage::Host(_) => Ok(self.clone()),
            Storage::Gpu(buffer) => {
                let data = buffer.download()?;
                Image::new(self.shape, data)
            }
        }
    }

    pub fn into_array(self) -> Result<ArrayD<f32>> {
        match self.storage {
            Storage::Host(array) => Ok(Arc::unwrap_or_clone(array)),
            Storage::Gpu(buffer) => {
                let data = buffer.download()?;
                ArrayD::from_shape_vec(IxDyn(&self.shape.dims()), data)
                    .map_err(|e| Error::invalid("image", e.to_string()))
            }
        }
    }

    /// Converts a 2D image into an [`Array2`].
    pub fn into_array2(self) -> Result<Array2<f32>> {
        let shape = self.shape;
        self.into_array()?
            .into_dimensionality()
            .map_err(|_| Error::invalid("image", format!("expected a 2D image, got {shape:?}")))
    }

    /// Converts a 3D image into an [`Array3`].
    pub fn into_array3(self) -> Result<Array3<f32>> {
        let shape = self.shape;
        self.into_array()?
            .into_dimensionality()
            .map_err(|_| Error::invalid("image", format!("expected a 3D image, got {shape:?}")))
    }
}

impl TryFrom<Array2<f32>> for Image {
    type Error = Error;

    fn try_from(array: Array2<f32>) -> Result<Self> {
        Image::from_array(array.into_dyn())
    }
}

impl TryFrom<Array3<f32>> for Image {
    type Error = Error;

    fn try_from(array: Array3<f32>) -> Result<Self> {
        Image::from_array(array.into_dyn())
    }
}
