use std::ffi::c_void;
use std::sync::Arc;

use cudarc::driver::{CudaSlice, DevicePtr, DevicePtrMut, SyncOnDrop};

use crate::cuda::device::CudaDevice;
use crate::cuda::kernels;
use crate::error::{CunnError, CunnResult};
use crate::types::{DType, Layout};

pub(crate) enum Data {
    F32(CudaSlice<f32>),
    F64(CudaSlice<f64>),
}

/// A device-resident tensor: a typed CUDA buffer plus its layout.
///
/// The layout may describe a non-contiguous view into the buffer; dense
/// allocations are row-major. All transfers and kernels run on the owning
/// device's default stream and are synchronous from the caller's perspective.
pub struct DeviceTensor {
    pub(crate) device: Arc<CudaDevice>,
    pub(crate) data: Data,
    pub(crate) layout: Layout,
}

impl std::fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DeviceTensor({}, shape {:?}, strides {:?})",
            self.dtype(),
            self.layout.shape(),
            self.layout.strides()
        )
    }
}

impl DeviceTensor {
    /// Uninitialized dense tensor. Contents are garbage until written.
    pub fn uninit(device: &Arc<CudaDevice>, shape: &[usize], dtype: DType) -> CunnResult<Self> {
        let layout = Layout::from_shape(shape);
        let data = match dtype {
            DType::F32 => Data::F32(device.alloc_uninit(layout.size())?),
            DType::F64 => Data::F64(device.alloc_uninit(layout.size())?),
        };
        Ok(Self {
            device: device.clone(),
            data,
            layout,
        })
    }

    /// Zero-filled dense tensor.
    pub fn zeros(device: &Arc<CudaDevice>, shape: &[usize], dtype: DType) -> CunnResult<Self> {
        let layout = Layout::from_shape(shape);
        let data = match dtype {
            DType::F32 => Data::F32(device.alloc_zeros(layout.size())?),
            DType::F64 => Data::F64(device.alloc_zeros(layout.size())?),
        };
        Ok(Self {
            device: device.clone(),
            data,
            layout,
        })
    }

    /// Dense tensor initialized from host data.
    pub fn from_f32(device: &Arc<CudaDevice>, data: &[f32], shape: &[usize]) -> CunnResult<Self> {
        let layout = Layout::from_shape(shape);
        if layout.size() != data.len() {
            return Err(CunnError::Input(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                layout.size(),
                data.len()
            )));
        }
        Ok(Self {
            device: device.clone(),
            data: Data::F32(device.htod(data)?),
            layout,
        })
    }

    /// Dense tensor initialized from host data.
    pub fn from_f64(device: &Arc<CudaDevice>, data: &[f64], shape: &[usize]) -> CunnResult<Self> {
        let layout = Layout::from_shape(shape);
        if layout.size() != data.len() {
            return Err(CunnError::Input(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                layout.size(),
                data.len()
            )));
        }
        Ok(Self {
            device: device.clone(),
            data: Data::F64(device.htod(data)?),
            layout,
        })
    }

    pub fn dtype(&self) -> DType {
        match self.data {
            Data::F32(_) => DType::F32,
            Data::F64(_) => DType::F64,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    /// Number of elements in the underlying buffer (not the view).
    pub fn buffer_len(&self) -> usize {
        match &self.data {
            Data::F32(s) => s.len(),
            Data::F64(s) => s.len(),
        }
    }

    /// Reinterpret the buffer through a different layout (a strided view).
    ///
    /// The new layout must address only elements inside the buffer.
    pub fn set_layout(&mut self, layout: Layout) -> CunnResult<()> {
        let mut last = layout.offset();
        for (&dim, &stride) in layout.shape().iter().zip(layout.strides()) {
            if dim == 0 {
                last = 0;
                break;
            }
            last += (dim - 1) * stride;
        }
        if layout.size() > 0 && last >= self.buffer_len() {
            return Err(CunnError::Input(format!(
                "layout {:?} addresses element {} beyond buffer of {}",
                layout,
                last,
                self.buffer_len()
            )));
        }
        self.layout = layout;
        Ok(())
    }

    /// Copy back to the host, in the order the buffer stores elements.
    pub fn to_vec_f32(&self) -> CunnResult<Vec<f32>> {
        match &self.data {
            Data::F32(s) => self.device.dtoh(s),
            Data::F64(_) => Err(CunnError::Input("tensor is f64, not f32".to_string())),
        }
    }

    /// Copy back to the host, in the order the buffer stores elements.
    pub fn to_vec_f64(&self) -> CunnResult<Vec<f64>> {
        match &self.data {
            Data::F64(s) => self.device.dtoh(s),
            Data::F32(_) => Err(CunnError::Input("tensor is f32, not f64".to_string())),
        }
    }

    /// Dense row-major copy of this tensor.
    ///
    /// For contiguous zero-offset tensors this is a device-to-device memcpy;
    /// other layouts go through the strided-gather kernel.
    pub fn dup_dense(&self) -> CunnResult<Self> {
        if self.layout.is_contiguous() && self.layout.offset() == 0 {
            let stream = self.device.stream();
            let mut out = Self::uninit(&self.device, self.layout.shape(), self.dtype())?;
            match (&self.data, &mut out.data) {
                (Data::F32(src), Data::F32(dst)) => stream
                    .memcpy_dtod(src, dst)
                    .map_err(|e| CunnError::Execution(format!("CUDA dtod copy failed: {:?}", e)))?,
                (Data::F64(src), Data::F64(dst)) => stream
                    .memcpy_dtod(src, dst)
                    .map_err(|e| CunnError::Execution(format!("CUDA dtod copy failed: {:?}", e)))?,
                _ => unreachable!(),
            }
            Ok(out)
        } else {
            kernels::copy_strided(self)
        }
    }

    /// Raw device address for cuDNN calls, with its stream-ordering guard.
    ///
    /// The view's element offset is folded into the address; descriptors built
    /// from this view's strides and this pointer address the same window.
    pub(crate) fn ptr(&self) -> (*const c_void, SyncOnDrop<'_>) {
        let byte_offset = (self.layout.offset() * self.dtype().size_in_bytes()) as u64;
        let stream = self.device.stream();
        match &self.data {
            Data::F32(s) => {
                let (p, guard) = s.device_ptr(stream);
                ((p + byte_offset) as *const c_void, guard)
            }
            Data::F64(s) => {
                let (p, guard) = s.device_ptr(stream);
                ((p + byte_offset) as *const c_void, guard)
            }
        }
    }

    /// Mutable raw device address for cuDNN calls, with its guard. Offset
    /// handling as in `ptr`.
    pub(crate) fn ptr_mut(&mut self) -> (*mut c_void, SyncOnDrop<'_>) {
        let byte_offset = (self.layout.offset() * self.dtype().size_in_bytes()) as u64;
        let stream = self.device.stream();
        match &mut self.data {
            Data::F32(s) => {
                let (p, guard) = s.device_ptr_mut(stream);
                ((p + byte_offset) as *mut c_void, guard)
            }
            Data::F64(s) => {
                let (p, guard) = s.device_ptr_mut(stream);
                ((p + byte_offset) as *mut c_void, guard)
            }
        }
    }

    /// Device address without claiming the data, for identity checks in tests.
    pub fn data_addr(&self) -> u64 {
        let (p, guard) = self.ptr();
        drop(guard);
        p as u64
    }
}
