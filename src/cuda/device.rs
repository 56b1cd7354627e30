use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use cudarc::driver::{CudaContext, CudaSlice, CudaStream, DeviceRepr, ValidAsZeroBits};

use crate::cuda::kernels::Kernels;
use crate::error::{CunnError, CunnResult};

/// One CUDA device: driver context, default stream and the elementwise kernel
/// cache. Obtained through the global pool so that all layers on the same
/// ordinal share a context.
pub struct CudaDevice {
    ordinal: usize,
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    kernels: Arc<Kernels>,
}

// Global device pool: maps CUDA device ordinal -> CudaDevice
static CUDA_DEVICES: LazyLock<RwLock<HashMap<usize, Arc<CudaDevice>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

impl std::fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CudaDevice({})", self.ordinal)
    }
}

impl CudaDevice {
    /// Get or create the device for the given ordinal.
    pub fn get(ordinal: usize) -> CunnResult<Arc<CudaDevice>> {
        // Try to get existing device first (read lock)
        {
            let devices = CUDA_DEVICES
                .read()
                .map_err(|e| CunnError::Initialization(format!("device pool poisoned: {:?}", e)))?;
            if let Some(device) = devices.get(&ordinal) {
                return Ok(device.clone());
            }
        }

        // Need to create new device (write lock)
        let mut devices = CUDA_DEVICES
            .write()
            .map_err(|e| CunnError::Initialization(format!("device pool poisoned: {:?}", e)))?;

        // Double-check in case another thread created it
        if let Some(device) = devices.get(&ordinal) {
            return Ok(device.clone());
        }

        let context = CudaContext::new(ordinal).map_err(|e| {
            CunnError::Initialization(format!(
                "failed to create CUDA context for device {}: {:?}",
                ordinal, e
            ))
        })?;
        let stream = context.default_stream();
        log::debug!("created CUDA context for device {}", ordinal);

        let device = Arc::new(CudaDevice {
            ordinal,
            context,
            stream,
            kernels: Arc::new(Kernels::new()),
        });

        devices.insert(ordinal, device.clone());
        Ok(device)
    }

    /// The default device (ordinal 0).
    pub fn global() -> CunnResult<Arc<CudaDevice>> {
        Self::get(0)
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }

    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    pub fn kernels(&self) -> &Kernels {
        &self.kernels
    }

    pub fn synchronize(&self) -> CunnResult<()> {
        self.context
            .synchronize()
            .map_err(|e| CunnError::Execution(format!("CUDA synchronize failed: {:?}", e)))
    }

    /// Uninitialized device buffer of `len` elements.
    pub fn alloc_uninit<T: DeviceRepr>(&self, len: usize) -> CunnResult<CudaSlice<T>> {
        unsafe {
            self.stream
                .alloc(len)
                .map_err(|e| CunnError::Allocation(format!("CUDA alloc of {} elements failed: {:?}", len, e)))
        }
    }

    /// Zero-filled device buffer of `len` elements.
    pub fn alloc_zeros<T: DeviceRepr + ValidAsZeroBits>(&self, len: usize) -> CunnResult<CudaSlice<T>> {
        self.stream
            .alloc_zeros(len)
            .map_err(|e| CunnError::Allocation(format!("CUDA alloc of {} elements failed: {:?}", len, e)))
    }

    /// Device buffer initialized from host data.
    pub fn htod<T: DeviceRepr + Clone>(&self, data: &[T]) -> CunnResult<CudaSlice<T>> {
        self.stream
            .memcpy_stod(data)
            .map_err(|e| CunnError::Allocation(format!("CUDA host-to-device copy failed: {:?}", e)))
    }

    /// Copy a device buffer back to the host.
    pub fn dtoh<T: DeviceRepr + Clone + Default>(&self, data: &CudaSlice<T>) -> CunnResult<Vec<T>> {
        self.stream
            .memcpy_dtov(data)
            .map_err(|e| CunnError::Execution(format!("CUDA device-to-host copy failed: {:?}", e)))
    }
}
