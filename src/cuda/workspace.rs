//! Scratch workspace for the selected convolution algorithms.
//!
//! The buffer lives exactly as long as the call that sized it: it is freed on
//! drop, so an error between any two compute calls still releases the scratch
//! memory. For backward calls one buffer sized to the larger of the filter
//! and data requirements backs both executions.

use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

use cudarc::cudnn::sys;
use cudarc::driver::{CudaSlice, DevicePtrMut, SyncOnDrop};

use crate::cuda::context::cudnn_check;
use crate::cuda::device::CudaDevice;
use crate::error::{CunnError, CunnResult};

pub(crate) struct Workspace {
    device: Arc<CudaDevice>,
    buf: Option<CudaSlice<u8>>,
}

impl Workspace {
    /// Size and allocate for a forward execution. Returns the workspace and
    /// the byte count to pass to the compute call.
    pub fn for_forward(
        device: &Arc<CudaDevice>,
        handle: sys::cudnnHandle_t,
        src: sys::cudnnTensorDescriptor_t,
        filter: sys::cudnnFilterDescriptor_t,
        conv: sys::cudnnConvolutionDescriptor_t,
        dst: sys::cudnnTensorDescriptor_t,
        algo: sys::cudnnConvolutionFwdAlgo_t,
    ) -> CunnResult<(Self, usize)> {
        let mut bytes = 0usize;
        let status = unsafe {
            sys::cudnnGetConvolutionForwardWorkspaceSize(handle, src, filter, conv, dst, algo, &mut bytes)
        };
        cudnn_check(status, "cudnnGetConvolutionForwardWorkspaceSize").map_err(CunnError::Execution)?;
        Ok((Self::alloc(device, bytes)?, bytes))
    }

    /// Size and allocate for a backward execution: the filter and data
    /// requirements are queried separately and one buffer covers the larger.
    /// Returns the workspace plus the per-operation byte counts.
    pub fn for_backward(
        device: &Arc<CudaDevice>,
        handle: sys::cudnnHandle_t,
        src: sys::cudnnTensorDescriptor_t,
        delta: sys::cudnnTensorDescriptor_t,
        conv: sys::cudnnConvolutionDescriptor_t,
        filter: sys::cudnnFilterDescriptor_t,
        dst: sys::cudnnTensorDescriptor_t,
        filter_algo: sys::cudnnConvolutionBwdFilterAlgo_t,
        data_algo: sys::cudnnConvolutionBwdDataAlgo_t,
    ) -> CunnResult<(Self, usize, usize)> {
        let mut filter_bytes = 0usize;
        let status = unsafe {
            sys::cudnnGetConvolutionBackwardFilterWorkspaceSize(
                handle,
                src,
                delta,
                conv,
                filter,
                filter_algo,
                &mut filter_bytes,
            )
        };
        cudnn_check(status, "cudnnGetConvolutionBackwardFilterWorkspaceSize").map_err(CunnError::Execution)?;

        let mut data_bytes = 0usize;
        let status = unsafe {
            sys::cudnnGetConvolutionBackwardDataWorkspaceSize(
                handle,
                filter,
                delta,
                conv,
                dst,
                data_algo,
                &mut data_bytes,
            )
        };
        cudnn_check(status, "cudnnGetConvolutionBackwardDataWorkspaceSize").map_err(CunnError::Execution)?;

        let ws = Self::alloc(device, filter_bytes.max(data_bytes))?;
        Ok((ws, filter_bytes, data_bytes))
    }

    fn alloc(device: &Arc<CudaDevice>, bytes: usize) -> CunnResult<Self> {
        let buf = if bytes > 0 {
            log::debug!("allocating {} byte convolution workspace", bytes);
            Some(device.alloc_uninit::<u8>(bytes)?)
        } else {
            None
        };
        Ok(Self {
            device: device.clone(),
            buf,
        })
    }

    /// Device address of the buffer (null when no workspace is needed), with
    /// its stream-ordering guard.
    pub fn ptr(&mut self) -> (*mut c_void, Option<SyncOnDrop<'_>>) {
        let stream = self.device.stream();
        match &mut self.buf {
            Some(buf) => {
                let (p, guard) = buf.device_ptr_mut(stream);
                (p as *mut c_void, Some(guard))
            }
            None => (ptr::null_mut(), None),
        }
    }
}
