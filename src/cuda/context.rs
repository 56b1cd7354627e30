use std::ptr;
use std::sync::Arc;

use cudarc::cudnn::sys;

use crate::cuda::device::CudaDevice;
use crate::error::{CunnError, CunnResult};

/// Turn a cuDNN status into a message fragment, `Ok(())` on success.
///
/// Call sites map the message into the error category of their stage
/// (initialization, configuration, execution).
pub(crate) fn cudnn_check(status: sys::cudnnStatus_t, what: &str) -> Result<(), String> {
    if status == sys::cudnnStatus_t::CUDNN_STATUS_SUCCESS {
        Ok(())
    } else {
        Err(format!("{}: {:?}", what, status))
    }
}

/// The cuDNN handle and the descriptor set of one layer instance.
///
/// Descriptors are created once and reconfigured on every call; they are
/// released with the context, descriptors first, then the handle. The context
/// is bound to its device's default stream. It may move between threads but
/// must never be used from two threads at once: every call mutates the shared
/// descriptor state in place.
pub struct CudnnContext {
    device: Arc<CudaDevice>,
    handle: sys::cudnnHandle_t,
    pub(crate) src_desc: sys::cudnnTensorDescriptor_t,
    pub(crate) dst_desc: sys::cudnnTensorDescriptor_t,
    pub(crate) bias_desc: sys::cudnnTensorDescriptor_t,
    pub(crate) delta_desc: sys::cudnnTensorDescriptor_t,
    pub(crate) filter_desc: sys::cudnnFilterDescriptor_t,
    pub(crate) conv_desc: sys::cudnnConvolutionDescriptor_t,
    pub(crate) activation_desc: sys::cudnnActivationDescriptor_t,
}

unsafe impl Send for CudnnContext {}

impl CudnnContext {
    /// Create the handle and all descriptors. If any native creation call is
    /// rejected, everything created so far is backed out before returning
    /// `CunnError::Initialization`.
    pub fn new(device: &Arc<CudaDevice>) -> CunnResult<Self> {
        let mut ctx = Self {
            device: device.clone(),
            handle: ptr::null_mut(),
            src_desc: ptr::null_mut(),
            dst_desc: ptr::null_mut(),
            bias_desc: ptr::null_mut(),
            delta_desc: ptr::null_mut(),
            filter_desc: ptr::null_mut(),
            conv_desc: ptr::null_mut(),
            activation_desc: ptr::null_mut(),
        };

        if let Err(msg) = ctx.create_handles() {
            ctx.release();
            return Err(CunnError::Initialization(msg));
        }

        log::debug!("created cuDNN context on device {}", device.ordinal());
        Ok(ctx)
    }

    fn create_handles(&mut self) -> Result<(), String> {
        unsafe {
            cudnn_check(sys::cudnnCreate(&mut self.handle), "cudnnCreate")?;
            cudnn_check(
                sys::cudnnSetStream(self.handle, self.device.stream().cu_stream() as sys::cudaStream_t),
                "cudnnSetStream",
            )?;
            cudnn_check(
                sys::cudnnCreateTensorDescriptor(&mut self.src_desc),
                "cudnnCreateTensorDescriptor(src)",
            )?;
            cudnn_check(
                sys::cudnnCreateTensorDescriptor(&mut self.dst_desc),
                "cudnnCreateTensorDescriptor(dst)",
            )?;
            cudnn_check(
                sys::cudnnCreateTensorDescriptor(&mut self.bias_desc),
                "cudnnCreateTensorDescriptor(bias)",
            )?;
            cudnn_check(
                sys::cudnnCreateTensorDescriptor(&mut self.delta_desc),
                "cudnnCreateTensorDescriptor(delta)",
            )?;
            cudnn_check(
                sys::cudnnCreateFilterDescriptor(&mut self.filter_desc),
                "cudnnCreateFilterDescriptor",
            )?;
            cudnn_check(
                sys::cudnnCreateConvolutionDescriptor(&mut self.conv_desc),
                "cudnnCreateConvolutionDescriptor",
            )?;
            cudnn_check(
                sys::cudnnCreateActivationDescriptor(&mut self.activation_desc),
                "cudnnCreateActivationDescriptor",
            )?;
        }
        Ok(())
    }

    /// Release descriptors then the handle. Null-guarded, so it is safe to
    /// call on a partially created context and a second call is a no-op.
    fn release(&mut self) {
        unsafe {
            if !self.activation_desc.is_null() {
                sys::cudnnDestroyActivationDescriptor(self.activation_desc);
                self.activation_desc = ptr::null_mut();
            }
            if !self.conv_desc.is_null() {
                sys::cudnnDestroyConvolutionDescriptor(self.conv_desc);
                self.conv_desc = ptr::null_mut();
            }
            if !self.filter_desc.is_null() {
                sys::cudnnDestroyFilterDescriptor(self.filter_desc);
                self.filter_desc = ptr::null_mut();
            }
            if !self.src_desc.is_null() {
                sys::cudnnDestroyTensorDescriptor(self.src_desc);
                self.src_desc = ptr::null_mut();
            }
            if !self.dst_desc.is_null() {
                sys::cudnnDestroyTensorDescriptor(self.dst_desc);
                self.dst_desc = ptr::null_mut();
            }
            if !self.bias_desc.is_null() {
                sys::cudnnDestroyTensorDescriptor(self.bias_desc);
                self.bias_desc = ptr::null_mut();
            }
            if !self.delta_desc.is_null() {
                sys::cudnnDestroyTensorDescriptor(self.delta_desc);
                self.delta_desc = ptr::null_mut();
            }
            if !self.handle.is_null() {
                sys::cudnnDestroy(self.handle);
                self.handle = ptr::null_mut();
            }
        }
    }

    /// Deep copy: a fresh handle and descriptor set on the same device.
    ///
    /// Descriptors carry no state between calls (every call reconfigures the
    /// ones it uses before executing), so newly created native objects are an
    /// equivalent deep copy. Nothing is aliased; each context destroys only
    /// its own handles.
    pub fn try_clone(&self) -> CunnResult<Self> {
        Self::new(&self.device)
    }

    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    pub(crate) fn handle(&self) -> sys::cudnnHandle_t {
        self.handle
    }
}

impl Drop for CudnnContext {
    fn drop(&mut self) {
        self.release();
    }
}
