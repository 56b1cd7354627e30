//! Descriptor configuration.
//!
//! These reconfigure the context's existing descriptors in place on every
//! call. Rejections become `CunnError::Configuration` with the cuDNN status
//! name. Tensor descriptors always carry explicit per-dimension strides, so
//! non-contiguous inputs are described as-is; the destination descriptor for
//! the forward path is derived from the backend's authoritative output-dim
//! query before the output buffer exists.

use cudarc::cudnn::sys;

use crate::cuda::context::cudnn_check;
use crate::error::{CunnError, CunnResult};
use crate::types::DType;

pub(crate) fn cudnn_dtype(dtype: DType) -> sys::cudnnDataType_t {
    match dtype {
        DType::F32 => sys::cudnnDataType_t::CUDNN_DATA_FLOAT,
        DType::F64 => sys::cudnnDataType_t::CUDNN_DATA_DOUBLE,
    }
}

/// Describe an existing tensor: NCHW dims with explicit strides.
pub(crate) fn set_tensor4d_ex(
    desc: sys::cudnnTensorDescriptor_t,
    dtype: DType,
    dims: [usize; 4],
    strides: [usize; 4],
) -> CunnResult<()> {
    let status = unsafe {
        sys::cudnnSetTensor4dDescriptorEx(
            desc,
            cudnn_dtype(dtype),
            dims[0] as i32,
            dims[1] as i32,
            dims[2] as i32,
            dims[3] as i32,
            strides[0] as i32,
            strides[1] as i32,
            strides[2] as i32,
            strides[3] as i32,
        )
    };
    cudnn_check(status, "cudnnSetTensor4dDescriptorEx").map_err(CunnError::Configuration)
}

/// Filter descriptor: [out_channels, in_channels, kernel_h, kernel_w], NCHW.
pub(crate) fn set_filter4d(
    desc: sys::cudnnFilterDescriptor_t,
    dtype: DType,
    dims: [usize; 4],
) -> CunnResult<()> {
    let status = unsafe {
        sys::cudnnSetFilter4dDescriptor(
            desc,
            cudnn_dtype(dtype),
            sys::cudnnTensorFormat_t::CUDNN_TENSOR_NCHW,
            dims[0] as i32,
            dims[1] as i32,
            dims[2] as i32,
            dims[3] as i32,
        )
    };
    cudnn_check(status, "cudnnSetFilter4dDescriptor").map_err(CunnError::Configuration)
}

/// Convolution descriptor: pad and stride per axis, dilation fixed at (1, 1),
/// cross-correlation mode (no kernel flip).
pub(crate) fn set_conv2d(
    desc: sys::cudnnConvolutionDescriptor_t,
    padding: [usize; 2],
    stride: [usize; 2],
    dtype: DType,
) -> CunnResult<()> {
    let status = unsafe {
        sys::cudnnSetConvolution2dDescriptor(
            desc,
            padding[0] as i32,
            padding[1] as i32,
            stride[0] as i32,
            stride[1] as i32,
            1,
            1,
            sys::cudnnConvolutionMode_t::CUDNN_CROSS_CORRELATION,
            cudnn_dtype(dtype),
        )
    };
    cudnn_check(status, "cudnnSetConvolution2dDescriptor").map_err(CunnError::Configuration)
}

/// Bias descriptor: [1, channels, 1, 1], broadcast over batch and space.
pub(crate) fn set_bias(
    desc: sys::cudnnTensorDescriptor_t,
    dtype: DType,
    channels: usize,
) -> CunnResult<()> {
    let status = unsafe {
        sys::cudnnSetTensor4dDescriptor(
            desc,
            sys::cudnnTensorFormat_t::CUDNN_TENSOR_NCHW,
            cudnn_dtype(dtype),
            1,
            channels as i32,
            1,
            1,
        )
    };
    cudnn_check(status, "cudnnSetTensor4dDescriptor(bias)").map_err(CunnError::Configuration)
}

pub(crate) fn set_activation(
    desc: sys::cudnnActivationDescriptor_t,
    mode: sys::cudnnActivationMode_t,
) -> CunnResult<()> {
    let status = unsafe {
        sys::cudnnSetActivationDescriptor(
            desc,
            mode,
            sys::cudnnNanPropagation_t::CUDNN_PROPAGATE_NAN,
            0.0,
        )
    };
    cudnn_check(status, "cudnnSetActivationDescriptor").map_err(CunnError::Configuration)
}

/// Authoritative output dims for the configured convolution + source + filter.
///
/// The forward path allocates its destination from these, not from host-side
/// arithmetic.
pub(crate) fn forward_output_dim(
    conv: sys::cudnnConvolutionDescriptor_t,
    src: sys::cudnnTensorDescriptor_t,
    filter: sys::cudnnFilterDescriptor_t,
) -> CunnResult<[usize; 4]> {
    let (mut n, mut c, mut h, mut w) = (0i32, 0i32, 0i32, 0i32);
    let status = unsafe {
        sys::cudnnGetConvolution2dForwardOutputDim(conv, src, filter, &mut n, &mut c, &mut h, &mut w)
    };
    cudnn_check(status, "cudnnGetConvolution2dForwardOutputDim").map_err(CunnError::Configuration)?;
    Ok([n as usize, c as usize, h as usize, w as usize])
}
