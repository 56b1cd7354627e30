//! Convolution algorithm selection.
//!
//! The `_v7` queries return candidates sorted fastest-first with no workspace
//! cap, which is the prefer-fastest / zero-limit policy of the older
//! preference-enum API. One candidate is requested and its workspace demand
//! is handled afterwards by the workspace allocator.

use std::mem::MaybeUninit;

use cudarc::cudnn::sys;

use crate::cuda::context::cudnn_check;
use crate::error::{CunnError, CunnResult};

pub(crate) fn forward_algo(
    handle: sys::cudnnHandle_t,
    src: sys::cudnnTensorDescriptor_t,
    filter: sys::cudnnFilterDescriptor_t,
    conv: sys::cudnnConvolutionDescriptor_t,
    dst: sys::cudnnTensorDescriptor_t,
) -> CunnResult<sys::cudnnConvolutionFwdAlgo_t> {
    let mut returned = 0i32;
    let mut perf = MaybeUninit::<sys::cudnnConvolutionFwdAlgoPerf_t>::zeroed();
    let status = unsafe {
        sys::cudnnGetConvolutionForwardAlgorithm_v7(
            handle,
            src,
            filter,
            conv,
            dst,
            1,
            &mut returned,
            perf.as_mut_ptr(),
        )
    };
    cudnn_check(status, "cudnnGetConvolutionForwardAlgorithm_v7").map_err(CunnError::Execution)?;
    if returned < 1 {
        return Err(CunnError::Execution(
            "no forward convolution algorithm available".to_string(),
        ));
    }
    let perf = unsafe { perf.assume_init() };
    log::debug!("forward algorithm: {:?}", perf.algo);
    Ok(perf.algo)
}

pub(crate) fn backward_filter_algo(
    handle: sys::cudnnHandle_t,
    src: sys::cudnnTensorDescriptor_t,
    delta: sys::cudnnTensorDescriptor_t,
    conv: sys::cudnnConvolutionDescriptor_t,
    filter: sys::cudnnFilterDescriptor_t,
) -> CunnResult<sys::cudnnConvolutionBwdFilterAlgo_t> {
    let mut returned = 0i32;
    let mut perf = MaybeUninit::<sys::cudnnConvolutionBwdFilterAlgoPerf_t>::zeroed();
    let status = unsafe {
        sys::cudnnGetConvolutionBackwardFilterAlgorithm_v7(
            handle,
            src,
            delta,
            conv,
            filter,
            1,
            &mut returned,
            perf.as_mut_ptr(),
        )
    };
    cudnn_check(status, "cudnnGetConvolutionBackwardFilterAlgorithm_v7").map_err(CunnError::Execution)?;
    if returned < 1 {
        return Err(CunnError::Execution(
            "no backward-filter convolution algorithm available".to_string(),
        ));
    }
    let perf = unsafe { perf.assume_init() };
    log::debug!("backward-filter algorithm: {:?}", perf.algo);
    Ok(perf.algo)
}

/// The backward-data pass reuses the backward-filter algorithm id: one
/// selection per backward call feeds both the filter and data executions,
/// even though the two enumerations only coincide on their shared ids.
/// Historical behavior, kept on purpose (see DESIGN.md). Ids without a
/// backward-data counterpart fall back to the id-0 algorithm.
pub(crate) fn backward_data_algo_from_filter(
    algo: sys::cudnnConvolutionBwdFilterAlgo_t,
) -> sys::cudnnConvolutionBwdDataAlgo_t {
    use sys::cudnnConvolutionBwdDataAlgo_t as Data;
    match algo as u32 {
        0 => Data::CUDNN_CONVOLUTION_BWD_DATA_ALGO_0,
        1 => Data::CUDNN_CONVOLUTION_BWD_DATA_ALGO_1,
        2 => Data::CUDNN_CONVOLUTION_BWD_DATA_ALGO_FFT,
        3 => Data::CUDNN_CONVOLUTION_BWD_DATA_ALGO_FFT_TILING,
        4 => Data::CUDNN_CONVOLUTION_BWD_DATA_ALGO_WINOGRAD,
        5 => Data::CUDNN_CONVOLUTION_BWD_DATA_ALGO_WINOGRAD_NONFUSED,
        _ => Data::CUDNN_CONVOLUTION_BWD_DATA_ALGO_0,
    }
}
