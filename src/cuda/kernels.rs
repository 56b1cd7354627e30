//! Elementwise device kernels for the activation fallback path, activation
//! derivatives and delta assembly.
//!
//! The CUDA source is compiled once per process through NVRTC and cached as a
//! module; functions are cached by name. Unary and multiply kernels assume a
//! dense operand (pre-activation buffers are always allocated dense); the
//! multiply's right-hand side and the strided gather handle arbitrary strides
//! through a metadata buffer of `[num_els, ndim, shape.., strides.., offset]`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use cudarc::driver::{CudaFunction, CudaModule, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::compile_ptx;

use crate::cuda::storage::{Data, DeviceTensor};
use crate::error::{CunnError, CunnResult};
use crate::types::{DType, Layout};

const SRC: &str = r#"
#define UNARY_INPLACE(NAME, TY, EXPR)                                      \
extern "C" __global__ void NAME(TY *buf, const unsigned int n) {           \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                \
    if (i < n) {                                                           \
        TY x = buf[i];                                                     \
        buf[i] = (EXPR);                                                   \
    }                                                                      \
}

#define UNARY(NAME, TY, EXPR)                                              \
extern "C" __global__ void NAME(const TY *in, TY *out,                     \
                                const unsigned int n) {                    \
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;                \
    if (i < n) {                                                           \
        TY x = in[i];                                                      \
        out[i] = (EXPR);                                                   \
    }                                                                      \
}

// Fallback activations (new buffer, not in place).
UNARY(leakyrelu_f32, float, x > 0.0f ? x : 0.01f * x)
UNARY(leakyrelu_f64, double, x > 0.0 ? x : 0.01 * x)
UNARY(elu_f32, float, x > 0.0f ? x : expf(x) - 1.0f)
UNARY(elu_f64, double, x > 0.0 ? x : exp(x) - 1.0)
UNARY(softplus_f32, float, log1pf(expf(x)))
UNARY(softplus_f64, double, log1p(exp(x)))

// Activation derivatives, evaluated at the pre-activation in place.
UNARY_INPLACE(sigmoid_grad_f32, float, (1.0f / (1.0f + expf(-x))) * (1.0f - 1.0f / (1.0f + expf(-x))))
UNARY_INPLACE(sigmoid_grad_f64, double, (1.0 / (1.0 + exp(-x))) * (1.0 - 1.0 / (1.0 + exp(-x))))
UNARY_INPLACE(relu_grad_f32, float, x > 0.0f ? 1.0f : 0.0f)
UNARY_INPLACE(relu_grad_f64, double, x > 0.0 ? 1.0 : 0.0)
UNARY_INPLACE(tanh_grad_f32, float, 1.0f - tanhf(x) * tanhf(x))
UNARY_INPLACE(tanh_grad_f64, double, 1.0 - tanh(x) * tanh(x))
UNARY_INPLACE(leakyrelu_grad_f32, float, x > 0.0f ? 1.0f : 0.01f)
UNARY_INPLACE(leakyrelu_grad_f64, double, x > 0.0 ? 1.0 : 0.01)
UNARY_INPLACE(elu_grad_f32, float, x > 0.0f ? 1.0f : expf(x))
UNARY_INPLACE(elu_grad_f64, double, x > 0.0 ? 1.0 : exp(x))
UNARY_INPLACE(softplus_grad_f32, float, 1.0f / (1.0f + expf(-x)))
UNARY_INPLACE(softplus_grad_f64, double, 1.0 / (1.0 + exp(-x)))
// Applied to the channel softmax of the pre-activation, not to the
// pre-activation itself.
UNARY_INPLACE(softmax_grad_f32, float, x * (1.0f - x))
UNARY_INPLACE(softmax_grad_f64, double, x * (1.0 - x))
UNARY_INPLACE(logsoftmax_grad_f32, float, 1.0f - x)
UNARY_INPLACE(logsoftmax_grad_f64, double, 1.0 - x)

typedef unsigned long long u64;

#define STRIDED_INDEX(IDX, LINEAR, META)                                   \
    {                                                                      \
        const u64 ndim = (META)[1];                                        \
        const u64 *shape = (META) + 2;                                     \
        const u64 *strides = (META) + 2 + ndim;                            \
        u64 rem = (LINEAR);                                                \
        IDX = (META)[2 + 2 * ndim];                                        \
        for (long long d = (long long)ndim - 1; d >= 0; --d) {             \
            IDX += (rem % shape[d]) * strides[d];                          \
            rem /= shape[d];                                               \
        }                                                                  \
    }

#define MUL_STRIDED(NAME, TY)                                              \
extern "C" __global__ void NAME(TY *lhs, const TY *rhs,                    \
                                const u64 *meta) {                         \
    u64 i = blockIdx.x * blockDim.x + threadIdx.x;                         \
    if (i < meta[0]) {                                                     \
        u64 idx;                                                           \
        STRIDED_INDEX(idx, i, meta);                                       \
        lhs[i] = lhs[i] * rhs[idx];                                        \
    }                                                                      \
}

MUL_STRIDED(mul_f32, float)
MUL_STRIDED(mul_f64, double)

#define COPY_STRIDED(NAME, TY)                                             \
extern "C" __global__ void NAME(const TY *in, TY *out,                     \
                                const u64 *meta) {                         \
    u64 i = blockIdx.x * blockDim.x + threadIdx.x;                         \
    if (i < meta[0]) {                                                     \
        u64 idx;                                                           \
        STRIDED_INDEX(idx, i, meta);                                       \
        out[i] = in[idx];                                                  \
    }                                                                      \
}

COPY_STRIDED(copy_strided_f32, float)
COPY_STRIDED(copy_strided_f64, double)
"#;

/// Compiled-kernel cache: one NVRTC module per process, functions by name.
pub struct Kernels {
    module: RwLock<Option<Arc<CudaModule>>>,
    functions: RwLock<HashMap<String, CudaFunction>>,
}

impl Default for Kernels {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernels {
    pub fn new() -> Self {
        Self {
            module: RwLock::new(None),
            functions: RwLock::new(HashMap::new()),
        }
    }

    fn module(&self, context: &Arc<cudarc::driver::CudaContext>) -> CunnResult<Arc<CudaModule>> {
        {
            let module = self
                .module
                .read()
                .map_err(|e| CunnError::Execution(format!("kernel cache poisoned: {:?}", e)))?;
            if let Some(module) = module.as_ref() {
                return Ok(module.clone());
            }
        }

        let ptx = compile_ptx(SRC)
            .map_err(|e| CunnError::Execution(format!("NVRTC compilation failed: {:?}", e)))?;
        let module = context
            .load_module(ptx)
            .map_err(|e| CunnError::Execution(format!("failed to load kernel module: {:?}", e)))?;

        let mut slot = self
            .module
            .write()
            .map_err(|e| CunnError::Execution(format!("kernel cache poisoned: {:?}", e)))?;
        // Another thread may have won the race; either module is fine.
        let module = slot.get_or_insert(module).clone();
        Ok(module)
    }

    pub fn load_function(
        &self,
        context: &Arc<cudarc::driver::CudaContext>,
        name: &str,
    ) -> CunnResult<CudaFunction> {
        {
            let functions = self
                .functions
                .read()
                .map_err(|e| CunnError::Execution(format!("kernel cache poisoned: {:?}", e)))?;
            if let Some(func) = functions.get(name) {
                return Ok(func.clone());
            }
        }

        let module = self.module(context)?;
        let func = module
            .load_function(name)
            .map_err(|e| CunnError::Execution(format!("no kernel named {}: {:?}", name, e)))?;

        let mut functions = self
            .functions
            .write()
            .map_err(|e| CunnError::Execution(format!("kernel cache poisoned: {:?}", e)))?;
        functions.insert(name.to_string(), func.clone());
        Ok(func)
    }
}

fn kernel_name(op: &str, dtype: DType) -> String {
    format!("{}_{}", op, dtype)
}

fn launch_cfg(num_els: usize) -> LaunchConfig {
    let block_size = 256u32;
    let grid_size = ((num_els as u32 + block_size - 1) / block_size).max(1);
    LaunchConfig {
        grid_dim: (grid_size, 1, 1),
        block_dim: (block_size, 1, 1),
        shared_mem_bytes: 0,
    }
}

fn strided_metadata(layout: &Layout) -> Vec<usize> {
    let mut meta = Vec::with_capacity(3 + 2 * layout.ndim());
    meta.push(layout.size());
    meta.push(layout.ndim());
    meta.extend_from_slice(layout.shape());
    meta.extend_from_slice(layout.strides());
    meta.push(layout.offset());
    meta
}

fn require_dense(tensor: &DeviceTensor, what: &str) -> CunnResult<()> {
    if tensor.layout().is_contiguous() && tensor.layout().offset() == 0 {
        Ok(())
    } else {
        Err(CunnError::Input(format!(
            "{} must be dense, got layout {:?}",
            what,
            tensor.layout()
        )))
    }
}

/// Apply `op` elementwise in place on a dense tensor.
pub(crate) fn unary_inplace(tensor: &mut DeviceTensor, op: &str) -> CunnResult<()> {
    require_dense(tensor, "elementwise operand")?;
    let device = tensor.device.clone();
    let func = device
        .kernels()
        .load_function(device.context(), &kernel_name(op, tensor.dtype()))?;
    let n = tensor.layout.size() as u32;
    let cfg = launch_cfg(n as usize);
    let stream = device.stream();

    let mut builder = stream.launch_builder(&func);
    match &mut tensor.data {
        Data::F32(buf) => builder.arg(buf),
        Data::F64(buf) => builder.arg(buf),
    };
    builder.arg(&n);
    unsafe { builder.launch(cfg) }
        .map_err(|e| CunnError::Execution(format!("failed to launch {}: {:?}", op, e)))?;
    Ok(())
}

/// Apply `op` elementwise from a dense tensor into a new buffer.
pub(crate) fn unary(src: &DeviceTensor, op: &str) -> CunnResult<DeviceTensor> {
    require_dense(src, "elementwise operand")?;
    let device = src.device.clone();
    let func = device
        .kernels()
        .load_function(device.context(), &kernel_name(op, src.dtype()))?;
    let mut out = DeviceTensor::uninit(&device, src.layout.shape(), src.dtype())?;
    let n = src.layout.size() as u32;
    let cfg = launch_cfg(n as usize);
    let stream = device.stream();

    {
        let mut builder = stream.launch_builder(&func);
        match (&src.data, &mut out.data) {
            (Data::F32(i), Data::F32(o)) => builder.arg(i).arg(o),
            (Data::F64(i), Data::F64(o)) => builder.arg(i).arg(o),
            _ => unreachable!(),
        };
        builder.arg(&n);
        unsafe { builder.launch(cfg) }
            .map_err(|e| CunnError::Execution(format!("failed to launch {}: {:?}", op, e)))?;
    }
    Ok(out)
}

/// `lhs *= rhs` elementwise. `lhs` must be dense; `rhs` may be strided.
pub(crate) fn mul_inplace(lhs: &mut DeviceTensor, rhs: &DeviceTensor) -> CunnResult<()> {
    require_dense(lhs, "multiply destination")?;
    if lhs.layout.shape() != rhs.layout.shape() {
        return Err(CunnError::Input(format!(
            "elementwise multiply shape mismatch: {:?} vs {:?}",
            lhs.layout.shape(),
            rhs.layout.shape()
        )));
    }
    if lhs.dtype() != rhs.dtype() {
        return Err(CunnError::Input(format!(
            "elementwise multiply dtype mismatch: {} vs {}",
            lhs.dtype(),
            rhs.dtype()
        )));
    }

    let device = lhs.device.clone();
    let func = device
        .kernels()
        .load_function(device.context(), &kernel_name("mul", lhs.dtype()))?;
    let cfg = launch_cfg(lhs.layout.size());
    let stream = device.stream();
    let meta = stream
        .memcpy_stod(&strided_metadata(rhs.layout()))
        .map_err(|e| CunnError::Allocation(format!("failed to copy kernel metadata: {:?}", e)))?;

    let mut builder = stream.launch_builder(&func);
    match (&mut lhs.data, &rhs.data) {
        (Data::F32(l), Data::F32(r)) => builder.arg(l).arg(r),
        (Data::F64(l), Data::F64(r)) => builder.arg(l).arg(r),
        _ => unreachable!(),
    };
    builder.arg(&meta);
    unsafe { builder.launch(cfg) }
        .map_err(|e| CunnError::Execution(format!("failed to launch mul: {:?}", e)))?;
    Ok(())
}

/// Gather a (possibly strided) tensor into a new dense row-major buffer.
pub(crate) fn copy_strided(src: &DeviceTensor) -> CunnResult<DeviceTensor> {
    let device = src.device.clone();
    let func = device
        .kernels()
        .load_function(device.context(), &kernel_name("copy_strided", src.dtype()))?;
    let mut out = DeviceTensor::uninit(&device, src.layout.shape(), src.dtype())?;
    let cfg = launch_cfg(src.layout.size());
    let stream = device.stream();
    let meta = stream
        .memcpy_stod(&strided_metadata(src.layout()))
        .map_err(|e| CunnError::Allocation(format!("failed to copy kernel metadata: {:?}", e)))?;

    {
        let mut builder = stream.launch_builder(&func);
        match (&src.data, &mut out.data) {
            (Data::F32(i), Data::F32(o)) => builder.arg(i).arg(o),
            (Data::F64(i), Data::F64(o)) => builder.arg(i).arg(o),
            _ => unreachable!(),
        };
        builder.arg(&meta);
        unsafe { builder.launch(cfg) }
            .map_err(|e| CunnError::Execution(format!("failed to launch copy_strided: {:?}", e)))?;
    }
    Ok(out)
}
