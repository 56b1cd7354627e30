//! The convolution layer engine: forward pre-activation, activation and the
//! full backward pass, all through cuDNN with the elementwise kernels filling
//! the gaps cuDNN does not cover.

use std::ffi::c_void;
use std::sync::Arc;

use cudarc::cudnn::sys;

use crate::activation::Activation;
use crate::cuda::algo;
use crate::cuda::context::{cudnn_check, CudnnContext};
use crate::cuda::descriptors;
use crate::cuda::device::CudaDevice;
use crate::cuda::kernels;
use crate::cuda::storage::DeviceTensor;
use crate::cuda::sync::PreparedAction;
use crate::cuda::workspace::Workspace;
use crate::error::{CunnError, CunnResult};
use crate::types::{Conv2dConfig, DType};

const ONE_F32: f32 = 1.0;
const ZERO_F32: f32 = 0.0;
const ONE_F64: f64 = 1.0;
const ZERO_F64: f64 = 0.0;

// cuDNN reads alpha/beta through void pointers typed by the descriptor dtype,
// so the scalar's width has to match the tensor's.
fn scalar_one(dtype: DType) -> *const c_void {
    match dtype {
        DType::F32 => &ONE_F32 as *const f32 as *const c_void,
        DType::F64 => &ONE_F64 as *const f64 as *const c_void,
    }
}

fn scalar_zero(dtype: DType) -> *const c_void {
    match dtype {
        DType::F32 => &ZERO_F32 as *const f32 as *const c_void,
        DType::F64 => &ZERO_F64 as *const f64 as *const c_void,
    }
}

/// Borrowed weight and bias for one call. Weight is
/// `[out_channels, in_channels, kernel_h, kernel_w]`, bias holds
/// `out_channels` elements.
pub struct Conv2dParams<'a> {
    pub weight: &'a DeviceTensor,
    pub bias: &'a DeviceTensor,
}

/// Destinations for the backward pass, shaped like their parameters.
pub struct GradientViews<'a> {
    pub weight: &'a mut DeviceTensor,
    pub bias: &'a mut DeviceTensor,
}

/// The loss gradient with respect to the pre-activation.
///
/// An identity activation passes the incoming gradient straight through
/// without copying; every other activation owns a freshly computed buffer.
pub enum Delta<'a> {
    Borrowed(&'a DeviceTensor),
    Owned(DeviceTensor),
}

impl<'a> Delta<'a> {
    pub fn tensor(&self) -> &DeviceTensor {
        match self {
            Delta::Borrowed(t) => t,
            Delta::Owned(t) => t,
        }
    }
}

/// A 2-D convolution layer bound to one device.
///
/// Holds the cuDNN context whose descriptors every call reconfigures, the
/// layer configuration and the last input seen by `set_input`. Not for
/// concurrent use; see the module docs.
pub struct Conv2dLayer {
    device: Arc<CudaDevice>,
    ctx: CudnnContext,
    cfg: Conv2dConfig,
    activation: Activation,
    dtype: DType,
    input: Option<DeviceTensor>,
}

fn dims_strides4(t: &DeviceTensor, what: &str) -> CunnResult<([usize; 4], [usize; 4])> {
    match (t.layout().dims4(), t.layout().strides4()) {
        (Some(dims), Some(strides)) => Ok((dims, strides)),
        _ => Err(CunnError::Input(format!(
            "{} must be 4-d, got shape {:?}",
            what,
            t.layout().shape()
        ))),
    }
}

impl Conv2dLayer {
    pub fn new(
        device: &Arc<CudaDevice>,
        cfg: Conv2dConfig,
        activation: Activation,
        dtype: DType,
    ) -> CunnResult<Self> {
        Ok(Self {
            device: device.clone(),
            ctx: CudnnContext::new(device)?,
            cfg,
            activation,
            dtype,
            input: None,
        })
    }

    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    pub fn config(&self) -> &Conv2dConfig {
        &self.cfg
    }

    pub fn activation(&self) -> &Activation {
        &self.activation
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn input(&self) -> Option<&DeviceTensor> {
        self.input.as_ref()
    }

    /// A functionally identical layer with its own cuDNN context. The stored
    /// input is not carried over.
    pub fn try_clone(&self) -> CunnResult<Self> {
        Ok(Self {
            device: self.device.clone(),
            ctx: self.ctx.try_clone()?,
            cfg: self.cfg.clone(),
            activation: self.activation.clone(),
            dtype: self.dtype,
            input: None,
        })
    }

    /// Store the input for the next forward or backward call.
    pub fn set_input(&mut self, input: DeviceTensor) -> CunnResult<()> {
        if input.dtype() != self.dtype {
            return Err(CunnError::Input(format!(
                "layer is {}, input is {}",
                self.dtype,
                input.dtype()
            )));
        }
        dims_strides4(&input, "input")?;
        self.input = Some(input);
        Ok(())
    }

    pub fn clear_input(&mut self) {
        self.input = None;
    }

    fn input_ref(&self) -> CunnResult<&DeviceTensor> {
        self.input
            .as_ref()
            .ok_or_else(|| CunnError::Input("no input set on layer".to_string()))
    }

    fn check_params(&self, params: &Conv2dParams<'_>, in_channels: usize) -> CunnResult<[usize; 4]> {
        let (w_dims, _) = dims_strides4(params.weight, "weight")?;
        if w_dims[1] != in_channels {
            return Err(CunnError::Input(format!(
                "weight expects {} input channels, input has {}",
                w_dims[1], in_channels
            )));
        }
        if [w_dims[2], w_dims[3]] != self.cfg.kernel {
            return Err(CunnError::Input(format!(
                "weight kernel [{}, {}] does not match configured {:?}",
                w_dims[2], w_dims[3], self.cfg.kernel
            )));
        }
        if params.weight.dtype() != self.dtype || params.bias.dtype() != self.dtype {
            return Err(CunnError::Input(format!(
                "parameters must be {}, got weight {} / bias {}",
                self.dtype,
                params.weight.dtype(),
                params.bias.dtype()
            )));
        }
        if params.bias.layout().size() != w_dims[0] {
            return Err(CunnError::Input(format!(
                "bias has {} elements, weight has {} output channels",
                params.bias.layout().size(),
                w_dims[0]
            )));
        }
        Ok(w_dims)
    }

    /// Pre-activation forward pass: convolution plus broadcast bias, into a
    /// fresh dense buffer whose shape comes from the backend's output-dim
    /// query.
    pub fn pre_output(&mut self, params: &Conv2dParams<'_>) -> CunnResult<DeviceTensor> {
        let input = self.input_ref()?;
        let (src_dims, src_strides) = dims_strides4(input, "input")?;
        let w_dims = self.check_params(params, src_dims[1])?;
        // Host-side shape check first, for an error that names the geometry.
        self.cfg.output_shape(&src_dims, w_dims[0])?;

        descriptors::set_tensor4d_ex(self.ctx.src_desc, self.dtype, src_dims, src_strides)?;
        descriptors::set_filter4d(self.ctx.filter_desc, self.dtype, w_dims)?;
        descriptors::set_conv2d(self.ctx.conv_desc, self.cfg.padding, self.cfg.stride, self.dtype)?;

        let out_dims =
            descriptors::forward_output_dim(self.ctx.conv_desc, self.ctx.src_desc, self.ctx.filter_desc)?;
        let mut z = DeviceTensor::uninit(&self.device, &out_dims, self.dtype)?;
        let (z_dims, z_strides) = dims_strides4(&z, "pre-activation")?;
        descriptors::set_tensor4d_ex(self.ctx.dst_desc, self.dtype, z_dims, z_strides)?;

        let algo = algo::forward_algo(
            self.ctx.handle(),
            self.ctx.src_desc,
            self.ctx.filter_desc,
            self.ctx.conv_desc,
            self.ctx.dst_desc,
        )?;
        let (mut workspace, ws_bytes) = Workspace::for_forward(
            &self.device,
            self.ctx.handle(),
            self.ctx.src_desc,
            self.ctx.filter_desc,
            self.ctx.conv_desc,
            self.ctx.dst_desc,
            algo,
        )?;
        descriptors::set_bias(self.ctx.bias_desc, self.dtype, w_dims[0])?;

        let one = scalar_one(self.dtype);
        let zero = scalar_zero(self.dtype);
        let mut action = PreparedAction::prepare();
        let src_ptr = action.read(input);
        let w_ptr = action.read(params.weight);
        let b_ptr = action.read(params.bias);
        let z_ptr = action.write(&mut z);
        let (ws_ptr, _ws_guard) = workspace.ptr();

        let status = unsafe {
            sys::cudnnConvolutionForward(
                self.ctx.handle(),
                one,
                self.ctx.src_desc,
                src_ptr,
                self.ctx.filter_desc,
                w_ptr,
                self.ctx.conv_desc,
                algo,
                ws_ptr,
                ws_bytes,
                zero,
                self.ctx.dst_desc,
                z_ptr,
            )
        };
        cudnn_check(status, "cudnnConvolutionForward").map_err(CunnError::Execution)?;

        let status = unsafe {
            sys::cudnnAddTensor(
                self.ctx.handle(),
                one,
                self.ctx.bias_desc,
                b_ptr,
                one,
                self.ctx.dst_desc,
                z_ptr,
            )
        };
        cudnn_check(status, "cudnnAddTensor").map_err(CunnError::Execution)?;
        action.register();

        Ok(z)
    }

    /// Full forward pass: `pre_output` followed by the layer activation.
    pub fn activate(&mut self, params: &Conv2dParams<'_>) -> CunnResult<DeviceTensor> {
        let z = self.pre_output(params)?;
        self.apply_activation(z)
    }

    /// Apply the layer activation to a dense pre-activation buffer.
    ///
    /// The closed set of cuDNN-backed activations runs in place; anything
    /// else goes through an elementwise fallback kernel into a new buffer.
    pub fn apply_activation(&mut self, mut z: DeviceTensor) -> CunnResult<DeviceTensor> {
        match &self.activation {
            Activation::Identity => Ok(z),
            Activation::Sigmoid => {
                self.cudnn_activation(&mut z, sys::cudnnActivationMode_t::CUDNN_ACTIVATION_SIGMOID)?;
                Ok(z)
            }
            Activation::Relu => {
                self.cudnn_activation(&mut z, sys::cudnnActivationMode_t::CUDNN_ACTIVATION_RELU)?;
                Ok(z)
            }
            Activation::Tanh => {
                self.cudnn_activation(&mut z, sys::cudnnActivationMode_t::CUDNN_ACTIVATION_TANH)?;
                Ok(z)
            }
            Activation::Softmax => {
                self.cudnn_softmax(&mut z, sys::cudnnSoftmaxAlgorithm_t::CUDNN_SOFTMAX_ACCURATE)?;
                Ok(z)
            }
            Activation::LogSoftmax => {
                self.cudnn_softmax(&mut z, sys::cudnnSoftmaxAlgorithm_t::CUDNN_SOFTMAX_LOG)?;
                Ok(z)
            }
            Activation::Named(name) => match fallback_kernel(name) {
                Some(op) => {
                    log::debug!("activation {} has no cuDNN mode, using fallback kernel", name);
                    kernels::unary(&z, op)
                }
                None => Err(CunnError::Execution(format!(
                    "unsupported activation: {}",
                    name
                ))),
            },
        }
    }

    fn cudnn_activation(
        &mut self,
        z: &mut DeviceTensor,
        mode: sys::cudnnActivationMode_t,
    ) -> CunnResult<()> {
        let (dims, strides) = dims_strides4(z, "activation input")?;
        descriptors::set_tensor4d_ex(self.ctx.dst_desc, self.dtype, dims, strides)?;
        descriptors::set_activation(self.ctx.activation_desc, mode)?;

        let one = scalar_one(self.dtype);
        let zero = scalar_zero(self.dtype);
        let mut action = PreparedAction::prepare();
        let z_ptr = action.write(z);
        let status = unsafe {
            sys::cudnnActivationForward(
                self.ctx.handle(),
                self.ctx.activation_desc,
                one,
                self.ctx.dst_desc,
                z_ptr as *const c_void,
                zero,
                self.ctx.dst_desc,
                z_ptr,
            )
        };
        cudnn_check(status, "cudnnActivationForward").map_err(CunnError::Execution)?;
        action.register();
        Ok(())
    }

    // Channel-mode softmax, in place.
    fn cudnn_softmax(
        &mut self,
        z: &mut DeviceTensor,
        algorithm: sys::cudnnSoftmaxAlgorithm_t,
    ) -> CunnResult<()> {
        let (dims, strides) = dims_strides4(z, "softmax input")?;
        descriptors::set_tensor4d_ex(self.ctx.dst_desc, self.dtype, dims, strides)?;

        let one = scalar_one(self.dtype);
        let zero = scalar_zero(self.dtype);
        let mut action = PreparedAction::prepare();
        let z_ptr = action.write(z);
        let status = unsafe {
            sys::cudnnSoftmaxForward(
                self.ctx.handle(),
                algorithm,
                sys::cudnnSoftmaxMode_t::CUDNN_SOFTMAX_MODE_CHANNEL,
                one,
                self.ctx.dst_desc,
                z_ptr as *const c_void,
                zero,
                self.ctx.dst_desc,
                z_ptr,
            )
        };
        cudnn_check(status, "cudnnSoftmaxForward").map_err(CunnError::Execution)?;
        action.register();
        Ok(())
    }

    /// Gradient with respect to the pre-activation.
    ///
    /// Identity aliases the incoming gradient without a copy. Every other
    /// activation evaluates its derivative at `z` into a dense buffer and
    /// multiplies the incoming gradient in elementwise.
    pub fn compute_delta<'e>(
        &mut self,
        z: &DeviceTensor,
        epsilon: &'e DeviceTensor,
    ) -> CunnResult<Delta<'e>> {
        if epsilon.layout().shape() != z.layout().shape() {
            return Err(CunnError::Input(format!(
                "gradient shape {:?} does not match pre-activation {:?}",
                epsilon.layout().shape(),
                z.layout().shape()
            )));
        }
        if epsilon.dtype() != self.dtype {
            return Err(CunnError::Input(format!(
                "layer is {}, gradient is {}",
                self.dtype,
                epsilon.dtype()
            )));
        }
        if self.activation.is_identity() {
            return Ok(Delta::Borrowed(epsilon));
        }

        let mut d = z.dup_dense()?;
        match &self.activation {
            Activation::Identity => unreachable!(),
            Activation::Sigmoid => kernels::unary_inplace(&mut d, "sigmoid_grad")?,
            Activation::Relu => kernels::unary_inplace(&mut d, "relu_grad")?,
            Activation::Tanh => kernels::unary_inplace(&mut d, "tanh_grad")?,
            Activation::Softmax => {
                // d/dx softmax = y * (1 - y) elementwise on the channel softmax.
                self.cudnn_softmax(&mut d, sys::cudnnSoftmaxAlgorithm_t::CUDNN_SOFTMAX_ACCURATE)?;
                kernels::unary_inplace(&mut d, "softmax_grad")?;
            }
            Activation::LogSoftmax => {
                // d/dx logsoftmax = 1 - softmax(x).
                self.cudnn_softmax(&mut d, sys::cudnnSoftmaxAlgorithm_t::CUDNN_SOFTMAX_ACCURATE)?;
                kernels::unary_inplace(&mut d, "logsoftmax_grad")?;
            }
            Activation::Named(name) => match derivative_kernel(name) {
                Some(op) => kernels::unary_inplace(&mut d, op)?,
                None => {
                    return Err(CunnError::Execution(format!(
                        "unsupported activation: {}",
                        name
                    )))
                }
            },
        }
        kernels::mul_inplace(&mut d, epsilon)?;
        Ok(Delta::Owned(d))
    }

    /// Backward pass. Folds the activation derivative into the incoming
    /// gradient, then runs the bias, filter and data gradient kernels. The
    /// pre-activation is recomputed from the stored input only when the
    /// activation needs a derivative; identity aliases the incoming gradient
    /// without a forward pass. The data gradient is always computed and
    /// returned, whether or not an earlier layer wants it.
    pub fn backprop_gradient(
        &mut self,
        epsilon: &DeviceTensor,
        params: &Conv2dParams<'_>,
        grads: GradientViews<'_>,
    ) -> CunnResult<DeviceTensor> {
        let delta = if self.activation.is_identity() {
            if epsilon.dtype() != self.dtype {
                return Err(CunnError::Input(format!(
                    "layer is {}, gradient is {}",
                    self.dtype,
                    epsilon.dtype()
                )));
            }
            let (src_dims, _) = dims_strides4(self.input_ref()?, "input")?;
            let (w_dims, _) = dims_strides4(params.weight, "weight")?;
            let expected = self.cfg.output_shape(&src_dims, w_dims[0])?;
            if epsilon.layout().shape() != &expected[..] {
                return Err(CunnError::Input(format!(
                    "gradient shape {:?} does not match output shape {:?}",
                    epsilon.layout().shape(),
                    expected
                )));
            }
            Delta::Borrowed(epsilon)
        } else {
            let z = self.pre_output(params)?;
            self.compute_delta(&z, epsilon)?
        };
        // cuDNN wants the gradient in row-major descending-stride form.
        let delta = match delta {
            Delta::Borrowed(t) if !t.layout().is_stride_descending() => Delta::Owned(t.dup_dense()?),
            Delta::Owned(t) if !t.layout().is_stride_descending() => Delta::Owned(t.dup_dense()?),
            other => other,
        };
        let delta_ref = delta.tensor();

        let input = self.input_ref()?;
        let (src_dims, src_strides) = dims_strides4(input, "input")?;
        let w_dims = dims_strides4(params.weight, "weight")?.0;
        let (d_dims, d_strides) = dims_strides4(delta_ref, "delta")?;
        let (g_dims, _) = dims_strides4(grads.weight, "weight gradient")?;
        if g_dims != w_dims {
            return Err(CunnError::Input(format!(
                "weight gradient shape {:?} does not match weight {:?}",
                g_dims, w_dims
            )));
        }
        if grads.bias.layout().size() != w_dims[0] {
            return Err(CunnError::Input(format!(
                "bias gradient has {} elements, weight has {} output channels",
                grads.bias.layout().size(),
                w_dims[0]
            )));
        }

        descriptors::set_tensor4d_ex(self.ctx.src_desc, self.dtype, src_dims, src_strides)?;
        descriptors::set_tensor4d_ex(self.ctx.delta_desc, self.dtype, d_dims, d_strides)?;
        descriptors::set_filter4d(self.ctx.filter_desc, self.dtype, w_dims)?;
        descriptors::set_conv2d(self.ctx.conv_desc, self.cfg.padding, self.cfg.stride, self.dtype)?;
        descriptors::set_bias(self.ctx.bias_desc, self.dtype, w_dims[0])?;

        let mut eps_next = DeviceTensor::uninit(&self.device, &src_dims, self.dtype)?;
        let (e_dims, e_strides) = dims_strides4(&eps_next, "input gradient")?;
        descriptors::set_tensor4d_ex(self.ctx.dst_desc, self.dtype, e_dims, e_strides)?;

        let filter_algo = algo::backward_filter_algo(
            self.ctx.handle(),
            self.ctx.src_desc,
            self.ctx.delta_desc,
            self.ctx.conv_desc,
            self.ctx.filter_desc,
        )?;
        let data_algo = algo::backward_data_algo_from_filter(filter_algo);
        let (mut workspace, filter_bytes, data_bytes) = Workspace::for_backward(
            &self.device,
            self.ctx.handle(),
            self.ctx.src_desc,
            self.ctx.delta_desc,
            self.ctx.conv_desc,
            self.ctx.filter_desc,
            self.ctx.dst_desc,
            filter_algo,
            data_algo,
        )?;

        let one = scalar_one(self.dtype);
        let zero = scalar_zero(self.dtype);
        let mut action = PreparedAction::prepare();
        let src_ptr = action.read(input);
        let w_ptr = action.read(params.weight);
        let d_ptr = action.read(delta_ref);
        let wgrad_ptr = action.write(grads.weight);
        let bgrad_ptr = action.write(grads.bias);
        let eps_ptr = action.write(&mut eps_next);
        let (ws_ptr, _ws_guard) = workspace.ptr();

        let status = unsafe {
            sys::cudnnConvolutionBackwardBias(
                self.ctx.handle(),
                one,
                self.ctx.delta_desc,
                d_ptr,
                zero,
                self.ctx.bias_desc,
                bgrad_ptr,
            )
        };
        cudnn_check(status, "cudnnConvolutionBackwardBias").map_err(CunnError::Execution)?;

        let status = unsafe {
            sys::cudnnConvolutionBackwardFilter(
                self.ctx.handle(),
                one,
                self.ctx.src_desc,
                src_ptr,
                self.ctx.delta_desc,
                d_ptr,
                self.ctx.conv_desc,
                filter_algo,
                ws_ptr,
                filter_bytes,
                zero,
                self.ctx.filter_desc,
                wgrad_ptr,
            )
        };
        cudnn_check(status, "cudnnConvolutionBackwardFilter").map_err(CunnError::Execution)?;

        let status = unsafe {
            sys::cudnnConvolutionBackwardData(
                self.ctx.handle(),
                one,
                self.ctx.filter_desc,
                w_ptr,
                self.ctx.delta_desc,
                d_ptr,
                self.ctx.conv_desc,
                data_algo,
                ws_ptr,
                data_bytes,
                zero,
                self.ctx.dst_desc,
                eps_ptr,
            )
        };
        cudnn_check(status, "cudnnConvolutionBackwardData").map_err(CunnError::Execution)?;
        action.register();

        Ok(eps_next)
    }
}

fn fallback_kernel(name: &str) -> Option<&'static str> {
    match name {
        "leakyrelu" => Some("leakyrelu"),
        "elu" => Some("elu"),
        "softplus" => Some("softplus"),
        _ => None,
    }
}

fn derivative_kernel(name: &str) -> Option<&'static str> {
    match name {
        "leakyrelu" => Some("leakyrelu_grad"),
        "elu" => Some("elu_grad"),
        "softplus" => Some("softplus_grad"),
        _ => None,
    }
}
