#![cfg(feature = "cuda")]

use cunn::cuda::{Conv2dLayer, Conv2dParams, CudaDevice, Delta, DeviceTensor, GradientViews};
use cunn::{Activation, Conv2dConfig, CunnError, DType};

fn approx(values: Vec<f32>, digits: i32) -> Vec<f32> {
    let b = 10f32.powi(digits);
    values.iter().map(|t| f32::round(t * b) / b).collect()
}

fn layer(kernel: [usize; 2], activation: Activation) -> Conv2dLayer {
    let device = CudaDevice::global().unwrap();
    let cfg = Conv2dConfig::new(kernel, [1, 1], [0, 0]).unwrap();
    Conv2dLayer::new(&device, cfg, activation, DType::F32).unwrap()
}

#[test]
fn forward_zero_params_gives_zero_output() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([3, 3], Activation::Identity);

    let input = DeviceTensor::from_f32(&device, &vec![1.0; 2 * 3 * 5 * 5], &[2, 3, 5, 5]).unwrap();
    layer.set_input(input).unwrap();

    let weight = DeviceTensor::zeros(&device, &[8, 3, 3, 3], DType::F32).unwrap();
    let bias = DeviceTensor::zeros(&device, &[8], DType::F32).unwrap();
    let out = layer
        .activate(&Conv2dParams {
            weight: &weight,
            bias: &bias,
        })
        .unwrap();

    assert_eq!(out.layout().shape(), &[2, 8, 3, 3]);
    assert!(out.to_vec_f32().unwrap().iter().all(|&v| v == 0.0));
}

#[test]
fn forward_matches_hand_convolution() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([2, 2], Activation::Identity);

    let input = DeviceTensor::from_f32(
        &device,
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
        &[1, 1, 3, 3],
    )
    .unwrap();
    layer.set_input(input).unwrap();

    let weight = DeviceTensor::from_f32(&device, &[1.0; 4], &[1, 1, 2, 2]).unwrap();
    let bias = DeviceTensor::from_f32(&device, &[0.5], &[1]).unwrap();
    let out = layer
        .pre_output(&Conv2dParams {
            weight: &weight,
            bias: &bias,
        })
        .unwrap();

    assert_eq!(out.layout().shape(), &[1, 1, 2, 2]);
    assert_eq!(out.to_vec_f32().unwrap(), vec![12.5, 16.5, 24.5, 28.5]);
}

#[test]
fn relu_clamps_negative_preactivations() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([1, 1], Activation::Relu);

    let input = DeviceTensor::from_f32(&device, &[-2.0, -0.5, 0.0, 3.0], &[4, 1, 1, 1]).unwrap();
    layer.set_input(input).unwrap();

    let weight = DeviceTensor::from_f32(&device, &[1.0], &[1, 1, 1, 1]).unwrap();
    let bias = DeviceTensor::zeros(&device, &[1], DType::F32).unwrap();
    let out = layer
        .activate(&Conv2dParams {
            weight: &weight,
            bias: &bias,
        })
        .unwrap();

    assert_eq!(out.to_vec_f32().unwrap(), vec![0.0, 0.0, 0.0, 3.0]);
}

#[test]
fn fallback_activation_writes_a_new_buffer() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([1, 1], Activation::from_name("leakyrelu"));

    let z = DeviceTensor::from_f32(&device, &[-1.0, -0.5, 0.0, 2.0], &[4, 1, 1, 1]).unwrap();
    let z_addr = z.data_addr();
    let out = layer.apply_activation(z).unwrap();

    assert_ne!(out.data_addr(), z_addr);
    assert_eq!(
        approx(out.to_vec_f32().unwrap(), 4),
        vec![-0.01, -0.005, 0.0, 2.0]
    );
}

#[test]
fn unknown_activation_is_an_execution_error() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([1, 1], Activation::from_name("swish"));

    let z = DeviceTensor::zeros(&device, &[1, 1, 1, 1], DType::F32).unwrap();
    assert!(matches!(
        layer.apply_activation(z),
        Err(CunnError::Execution(_))
    ));
}

#[test]
fn missing_input_is_an_input_error() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([1, 1], Activation::Identity);

    let weight = DeviceTensor::zeros(&device, &[1, 1, 1, 1], DType::F32).unwrap();
    let bias = DeviceTensor::zeros(&device, &[1], DType::F32).unwrap();
    assert!(matches!(
        layer.pre_output(&Conv2dParams {
            weight: &weight,
            bias: &bias,
        }),
        Err(CunnError::Input(_))
    ));
}

#[test]
fn identity_delta_aliases_the_incoming_gradient() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([1, 1], Activation::Identity);

    let z = DeviceTensor::from_f32(&device, &[1.0, 2.0], &[2, 1, 1, 1]).unwrap();
    let eps = DeviceTensor::from_f32(&device, &[0.1, 0.2], &[2, 1, 1, 1]).unwrap();
    let delta = layer.compute_delta(&z, &eps).unwrap();

    assert!(matches!(delta, Delta::Borrowed(_)));
    assert_eq!(delta.tensor().data_addr(), eps.data_addr());
}

#[test]
fn sigmoid_delta_matches_host_derivative() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([1, 1], Activation::Sigmoid);

    let z_host = [-1.0f32, 0.0, 1.0, 2.0];
    let z = DeviceTensor::from_f32(&device, &z_host, &[4, 1, 1, 1]).unwrap();
    let eps = DeviceTensor::from_f32(&device, &[1.0, 1.0, 2.0, 0.5], &[4, 1, 1, 1]).unwrap();
    let delta = layer.compute_delta(&z, &eps).unwrap();
    assert!(matches!(delta, Delta::Owned(_)));

    let expected: Vec<f32> = z_host
        .iter()
        .zip([1.0f32, 1.0, 2.0, 0.5])
        .map(|(&x, e)| {
            let s = 1.0 / (1.0 + (-x).exp());
            s * (1.0 - s) * e
        })
        .collect();
    assert_eq!(
        approx(delta.tensor().to_vec_f32().unwrap(), 4),
        approx(expected, 4)
    );
}

#[test]
fn backward_identity_small_case() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([1, 1], Activation::Identity);

    let input = DeviceTensor::from_f32(&device, &[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]).unwrap();
    layer.set_input(input).unwrap();

    let weight = DeviceTensor::from_f32(&device, &[2.0], &[1, 1, 1, 1]).unwrap();
    let bias = DeviceTensor::zeros(&device, &[1], DType::F32).unwrap();
    let eps = DeviceTensor::from_f32(&device, &[1.0; 4], &[1, 1, 2, 2]).unwrap();

    let mut wgrad = DeviceTensor::zeros(&device, &[1, 1, 1, 1], DType::F32).unwrap();
    let mut bgrad = DeviceTensor::zeros(&device, &[1], DType::F32).unwrap();
    let eps_next = layer
        .backprop_gradient(
            &eps,
            &Conv2dParams {
                weight: &weight,
                bias: &bias,
            },
            GradientViews {
                weight: &mut wgrad,
                bias: &mut bgrad,
            },
        )
        .unwrap();

    // dL/dW = sum over positions of input * eps = 1+2+3+4
    assert_eq!(wgrad.to_vec_f32().unwrap(), vec![10.0]);
    // dL/db = sum of eps
    assert_eq!(bgrad.to_vec_f32().unwrap(), vec![4.0]);
    // dL/dx = weight * eps
    assert_eq!(eps_next.layout().shape(), &[1, 1, 2, 2]);
    assert_eq!(eps_next.to_vec_f32().unwrap(), vec![2.0; 4]);
}

#[test]
fn bias_gradient_sums_per_channel() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([1, 1], Activation::Identity);

    let input = DeviceTensor::zeros(&device, &[2, 3, 4, 4], DType::F32).unwrap();
    layer.set_input(input).unwrap();

    let weight = DeviceTensor::zeros(&device, &[3, 3, 1, 1], DType::F32).unwrap();
    let bias = DeviceTensor::zeros(&device, &[3], DType::F32).unwrap();
    let eps = DeviceTensor::from_f32(&device, &[1.0; 2 * 3 * 4 * 4], &[2, 3, 4, 4]).unwrap();

    let mut wgrad = DeviceTensor::zeros(&device, &[3, 3, 1, 1], DType::F32).unwrap();
    let mut bgrad = DeviceTensor::zeros(&device, &[3], DType::F32).unwrap();
    layer
        .backprop_gradient(
            &eps,
            &Conv2dParams {
                weight: &weight,
                bias: &bias,
            },
            GradientViews {
                weight: &mut wgrad,
                bias: &mut bgrad,
            },
        )
        .unwrap();

    // each channel collects batch * h * w ones
    assert_eq!(bgrad.to_vec_f32().unwrap(), vec![32.0, 32.0, 32.0]);
}

#[test]
fn descriptors_follow_batch_size_changes() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([3, 3], Activation::Identity);

    let weight = DeviceTensor::zeros(&device, &[4, 2, 3, 3], DType::F32).unwrap();
    let bias = DeviceTensor::from_f32(&device, &[1.0, 2.0, 3.0, 4.0], &[4]).unwrap();
    let params = Conv2dParams {
        weight: &weight,
        bias: &bias,
    };

    for batch in [1usize, 3, 2] {
        let input =
            DeviceTensor::from_f32(&device, &vec![0.5; batch * 2 * 6 * 6], &[batch, 2, 6, 6]).unwrap();
        layer.set_input(input).unwrap();
        let out = layer.pre_output(&params).unwrap();
        assert_eq!(out.layout().shape(), &[batch, 4, 4, 4]);

        // zero weights leave just the broadcast bias
        let host = out.to_vec_f32().unwrap();
        for (i, v) in host.iter().enumerate() {
            let channel = (i / 16) % 4;
            assert_eq!(*v, (channel + 1) as f32);
        }
    }
}

#[test]
fn offset_view_input_convolves_the_right_window() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([1, 1], Activation::Identity);

    // second half of an 8-element buffer, viewed as [1, 1, 2, 2]
    let mut input = DeviceTensor::from_f32(
        &device,
        &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
        &[8],
    )
    .unwrap();
    input
        .set_layout(cunn::Layout::new(&[1, 1, 2, 2], &[4, 4, 2, 1]).with_offset(4))
        .unwrap();
    layer.set_input(input).unwrap();

    let weight = DeviceTensor::from_f32(&device, &[1.0], &[1, 1, 1, 1]).unwrap();
    let bias = DeviceTensor::zeros(&device, &[1], DType::F32).unwrap();
    let out = layer
        .pre_output(&Conv2dParams {
            weight: &weight,
            bias: &bias,
        })
        .unwrap();

    assert_eq!(out.to_vec_f32().unwrap(), vec![4.0, 5.0, 6.0, 7.0]);
}

#[test]
fn identity_backward_rejects_mismatched_epsilon() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([1, 1], Activation::Identity);

    let input = DeviceTensor::from_f32(&device, &[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]).unwrap();
    layer.set_input(input).unwrap();

    let weight = DeviceTensor::from_f32(&device, &[1.0], &[1, 1, 1, 1]).unwrap();
    let bias = DeviceTensor::zeros(&device, &[1], DType::F32).unwrap();
    let eps = DeviceTensor::from_f32(&device, &[1.0], &[1, 1, 1, 1]).unwrap();

    let mut wgrad = DeviceTensor::zeros(&device, &[1, 1, 1, 1], DType::F32).unwrap();
    let mut bgrad = DeviceTensor::zeros(&device, &[1], DType::F32).unwrap();
    assert!(matches!(
        layer.backprop_gradient(
            &eps,
            &Conv2dParams {
                weight: &weight,
                bias: &bias,
            },
            GradientViews {
                weight: &mut wgrad,
                bias: &mut bgrad,
            },
        ),
        Err(CunnError::Input(_))
    ));
}

#[test]
fn strided_epsilon_matches_dense_backward() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([1, 1], Activation::Identity);

    let input = DeviceTensor::from_f32(&device, &[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]).unwrap();
    layer.set_input(input).unwrap();

    let weight = DeviceTensor::from_f32(&device, &[1.0, 0.5], &[2, 1, 1, 1]).unwrap();
    let bias = DeviceTensor::zeros(&device, &[2], DType::F32).unwrap();
    let params = Conv2dParams {
        weight: &weight,
        bias: &bias,
    };

    // epsilon over the [1, 2, 2, 2] output, once dense and once as a
    // channels-last view (with a leading pad) over the same logical values
    let eps_nchw = [1.0f32, 0.0, 2.0, 0.0, 0.0, 3.0, 0.0, 4.0];
    let dense = DeviceTensor::from_f32(&device, &eps_nchw, &[1, 2, 2, 2]).unwrap();

    let mut nhwc_buf = vec![9.0f32; 2];
    for h in 0..2 {
        for w in 0..2 {
            for c in 0..2 {
                nhwc_buf.push(eps_nchw[c * 4 + h * 2 + w]);
            }
        }
    }
    let mut strided = DeviceTensor::from_f32(&device, &nhwc_buf, &[10]).unwrap();
    strided
        .set_layout(cunn::Layout::new(&[1, 2, 2, 2], &[8, 1, 4, 2]).with_offset(2))
        .unwrap();
    assert!(!strided.layout().is_stride_descending());

    let mut run = |eps: &DeviceTensor| {
        let mut wgrad = DeviceTensor::zeros(&device, &[2, 1, 1, 1], DType::F32).unwrap();
        let mut bgrad = DeviceTensor::zeros(&device, &[2], DType::F32).unwrap();
        let eps_next = layer
            .backprop_gradient(
                eps,
                &params,
                GradientViews {
                    weight: &mut wgrad,
                    bias: &mut bgrad,
                },
            )
            .unwrap();
        (
            wgrad.to_vec_f32().unwrap(),
            bgrad.to_vec_f32().unwrap(),
            eps_next.to_vec_f32().unwrap(),
        )
    };

    let (wg_dense, bg_dense, en_dense) = run(&dense);
    let (wg_strided, bg_strided, en_strided) = run(&strided);
    assert_eq!(wg_strided, wg_dense);
    assert_eq!(bg_strided, bg_dense);
    assert_eq!(en_strided, en_dense);
}

#[test]
fn softmax_delta_matches_host_derivative() {
    let device = CudaDevice::global().unwrap();

    let z_host = [0.0f32, 1.0];
    let eps_host = [1.0f32, 2.0];
    let s1 = 1.0f32.exp() / (1.0 + 1.0f32.exp());
    let softmax = [1.0 - s1, s1];

    let z = DeviceTensor::from_f32(&device, &z_host, &[1, 2, 1, 1]).unwrap();
    let eps = DeviceTensor::from_f32(&device, &eps_host, &[1, 2, 1, 1]).unwrap();

    let mut soft_layer = layer([1, 1], Activation::Softmax);
    let delta = soft_layer.compute_delta(&z, &eps).unwrap();
    let expected: Vec<f32> = softmax
        .iter()
        .zip(eps_host)
        .map(|(&s, e)| s * (1.0 - s) * e)
        .collect();
    assert_eq!(
        approx(delta.tensor().to_vec_f32().unwrap(), 4),
        approx(expected, 4)
    );

    let mut log_layer = layer([1, 1], Activation::LogSoftmax);
    let delta = log_layer.compute_delta(&z, &eps).unwrap();
    let expected: Vec<f32> = softmax
        .iter()
        .zip(eps_host)
        .map(|(&s, e)| (1.0 - s) * e)
        .collect();
    assert_eq!(
        approx(delta.tensor().to_vec_f32().unwrap(), 4),
        approx(expected, 4)
    );
}

#[test]
fn bias_is_purely_additive() {
    let device = CudaDevice::global().unwrap();
    let mut layer = layer([2, 2], Activation::Identity);

    let host_input: Vec<f32> = (0..2 * 2 * 4 * 4).map(|i| (i as f32) * 0.25 - 3.0).collect();
    let input = DeviceTensor::from_f32(&device, &host_input, &[2, 2, 4, 4]).unwrap();
    layer.set_input(input).unwrap();

    let host_weight: Vec<f32> = (0..3 * 2 * 2 * 2).map(|i| ((i % 5) as f32) - 2.0).collect();
    let weight = DeviceTensor::from_f32(&device, &host_weight, &[3, 2, 2, 2]).unwrap();
    let zero_bias = DeviceTensor::zeros(&device, &[3], DType::F32).unwrap();
    let bias = DeviceTensor::from_f32(&device, &[1.5, -2.0, 0.25], &[3]).unwrap();

    let raw = layer
        .pre_output(&Conv2dParams {
            weight: &weight,
            bias: &zero_bias,
        })
        .unwrap()
        .to_vec_f32()
        .unwrap();
    let biased = layer
        .pre_output(&Conv2dParams {
            weight: &weight,
            bias: &bias,
        })
        .unwrap()
        .to_vec_f32()
        .unwrap();

    // subtracting the broadcast bias recovers the raw convolution
    let bias_host = [1.5f32, -2.0, 0.25];
    let diff: Vec<f32> = biased
        .iter()
        .enumerate()
        .map(|(i, v)| v - bias_host[(i / 9) % 3])
        .collect();
    assert_eq!(approx(diff, 4), approx(raw, 4));
}

#[test]
fn cloned_layer_runs_independently() {
    let device = CudaDevice::global().unwrap();
    let mut original = layer([1, 1], Activation::Identity);
    let mut copy = original.try_clone().unwrap();

    let weight = DeviceTensor::from_f32(&device, &[3.0], &[1, 1, 1, 1]).unwrap();
    let bias = DeviceTensor::zeros(&device, &[1], DType::F32).unwrap();
    let params = Conv2dParams {
        weight: &weight,
        bias: &bias,
    };

    let input = DeviceTensor::from_f32(&device, &[1.0, 2.0], &[2, 1, 1, 1]).unwrap();
    original.set_input(input).unwrap();
    assert_eq!(
        original.pre_output(&params).unwrap().to_vec_f32().unwrap(),
        vec![3.0, 6.0]
    );

    // the clone starts without a stored input
    assert!(copy.input().is_none());
    let input = DeviceTensor::from_f32(&device, &[4.0], &[1, 1, 1, 1]).unwrap();
    copy.set_input(input).unwrap();
    assert_eq!(
        copy.pre_output(&params).unwrap().to_vec_f32().unwrap(),
        vec![12.0]
    );
}

#[test]
fn strided_view_is_densified_by_dup() {
    let device = CudaDevice::global().unwrap();

    // view the last column of a 2x3 buffer: shape [2, 1], strides [3, 1], offset 2
    let mut t = DeviceTensor::from_f32(&device, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    t.set_layout(cunn::Layout::new(&[2, 1], &[3, 1]).with_offset(2))
        .unwrap();

    let dense = t.dup_dense().unwrap();
    assert!(dense.layout().is_contiguous());
    assert_eq!(dense.layout().offset(), 0);
    assert_eq!(dense.to_vec_f32().unwrap(), vec![3.0, 6.0]);
}
