use crate::error::{CunnError, CunnResult};

/// Spatial output size of a convolution along one axis.
///
/// Non-ceiling variant: `floor((in + 2*pad - kernel) / stride) + 1`. The
/// kernel must fit the padded input and the stride must be nonzero.
pub fn out_size(input: usize, kernel: usize, stride: usize, pad: usize) -> CunnResult<usize> {
    if stride == 0 {
        return Err(CunnError::Input(format!(
            "stride must be nonzero, got {}",
            stride
        )));
    }
    let padded = input + 2 * pad;
    match padded.checked_sub(kernel) {
        Some(span) => Ok(span / stride + 1),
        None => Err(CunnError::Input(format!(
            "kernel {} does not fit padded input {}",
            kernel, padded
        ))),
    }
}

/// Immutable per-layer convolution geometry. All pairs are (height, width).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
}

impl Conv2dConfig {
    pub fn new(kernel: [usize; 2], stride: [usize; 2], padding: [usize; 2]) -> CunnResult<Self> {
        if kernel[0] == 0 || kernel[1] == 0 {
            return Err(CunnError::Input(format!(
                "kernel size must be nonzero, got {:?}",
                kernel
            )));
        }
        if stride[0] == 0 || stride[1] == 0 {
            return Err(CunnError::Input(format!(
                "stride must be nonzero, got {:?}",
                stride
            )));
        }
        Ok(Self {
            kernel,
            stride,
            padding,
        })
    }

    /// Output shape [batch, out_channels, out_h, out_w] for an input of shape
    /// [batch, in_channels, in_h, in_w].
    pub fn output_shape(&self, input: &[usize], out_channels: usize) -> CunnResult<[usize; 4]> {
        let &[batch, _, in_h, in_w] = match input {
            dims @ &[_, _, _, _] => <&[usize; 4]>::try_from(dims).unwrap(),
            _ => {
                return Err(CunnError::Input(format!(
                    "conv2d input must be 4-d [batch, channels, h, w], got {:?}",
                    input
                )))
            }
        };

        if in_h + 2 * self.padding[0] < self.kernel[0] || in_w + 2 * self.padding[1] < self.kernel[1] {
            return Err(CunnError::Input(format!(
                "kernel {:?} does not fit padded input [{}, {}]",
                self.kernel,
                in_h + 2 * self.padding[0],
                in_w + 2 * self.padding[1]
            )));
        }

        let out_h = out_size(in_h, self.kernel[0], self.stride[0], self.padding[0])?;
        let out_w = out_size(in_w, self.kernel[1], self.stride[1], self.padding[1])?;
        Ok([batch, out_channels, out_h, out_w])
    }
}
