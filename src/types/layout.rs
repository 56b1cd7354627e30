/// Shape, strides and offset of a tensor, in elements.
///
/// Strides are arbitrary: a layout may describe a non-contiguous view. Dense
/// allocations use row-major (C-order) strides.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Layout {
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    pub fn new(shape: &[usize], strides: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            strides: strides.to_vec(),
            offset: 0,
        }
    }

    /// Dense row-major layout for the given shape.
    pub fn from_shape(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            strides: Self::compute_strides(shape),
            offset: 0,
        }
    }

    /// The same view shifted to start `offset` elements into the buffer.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_contiguous(&self) -> bool {
        if self.ndim() == 0 {
            return true;
        }

        let mut expected = 1;
        for i in (0..self.ndim()).rev() {
            if self.strides[i] != expected {
                return false;
            }
            expected *= self.shape[i];
        }

        true
    }

    /// Whether strides are non-increasing from the outermost dimension in.
    ///
    /// cuDNN's backward filter/data path rejects tensors that violate this
    /// order; such tensors must be densified first.
    pub fn is_stride_descending(&self) -> bool {
        self.strides.windows(2).all(|w| w[0] >= w[1])
    }

    /// The shape as a 4-element array, for NCHW descriptor calls.
    pub fn dims4(&self) -> Option<[usize; 4]> {
        match self.shape.as_slice() {
            &[n, c, h, w] => Some([n, c, h, w]),
            _ => None,
        }
    }

    /// The strides as a 4-element array, for NCHW descriptor calls.
    pub fn strides4(&self) -> Option<[usize; 4]> {
        match self.strides.as_slice() {
            &[n, c, h, w] => Some([n, c, h, w]),
            _ => None,
        }
    }

    pub(crate) fn compute_strides(shape: &[usize]) -> Vec<usize> {
        if shape.is_empty() {
            return vec![];
        }

        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len() - 1).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }
}
