use std::fmt;

/// Activation applied after the forward convolution and bias-add.
///
/// The first five variants execute through cuDNN fused kernels, in place on
/// the pre-activation buffer. `Named` is the fallback branch: an elementwise
/// transform looked up by name, which produces a new buffer instead of
/// mutating the input. Callers must not assume the activated tensor aliases
/// the pre-activation tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Sigmoid,
    Relu,
    Tanh,
    Softmax,
    LogSoftmax,
    Named(String),
}

impl Activation {
    pub fn from_name(name: &str) -> Self {
        match name {
            "identity" => Self::Identity,
            "sigmoid" => Self::Sigmoid,
            "relu" => Self::Relu,
            "tanh" => Self::Tanh,
            "softmax" => Self::Softmax,
            "logsoftmax" => Self::LogSoftmax,
            other => Self::Named(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Identity => "identity",
            Self::Sigmoid => "sigmoid",
            Self::Relu => "relu",
            Self::Tanh => "tanh",
            Self::Softmax => "softmax",
            Self::LogSoftmax => "logsoftmax",
            Self::Named(name) => name,
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
