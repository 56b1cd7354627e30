//! cuDNN-backed 2D convolution layers.
//!
//! The crate drives the cuDNN descriptor lifecycle for a convolution layer:
//! tensor/filter/convolution descriptors are configured per call, a compute
//! algorithm is selected, scratch workspace is sized and scoped to the call,
//! and the forward (convolution + bias + activation) and backward
//! (bias/filter/data gradient) passes are issued on the device's default
//! stream.
//!
//! Host-side types (shapes, layouts, configuration, errors) build everywhere;
//! the execution engine lives behind the `cuda` feature.

pub mod activation;
pub mod error;
pub mod types;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use activation::Activation;
pub use error::{CunnError, CunnResult};
pub use types::conv::{out_size, Conv2dConfig};
pub use types::dtype::DType;
pub use types::layout::Layout;

#[cfg(feature = "cuda")]
pub use cuda::layer::{Conv2dLayer, Conv2dParams, Delta, GradientViews};
#[cfg(feature = "cuda")]
pub use cuda::storage::DeviceTensor;

/// Parameter-store key for the convolution weight tensor.
pub const WEIGHT_KEY: &str = "W";
/// Parameter-store key for the convolution bias tensor.
pub const BIAS_KEY: &str = "b";
