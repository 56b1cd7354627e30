//! CUDA/cuDNN execution backend.
//!
//! Everything in here issues blocking calls on the device's default stream.
//! A layer instance (and its descriptor context) must not be shared across
//! threads; callers serialize access or keep one instance per execution lane.

pub mod algo;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod kernels;
pub mod layer;
pub mod storage;
pub mod sync;
pub mod workspace;

pub use context::CudnnContext;
pub use device::CudaDevice;
pub use layer::{Conv2dLayer, Conv2dParams, Delta, GradientViews};
pub use storage::DeviceTensor;
