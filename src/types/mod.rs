pub mod conv;
pub mod dtype;
pub mod layout;

pub use conv::{out_size, Conv2dConfig};
pub use dtype::DType;
pub use layout::Layout;
