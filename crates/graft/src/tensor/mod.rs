mod host_tensor;

pub use host_tensor::{HostData, Tensor};
