pub mod backend;
pub mod config;
pub mod error;
pub mod nn;
pub mod ops;
pub mod params;
pub mod tensor;
mod env;
pub mod runtime;

pub use backend::spec::{DType, Dimension, PortableBackend, Shape, TensorSpec};
pub use error::GraphError;
pub use ops::graph::{Container, Node};
pub use runtime::{Feeds, InMemoryParamStore, ParamStore, Session};
pub use tensor::Tensor;
