pub mod attention;
pub mod dense;
pub mod drop_path;
pub mod layer_norm;
pub mod relative_position;
pub mod rms_norm;

pub use crate::ops::functional::AttentionCache;
pub use attention::{AttentionInputs, MultiHeadAttention};
pub use dense::Dense;
pub use drop_path::DropPath;
pub use layer_norm::LayerNorm;
pub use relative_position::RelativePositionBias;
pub use rms_norm::RmsNorm;
