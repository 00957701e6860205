//! Functional graph builders grouped by concern.

pub mod attention;
pub mod normalization;
pub mod relative_position;
pub mod shape;
pub mod stochastic;
pub mod tensor_ops;

pub use attention::{
    apply_attention_head_mask, attention_bias, attention_output, attention_weights,
    expand_attention_mask, AttentionCache, MASKED_BIAS,
};
pub use normalization::{layer_norm, rms_norm, LayerNormResult, RmsNormResult};
pub use relative_position::{
    relative_position_bias, relative_position_bucket, relative_position_bucket_host,
};
pub use shape::{
    cosine_similarity, flatten_leading, flatten_trailing, merge_heads, pixel_shuffle,
    pixel_unshuffle, split_heads, take_token,
};
pub use stochastic::{drop_path, StateUpdate};
