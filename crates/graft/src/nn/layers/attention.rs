//! Multi-head attention layer.
//!
//! Projects queries from `hidden` and keys/values from either `hidden` (self-attention) or an
//! encoder sequence (cross-attention), then runs the functional attention pipeline:
//!
//! 1. `split_heads` on each projection,
//! 2. optional concatenation with cached keys/values along the sequence axis,
//! 3. additive bias from the padding mask plus an optional relative-position bias,
//! 4. softmax weights, optional head mask, weighted sum of values,
//! 5. `merge_heads` and the output projection.
//!
//! Results come back as a named [`Container`] so callers can pick the pieces they need.

use anyhow::Result;
use once_cell::sync::OnceCell;

use crate::config::{AttentionOptions, DenseOptions, OptionsRecord};
use crate::error::GraphError;
use crate::nn::layers::dense::Dense;
use crate::nn::layers::relative_position::RelativePositionBias;
use crate::ops::functional::attention::{
    apply_attention_head_mask, attention_bias, attention_output, attention_weights,
    AttentionCache,
};
use crate::ops::functional::shape::{merge_heads, split_heads};
use crate::ops::functional::tensor_ops::{add, concat};
use crate::ops::graph::container::{maybe_container, Container};
use crate::ops::graph::node::Node;
use crate::ops::graph::optional::default;
use crate::params::{static_dim, ParamScope};

/// Graph inputs for one application of [`MultiHeadAttention`].
///
/// Every optional node may also be an optional input that turns out absent when traced.
#[derive(Debug, Clone)]
pub struct AttentionInputs<'a> {
    /// `{batch, seq, hidden}`.
    pub hidden: Node,
    /// `{batch, enc_seq, enc_hidden}`; switches keys and values to cross-attention.
    pub encoder_hidden: Option<Node>,
    /// `{batch, seq_k}` padding mask, `> 0` where attention is allowed.
    pub mask: Option<Node>,
    /// `{heads}` multiplier applied to the attention weights.
    pub head_mask: Option<Node>,
    pub cache: Option<&'a AttentionCache>,
    /// si32 scalar selecting the query rows of the relative-position bias.
    pub position_offset: Option<Node>,
    /// Precomputed `{1, heads, seq_q, seq_k}` bias, shared from an earlier layer.
    pub position_bias: Option<Node>,
}

impl<'a> AttentionInputs<'a> {
    pub fn new(hidden: Node) -> Self {
        Self {
            hidden,
            encoder_hidden: None,
            mask: None,
            head_mask: None,
            cache: None,
            position_offset: None,
            position_bias: None,
        }
    }

    pub fn with_encoder(mut self, encoder_hidden: Node) -> Self {
        self.encoder_hidden = Some(encoder_hidden);
        self
    }

    pub fn with_mask(mut self, mask: Node) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_head_mask(mut self, head_mask: Node) -> Self {
        self.head_mask = Some(head_mask);
        self
    }

    pub fn with_cache(mut self, cache: &'a AttentionCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_position_offset(mut self, offset: Node) -> Self {
        self.position_offset = Some(offset);
        self
    }

    pub fn with_position_bias(mut self, bias: Node) -> Self {
        self.position_bias = Some(bias);
        self
    }
}

struct Projections {
    query: Dense,
    key: Dense,
    value: Dense,
    output: Dense,
}

pub struct MultiHeadAttention {
    scope: ParamScope,
    options: AttentionOptions,
    relative: Option<RelativePositionBias>,
    projections: OnceCell<Projections>,
}

impl MultiHeadAttention {
    pub fn new(scope: ParamScope, options: AttentionOptions) -> Result<Self> {
        options.validate()?;
        let relative = match &options.relative_position {
            Some(relative) => Some(RelativePositionBias::new(
                &scope,
                relative.clone(),
                options.init_std,
            )?),
            None => None,
        };
        Ok(Self {
            scope,
            options,
            relative,
            projections: OnceCell::new(),
        })
    }

    pub fn options(&self) -> &AttentionOptions {
        &self.options
    }

    pub fn relative_position(&self) -> Option<&RelativePositionBias> {
        self.relative.as_ref()
    }

    fn projections(&self, hidden: &Node) -> Result<&Projections> {
        self.projections.get_or_try_init(|| {
            let width = static_dim(hidden.shape("attention")?, -1)?;
            let heads = self.options.num_heads;
            let head_dim = match self.options.head_dim {
                Some(head_dim) => head_dim,
                None if width % heads == 0 => width / heads,
                None => {
                    return Err(GraphError::invalid_argument(
                        "attention",
                        format!("hidden size {width} is not divisible by {heads} heads"),
                    )
                    .into())
                }
            };
            let dense = |name: &str, units: usize| -> Result<Dense> {
                Dense::new(
                    self.scope.child(name)?,
                    DenseOptions {
                        units,
                        use_bias: self.options.use_bias,
                        init_std: self.options.init_std,
                    },
                )
            };
            let inner = heads * head_dim;
            log::trace!("attention: {heads} heads x {head_dim} over width {width}");
            Ok(Projections {
                query: dense("query", inner)?,
                key: dense("key", inner)?,
                value: dense("value", inner)?,
                output: dense("output", width)?,
            })
        })
    }

    /// Builds the attention graph and returns a mapping with
    ///
    /// - `output`: `{batch, seq, hidden}`,
    /// - `cache`: `(key, value)` covering cached and new positions, `{batch, seq_k, heads, depth}`,
    /// - `position_bias`: the bias used, when relative positions are configured or supplied,
    /// - `weights`: `{batch, heads, seq_q, seq_k}` when `output_weights` is set, else absent.
    pub fn forward(&self, inputs: &AttentionInputs<'_>) -> Result<Container<Node>> {
        let hidden = &inputs.hidden;
        let projections = self.projections(hidden)?;
        let heads = self.options.num_heads;

        let kv_source = inputs.encoder_hidden.as_ref().unwrap_or(hidden);
        let query = split_heads(&projections.query.forward(hidden)?, heads)?;
        let mut key = split_heads(&projections.key.forward(kv_source)?, heads)?;
        let mut value = split_heads(&projections.value.forward(kv_source)?, heads)?;
        // Relative positions under a cache are measured against the extended key sequence.
        let extended = match inputs.cache {
            Some(cache) => {
                key = default(&concat(&[&cache.key, &key], 1)?, &key)?;
                value = default(&concat(&[&cache.value, &value], 1)?, &value)?;
                Some(AttentionCache::new(key.clone(), value.clone())?)
            }
            None => None,
        };

        let mask = inputs.mask.clone().unwrap_or_else(Node::absent);
        let mut bias = attention_bias(&mask)?;
        let position_bias = match (&inputs.position_bias, &self.relative) {
            (Some(shared), _) => Some(shared.clone()),
            (None, Some(relative)) => {
                let offset = inputs.position_offset.clone().unwrap_or_else(Node::absent);
                Some(relative.forward(&query, &key, extended.as_ref(), &offset)?)
            }
            (None, None) => None,
        };
        if let Some(position_bias) = &position_bias {
            bias = default(&add(&bias, position_bias)?, &bias)?;
        }

        let mut weights = attention_weights(&query, &key, &bias, self.options.scale_query)?;
        if let Some(head_mask) = &inputs.head_mask {
            weights = apply_attention_head_mask(&weights, head_mask)?;
        }
        let context = merge_heads(&attention_output(&weights, &value)?)?;
        let output = projections.output.forward(&context)?;

        let mut entries = vec![
            ("output", Container::leaf(output)),
            (
                "cache",
                Container::tuple([Container::leaf(key), Container::leaf(value)]),
            ),
            (
                "weights",
                maybe_container(Container::leaf(weights), self.options.output_weights),
            ),
        ];
        if let Some(position_bias) = position_bias {
            entries.push(("position_bias", Container::leaf(position_bias)));
        }
        Ok(Container::map(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{DType, Shape, TensorSpec};
    use crate::config::RelativePositionOptions;

    fn hidden(seq: usize) -> Node {
        Node::input("hidden", TensorSpec::new(DType::F32, Shape::from_static(&[2, seq, 16])))
    }

    fn leaf_shape(outputs: &Container<Node>, key: &str) -> Shape {
        outputs
            .get(key)
            .and_then(Container::as_leaf)
            .and_then(Node::spec)
            .map(|spec| spec.shape.clone())
            .unwrap()
    }

    #[test]
    fn self_attention_shapes() {
        let layer = MultiHeadAttention::new(ParamScope::root(), AttentionOptions::new(4)).unwrap();
        let outputs = layer.forward(&AttentionInputs::new(hidden(3))).unwrap();
        assert_eq!(leaf_shape(&outputs, "output"), Shape::from_static(&[2, 3, 16]));
        assert!(outputs.get("weights").unwrap().as_leaf().unwrap().is_absent());
        assert!(outputs.get("position_bias").is_none());
    }

    #[test]
    fn relative_bias_is_reported() {
        let mut options = AttentionOptions::new(4);
        options.relative_position = Some(RelativePositionOptions::new(4));
        options.output_weights = true;
        let layer = MultiHeadAttention::new(ParamScope::root(), options).unwrap();
        let outputs = layer.forward(&AttentionInputs::new(hidden(5))).unwrap();
        assert_eq!(leaf_shape(&outputs, "position_bias"), Shape::from_static(&[1, 4, 5, 5]));
        assert_eq!(leaf_shape(&outputs, "weights"), Shape::from_static(&[2, 4, 5, 5]));
    }

    #[test]
    fn indivisible_width_fails_at_construction() {
        let layer = MultiHeadAttention::new(ParamScope::root(), AttentionOptions::new(5)).unwrap();
        assert!(layer.forward(&AttentionInputs::new(hidden(3))).is_err());
    }
}
