//! Learned relative-position attention bias.

use anyhow::Result;

use crate::config::{OptionsRecord, RelativePositionOptions};
use crate::ops::functional::attention::AttentionCache;
use crate::ops::functional::relative_position::relative_position_bias;
use crate::ops::graph::node::Node;
use crate::params::{Initializer, ParamScope};

/// Owns a `{num_buckets, num_heads}` embedding table and produces `{1, heads, Lq, Lk}` biases.
pub struct RelativePositionBias {
    options: RelativePositionOptions,
    table: Node,
}

impl RelativePositionBias {
    pub fn new(scope: &ParamScope, options: RelativePositionOptions, init_std: f32) -> Result<Self> {
        options.validate()?;
        let table = scope.param_with_shape(
            "relative_attention_bias",
            &[options.num_buckets, options.num_heads],
            Initializer::Normal { std: init_std },
        )?;
        Ok(Self { options, table })
    }

    pub fn options(&self) -> &RelativePositionOptions {
        &self.options
    }

    pub fn table(&self) -> &Node {
        &self.table
    }

    pub fn forward(
        &self,
        query: &Node,
        key: &Node,
        cache: Option<&AttentionCache>,
        offset: &Node,
    ) -> Result<Node> {
        relative_position_bias(&self.table, query, key, cache, offset, &self.options)
    }
}
