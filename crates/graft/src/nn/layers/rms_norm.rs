//! Learned-scale RMS normalization layer.

use anyhow::Result;
use once_cell::sync::OnceCell;

use crate::config::{OptionsRecord, RmsNormOptions};
use crate::ops::functional::normalization::{rms_norm, RmsNormResult};
use crate::ops::graph::node::Node;
use crate::params::{static_dim, Initializer, ParamScope};

/// Applies [`rms_norm`] with a `weight` vector sized to the normalized axis, initialized to ones.
pub struct RmsNorm {
    scope: ParamScope,
    options: RmsNormOptions,
    weight: OnceCell<Node>,
}

impl RmsNorm {
    pub fn new(scope: ParamScope, options: RmsNormOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            scope,
            options,
            weight: OnceCell::new(),
        })
    }

    pub fn options(&self) -> &RmsNormOptions {
        &self.options
    }

    fn weight(&self, x: &Node) -> Result<&Node> {
        let axis = self.options.axis;
        self.weight.get_or_try_init(|| {
            self.scope.param(
                "weight",
                &[x],
                |shapes| Ok(vec![static_dim(shapes[0], axis)?]),
                Initializer::Ones,
            )
        })
    }

    pub fn forward(&self, x: &Node) -> Result<Node> {
        Ok(self.forward_with_stats(x)?.output)
    }

    /// Like [`RmsNorm::forward`] but also returns the normalized activations and `1 / rms`.
    pub fn forward_with_stats(&self, x: &Node) -> Result<RmsNormResult> {
        if x.is_absent() {
            return rms_norm(x, x, self.options.axis, self.options.epsilon);
        }
        let weight = self.weight(x)?;
        rms_norm(x, weight, self.options.axis, self.options.epsilon)
    }
}
