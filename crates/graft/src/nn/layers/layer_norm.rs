//! Layer normalization with an optional learned shift.

use anyhow::Result;
use once_cell::sync::OnceCell;

use crate::config::{LayerNormOptions, OptionsRecord};
use crate::ops::functional::normalization::layer_norm;
use crate::ops::graph::node::Node;
use crate::params::{static_dim, Initializer, ParamScope};

pub struct LayerNorm {
    scope: ParamScope,
    options: LayerNormOptions,
    params: OnceCell<(Node, Option<Node>)>,
}

impl LayerNorm {
    pub fn new(scope: ParamScope, options: LayerNormOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            scope,
            options,
            params: OnceCell::new(),
        })
    }

    fn params(&self, x: &Node) -> Result<&(Node, Option<Node>)> {
        let axis = self.options.axis;
        self.params.get_or_try_init(|| {
            let channels = static_dim(x.shape("layer_norm")?, axis)?;
            let weight = self
                .scope
                .param_with_shape("weight", &[channels], Initializer::Ones)?;
            let bias = if self.options.center {
                Some(
                    self.scope
                        .param_with_shape("bias", &[channels], Initializer::Zeros)?,
                )
            } else {
                None
            };
            Ok((weight, bias))
        })
    }

    pub fn forward(&self, x: &Node) -> Result<Node> {
        if x.is_absent() {
            return Ok(x.clone());
        }
        let (weight, bias) = self.params(x)?;
        let result = layer_norm(
            x,
            weight,
            bias.as_ref(),
            self.options.axis,
            self.options.epsilon,
        )?;
        Ok(result.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{DType, Shape, TensorSpec};

    #[test]
    fn uncentered_norm_declares_only_weight() {
        let scope = ParamScope::root();
        let options = LayerNormOptions {
            center: false,
            ..LayerNormOptions::default()
        };
        let norm = LayerNorm::new(scope.child("ln").unwrap(), options).unwrap();
        let x = Node::input("x", TensorSpec::new(DType::F32, Shape::from_static(&[2, 5])));
        norm.forward(&x).unwrap();
        let (weight, bias) = norm.params.get().unwrap();
        assert_eq!(weight.param_decl().unwrap().shape, vec![5]);
        assert!(bias.is_none());
        // The bias name stays free.
        assert!(scope
            .child("ln")
            .unwrap()
            .param_with_shape("bias", &[5], Initializer::Zeros)
            .is_ok());
    }
}
