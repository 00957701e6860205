//! Fully connected projection `y = x W + b` over the trailing axis.

use std::fmt;

use anyhow::Result;
use once_cell::sync::OnceCell;

use crate::backend::spec::DotGeneralSpec;
use crate::config::{DenseOptions, OptionsRecord};
use crate::ops::functional::tensor_ops::{add, dot_general};
use crate::ops::graph::node::Node;
use crate::params::{static_dim, Initializer, ParamScope};

pub struct Dense {
    scope: ParamScope,
    options: DenseOptions,
    params: OnceCell<(Node, Option<Node>)>,
}

impl Dense {
    pub fn new(scope: ParamScope, options: DenseOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            scope,
            options,
            params: OnceCell::new(),
        })
    }

    pub fn units(&self) -> usize {
        self.options.units
    }

    /// `weight {in, units}` and optional `bias {units}`, declared on first use.
    fn params(&self, x: &Node) -> Result<&(Node, Option<Node>)> {
        self.params.get_or_try_init(|| {
            let units = self.options.units;
            let weight = self.scope.param(
                "weight",
                &[x],
                |shapes| Ok(vec![static_dim(shapes[0], -1)?, units]),
                Initializer::Normal {
                    std: self.options.init_std,
                },
            )?;
            let bias = if self.options.use_bias {
                Some(
                    self.scope
                        .param_with_shape("bias", &[units], Initializer::Zeros)?,
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
        let last = x.rank("dense")?.saturating_sub(1);
        let projected = dot_general(
            x,
            weight,
            DotGeneralSpec {
                batch_lhs: Vec::new(),
                batch_rhs: Vec::new(),
                contract_lhs: vec![last],
                contract_rhs: vec![0],
            },
        )?;
        match bias {
            Some(bias) => add(&projected, bias),
            None => Ok(projected),
        }
    }
}

impl fmt::Debug for Dense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dense")
            .field("weight", &self.scope.qualified("weight"))
            .field("units", &self.options.units)
            .field("use_bias", &self.options.use_bias)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{DType, Shape, TensorSpec};

    #[test]
    fn reapplying_shares_parameters() {
        let layer = Dense::new(ParamScope::root().child("proj").unwrap(), DenseOptions::new(6)).unwrap();
        let x = Node::input("x", TensorSpec::new(DType::F32, Shape::from_static(&[2, 3, 4])));
        let a = layer.forward(&x).unwrap();
        let b = layer.forward(&x).unwrap();
        assert_eq!(a.spec().unwrap().shape, Shape::from_static(&[2, 3, 6]));
        assert_eq!(a.spec(), b.spec());
        let (weight, _) = layer.params.get().unwrap();
        assert_eq!(weight.param_decl().unwrap().shape, vec![4, 6]);
        assert_eq!(weight.param_decl().unwrap().name, "proj.weight");
    }
}
