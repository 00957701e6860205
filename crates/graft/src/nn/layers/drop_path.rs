//! Stochastic depth layer owning its PRNG key slot.

use anyhow::Result;

use crate::config::{DropPathOptions, OptionsRecord};
use crate::ops::functional::stochastic::{drop_path, StateUpdate};
use crate::ops::graph::node::Node;
use crate::params::ParamScope;

/// Wraps [`drop_path`]. The `rng` key parameter is only declared when `rate > 0`, so a disabled
/// layer contributes nothing to the program or the parameter store.
pub struct DropPath {
    rate: f32,
    key: Option<Node>,
}

impl DropPath {
    pub fn new(scope: ParamScope, options: DropPathOptions) -> Result<Self> {
        options.validate()?;
        let key = if options.rate > 0.0 {
            Some(scope.rng_key("rng", options.seed)?)
        } else {
            None
        };
        Ok(Self {
            rate: options.rate,
            key,
        })
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    /// `training` is an i1 scalar; the returned update must be handed to the session run so the
    /// key advances.
    pub fn forward(&self, x: &Node, training: &Node) -> Result<(Node, Option<StateUpdate>)> {
        drop_path(x, self.rate, training, self.key.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{DType, Shape, TensorSpec};

    #[test]
    fn disabled_layer_declares_no_key() {
        let scope = ParamScope::root();
        let layer = DropPath::new(scope.clone(), DropPathOptions::default()).unwrap();
        assert!(layer.key.is_none());
        let x = Node::input("x", TensorSpec::new(DType::F32, Shape::from_static(&[2, 3])));
        let training = Node::input("training", TensorSpec::new(DType::I1, Shape::scalar()));
        let (out, update) = layer.forward(&x, &training).unwrap();
        assert!(out.ptr_eq(&x));
        assert!(update.is_none());
        assert!(scope.rng_key("rng", 0).is_ok());
    }

    #[test]
    fn rate_must_be_below_one() {
        let options = DropPathOptions { rate: 1.0, seed: 0 };
        assert!(DropPath::new(ParamScope::root(), options).is_err());
    }
}
