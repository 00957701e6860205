//! Stochastic depth with explicit PRNG state.
//!
//! Randomness is keyed by an si32 `[seed, counter]` parameter. An invocation reads the key and
//! returns a [`StateUpdate`] with the advanced key; the session writes it back into the same
//! parameter slot so the next run draws a fresh mask.

use std::sync::Arc;

use anyhow::Result;

use crate::backend::spec::TensorLiteral;
use crate::error::GraphError;
use crate::ops::functional::tensor_ops::{add, div, floor, mul, rng_uniform, select};
use crate::ops::graph::dims::DimExpr;
use crate::ops::graph::node::Node;
use crate::ops::graph::optional::default;
use crate::params::ParamDecl;

/// New value for a stateful parameter, computed by the same program that read it.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub param: Arc<ParamDecl>,
    pub value: Node,
}

/// Counter increment applied to a `[seed, counter]` key.
fn advance(key: &Node) -> Result<Node> {
    add(key, &Node::constant(TensorLiteral::from_i32(&[2], &[0, 1])))
}

/// Drops whole examples of `x` with probability `rate` while `training` (an i1 scalar) holds.
///
/// Kept examples are scaled by `1 / (1 - rate)`. `rate == 0` returns `x` itself and emits no
/// update; an absent `training` value behaves as inference.
pub fn drop_path(
    x: &Node,
    rate: f32,
    training: &Node,
    key: Option<&Node>,
) -> Result<(Node, Option<StateUpdate>)> {
    if rate == 0.0 || x.is_absent() {
        return Ok((x.clone(), None));
    }
    if !(0.0..1.0).contains(&rate) {
        return Err(GraphError::InvalidOptions {
            op: "drop_path",
            reason: format!("rate {rate} not in [0, 1)"),
        }
        .into());
    }
    let Some(key) = key else {
        return Err(GraphError::invalid_argument("drop_path", "a PRNG key is required when rate > 0").into());
    };
    let Some(decl) = key.param_decl() else {
        return Err(GraphError::invalid_argument("drop_path", "the PRNG key must be a parameter").into());
    };

    let keep_prob = 1.0 - rate;
    let rank = x.rank("drop_path")?;
    // One draw per example, broadcast over every other axis. `x` is operand 1 of the draw.
    let mut mask_shape = vec![DimExpr::of(1, 0)];
    mask_shape.extend((1..rank).map(|_| DimExpr::Const(1)));
    let uniform = rng_uniform(key, mask_shape, &[x])?;
    let mask = floor(&add(&uniform, &Node::scalar_f32(keep_prob))?)?;
    let dropped = mul(&div(x, &Node::scalar_f32(keep_prob))?, &mask)?;

    let value = default(&select(training, &dropped, x)?, x)?;
    let next_key = default(&select(training, &advance(key)?, key)?, key)?;
    Ok((
        value,
        Some(StateUpdate {
            param: Arc::clone(decl),
            value: next_key,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{DType, Shape, TensorSpec};
    use crate::params::ParamScope;

    fn activations() -> Node {
        Node::input("x", TensorSpec::new(DType::F32, Shape::from_static(&[4, 3])))
    }

    fn training() -> Node {
        Node::input("training", TensorSpec::new(DType::I1, Shape::scalar()))
    }

    #[test]
    fn zero_rate_is_elided() {
        let x = activations();
        let (out, update) = drop_path(&x, 0.0, &training(), None).unwrap();
        assert!(out.ptr_eq(&x));
        assert!(update.is_none());
    }

    #[test]
    fn positive_rate_requires_parameter_key() {
        let x = activations();
        assert!(drop_path(&x, 0.1, &training(), None).is_err());
        let not_a_param = Node::input("key", TensorSpec::new(DType::Si32, Shape::from_static(&[2])));
        assert!(drop_path(&x, 0.1, &training(), Some(&not_a_param)).is_err());
    }

    #[test]
    fn update_targets_key_slot() {
        let scope = ParamScope::root();
        let key = scope.rng_key("rng", 7).unwrap();
        let (out, update) = drop_path(&activations(), 0.5, &training(), Some(&key)).unwrap();
        assert_eq!(out.spec().unwrap().shape, Shape::from_static(&[4, 3]));
        let update = update.unwrap();
        assert_eq!(update.param.name, "rng");
        assert_eq!(update.value.spec().unwrap().dtype, DType::Si32);
    }
}
