//! RMS and layer normalization over a single channel axis.
//!
//! Results expose intermediate statistics so callers (and tests) can inspect the normalized
//! activations before the learned scale is applied.

use anyhow::Result;

use crate::error::GraphError;
use crate::ops::functional::tensor_ops::{add, mul, reduce_mean, reshape, rsqrt, square, sub};
use crate::ops::graph::dims::{normalize_axis, DimExpr};
use crate::ops::graph::node::Node;

/// Outputs produced by [`rms_norm`].
#[derive(Debug, Clone)]
pub struct RmsNormResult {
    pub output: Node,
    pub normalized: Node,
    pub inv_rms: Node,
}

/// Outputs produced by [`layer_norm`].
#[derive(Debug, Clone)]
pub struct LayerNormResult {
    pub output: Node,
    pub normalized: Node,
    pub mean: Node,
    pub inv_std: Node,
}

/// Reshapes a rank-1 per-channel vector so it broadcasts against a rank-`rank` input along
/// `axis`. The trailing axis needs no reshape.
fn channel_broadcast(vector: &Node, axis: usize, rank: usize, op: &'static str) -> Result<Node> {
    if vector.rank(op)? != 1 {
        return Err(GraphError::invalid_argument(op, "scale and bias must be rank 1").into());
    }
    if axis + 1 == rank {
        return Ok(vector.clone());
    }
    let shape = (0..rank)
        .map(|a| {
            if a == axis {
                DimExpr::axis(0)
            } else {
                DimExpr::Const(1)
            }
        })
        .collect();
    reshape(vector, shape, &[])
}

fn channel_axis(x: &Node, axis: isize, op: &'static str) -> Result<(usize, usize)> {
    let rank = x.rank(op)?;
    let axis = normalize_axis(axis, rank, op).map_err(GraphError::from)?;
    Ok((axis, rank))
}

/// `x * rsqrt(mean(x², axis) + epsilon) * weight`, without mean-centering.
pub fn rms_norm(x: &Node, weight: &Node, axis: isize, epsilon: f32) -> Result<RmsNormResult> {
    if x.is_absent() {
        return Ok(RmsNormResult {
            output: x.clone(),
            normalized: x.clone(),
            inv_rms: x.clone(),
        });
    }
    let (axis, rank) = channel_axis(x, axis, "rms_norm")?;
    let variance = reduce_mean(&square(x)?, axis as isize, true)?;
    let inv_rms = rsqrt(&add(&variance, &Node::scalar_f32(epsilon))?)?;
    let normalized = mul(x, &inv_rms)?;
    let scale = channel_broadcast(weight, axis, rank, "rms_norm")?;
    let output = mul(&normalized, &scale)?;
    Ok(RmsNormResult {
        output,
        normalized,
        inv_rms,
    })
}

/// `(x - mean) * rsqrt(var + epsilon) * gamma + beta`; `beta` may be omitted.
pub fn layer_norm(
    x: &Node,
    gamma: &Node,
    beta: Option<&Node>,
    axis: isize,
    epsilon: f32,
) -> Result<LayerNormResult> {
    if x.is_absent() {
        return Ok(LayerNormResult {
            output: x.clone(),
            normalized: x.clone(),
            mean: x.clone(),
            inv_std: x.clone(),
        });
    }
    let (axis, rank) = channel_axis(x, axis, "layer_norm")?;
    let mean = reduce_mean(x, axis as isize, true)?;
    let centered = sub(x, &mean)?;
    let variance = reduce_mean(&square(&centered)?, axis as isize, true)?;
    let inv_std = rsqrt(&add(&variance, &Node::scalar_f32(epsilon))?)?;
    let normalized = mul(&centered, &inv_std)?;
    let mut output = mul(
        &normalized,
        &channel_broadcast(gamma, axis, rank, "layer_norm")?,
    )?;
    if let Some(beta) = beta {
        output = add(&output, &channel_broadcast(beta, axis, rank, "layer_norm")?)?;
    }
    Ok(LayerNormResult {
        output,
        normalized,
        mean,
        inv_std,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{DType, Shape, TensorSpec};

    fn f32_node(name: &str, dims: &[usize]) -> Node {
        Node::input(name, TensorSpec::new(DType::F32, Shape::from_static(dims)))
    }

    #[test]
    fn rms_norm_on_inner_axis_reshapes_weight() {
        let x = f32_node("x", &[2, 4, 3]);
        let w = f32_node("w", &[4]);
        let result = rms_norm(&x, &w, 1, 1e-6).unwrap();
        assert_eq!(result.output.spec().unwrap().shape, Shape::from_static(&[2, 4, 3]));
        assert_eq!(result.inv_rms.spec().unwrap().shape, Shape::from_static(&[2, 1, 3]));
    }

    #[test]
    fn mismatched_weight_fails_at_construction() {
        let x = f32_node("x", &[2, 4]);
        let w = f32_node("w", &[5]);
        assert!(rms_norm(&x, &w, -1, 1e-6).is_err());
    }
}
