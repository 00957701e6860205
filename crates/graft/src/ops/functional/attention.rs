//! Scaled dot-product attention built from graph primitives.
//!
//! Activations use the `{batch, seq, heads, depth}` layout; scores and weights use
//! `{batch, heads, seq_q, seq_k}`. Masking is additive: a masked position receives
//! [`MASKED_BIAS`] rather than `-inf`, so a fully masked row still yields finite weights.

use anyhow::Result;

use crate::backend::spec::{DType, Dimension, DotGeneralSpec};
use crate::error::GraphError;
use crate::ops::functional::tensor_ops::{
    add, axis_size, cast, dot_general, greater, mul, reshape, rsqrt, select, softmax_last_axis,
    transpose,
};
use crate::ops::graph::dims::DimExpr;
use crate::ops::graph::node::Node;
use crate::ops::graph::optional::default;

/// Additive bias applied to masked positions.
pub const MASKED_BIAS: f32 = -1e10;

const HEADS_FIRST: [usize; 4] = [0, 2, 1, 3];

/// Keys and values from earlier decoding steps, `{batch, cached_seq, heads, depth}` each.
#[derive(Debug, Clone)]
pub struct AttentionCache {
    pub key: Node,
    pub value: Node,
}

impl AttentionCache {
    pub fn new(key: Node, value: Node) -> Result<Self> {
        let key_spec = key.tensor_spec("attention_cache")?;
        let value_spec = value.tensor_spec("attention_cache")?;
        if key_spec.shape.rank() != 4 || value_spec.shape.rank() != 4 {
            return Err(GraphError::invalid_argument(
                "attention_cache",
                "key and value must be {batch, seq, heads, depth}",
            )
            .into());
        }
        if key_spec.dtype != value_spec.dtype {
            return Err(GraphError::invalid_argument(
                "attention_cache",
                "key and value dtypes differ",
            )
            .into());
        }
        Ok(Self { key, value })
    }
}

fn expect_rank(x: &Node, rank: usize, op: &'static str) -> Result<()> {
    let actual = x.rank(op)?;
    if actual != rank {
        return Err(GraphError::invalid_argument(
            op,
            format!("expected rank {rank}, got {actual}"),
        )
        .into());
    }
    Ok(())
}

/// `{batch, seq}` → `{batch, 1, 1, seq}`: two singleton axes before the trailing one.
pub fn expand_attention_mask(mask: &Node) -> Result<Node> {
    if mask.is_absent() {
        return Ok(mask.clone());
    }
    let rank = mask.rank("expand_attention_mask")?;
    if rank == 0 {
        return Err(GraphError::invalid_argument(
            "expand_attention_mask",
            "mask must have rank >= 1",
        )
        .into());
    }
    let mut shape: Vec<DimExpr> = (0..rank - 1).map(DimExpr::axis).collect();
    shape.extend([DimExpr::Const(1), DimExpr::Const(1), DimExpr::axis(rank - 1)]);
    reshape(mask, shape, &[])
}

/// Converts a 0/1 mask into an additive bias: `0` where `mask > 0`, [`MASKED_BIAS`] elsewhere.
///
/// An absent mask (statically or at runtime) yields the scalar `0`.
pub fn attention_bias(mask: &Node) -> Result<Node> {
    let no_bias = Node::scalar_f32(0.0);
    if mask.is_absent() {
        return Ok(no_bias);
    }
    let expanded = expand_attention_mask(mask)?;
    let zero = Node::scalar(mask.dtype("attention_bias")?, 0.0);
    let keep = greater(&expanded, &zero)?;
    let bias = select(&keep, &no_bias, &Node::scalar_f32(MASKED_BIAS))?;
    default(&bias, &no_bias)
}

fn query_scale(query: &Node) -> Result<Node> {
    match query.shape("attention_weights")?.dim(3) {
        Some(Dimension::Static(depth)) => Ok(Node::scalar_f32(1.0 / (*depth as f32).sqrt())),
        _ => rsqrt(&axis_size(query, 3)?),
    }
}

/// Softmax-normalized scores `{batch, heads, seq_q, seq_k}` from `{batch, seq, heads, depth}`
/// queries and keys plus a broadcastable additive `bias` (which may be absent).
pub fn attention_weights(query: &Node, key: &Node, bias: &Node, scale_query: bool) -> Result<Node> {
    if query.is_absent() || key.is_absent() {
        return Ok(Node::absent());
    }
    expect_rank(query, 4, "attention_weights")?;
    expect_rank(key, 4, "attention_weights")?;
    let mut q = transpose(query, &HEADS_FIRST)?;
    let k = transpose(key, &HEADS_FIRST)?;
    if scale_query {
        q = mul(&q, &query_scale(&q)?)?;
    }
    let scores = dot_general(
        &q,
        &k,
        DotGeneralSpec {
            batch_lhs: vec![0, 1],
            batch_rhs: vec![0, 1],
            contract_lhs: vec![3],
            contract_rhs: vec![3],
        },
    )?;
    let biased = default(&add(&scores, bias)?, &scores)?;
    softmax_last_axis(&biased)
}

/// Weighted sum of values, returned as `{batch, seq_q, heads, depth}`.
pub fn attention_output(weights: &Node, value: &Node) -> Result<Node> {
    if weights.is_absent() || value.is_absent() {
        return Ok(Node::absent());
    }
    expect_rank(weights, 4, "attention_output")?;
    expect_rank(value, 4, "attention_output")?;
    let v = transpose(value, &HEADS_FIRST)?;
    let context = dot_general(
        weights,
        &v,
        DotGeneralSpec {
            batch_lhs: vec![0, 1],
            batch_rhs: vec![0, 1],
            contract_lhs: vec![3],
            contract_rhs: vec![2],
        },
    )?;
    transpose(&context, &HEADS_FIRST)
}

/// Multiplies weights by a per-head mask broadcast as `{1, heads, 1, 1}`; identity when the mask
/// is absent.
pub fn apply_attention_head_mask(weights: &Node, head_mask: &Node) -> Result<Node> {
    if head_mask.is_absent() {
        return Ok(weights.clone());
    }
    let mask = reshape(
        head_mask,
        vec![
            DimExpr::Const(1),
            DimExpr::Infer,
            DimExpr::Const(1),
            DimExpr::Const(1),
        ],
        &[],
    )?;
    let mask = if mask.dtype("apply_attention_head_mask")? == DType::F32 {
        mask
    } else {
        cast(&mask, DType::F32)?
    };
    default(&mul(weights, &mask)?, weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{Shape, TensorSpec};

    fn f32_input(name: &str, dims: &[usize]) -> Node {
        Node::optional_input(name, TensorSpec::new(DType::F32, Shape::from_static(dims)))
    }

    #[test]
    fn weights_have_heads_first_layout() {
        let q = f32_input("q", &[2, 3, 4, 8]);
        let k = f32_input("k", &[2, 5, 4, 8]);
        let w = attention_weights(&q, &k, &Node::absent(), true).unwrap();
        assert_eq!(w.spec().unwrap().shape, Shape::from_static(&[2, 4, 3, 5]));
    }

    #[test]
    fn absent_mask_bias_is_scalar_zero() {
        let bias = attention_bias(&Node::absent()).unwrap();
        assert_eq!(bias.spec().unwrap().shape.rank(), 0);
    }

    #[test]
    fn output_restores_sequence_layout() {
        let w = f32_input("w", &[2, 4, 3, 5]);
        let v = f32_input("v", &[2, 5, 4, 8]);
        let out = attention_output(&w, &v).unwrap();
        assert_eq!(out.spec().unwrap().shape, Shape::from_static(&[2, 3, 4, 8]));
    }

    #[test]
    fn cache_requires_rank_four() {
        let k = f32_input("k", &[2, 5, 8]);
        assert!(AttentionCache::new(k.clone(), k).is_err());
    }
}
