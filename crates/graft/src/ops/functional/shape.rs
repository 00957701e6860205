//! Head splitting, flattening, and sub-pixel rearrangement.
//!
//! All helpers are pure reshapes/transposes described with [`DimExpr`]s, so they stay valid for
//! dynamic leading extents.

use anyhow::Result;

use crate::error::GraphError;
use crate::ops::functional::tensor_ops::{
    div, maximum, mul, reduce_sum, reshape, slice, sqrt, transpose,
};
use crate::ops::graph::dims::{normalize_axis, DimExpr};
use crate::ops::graph::node::Node;

const COSINE_EPS: f32 = 1e-8;

fn leading(count: usize) -> Vec<DimExpr> {
    (0..count).map(DimExpr::axis).collect()
}

/// `{..., hidden}` → `{..., num_heads, hidden / num_heads}`.
///
/// An indivisible static `hidden` fails construction; a dynamic one fails when traced.
pub fn split_heads(x: &Node, num_heads: usize) -> Result<Node> {
    if num_heads == 0 {
        return Err(GraphError::invalid_argument("split_heads", "num_heads must be positive").into());
    }
    if x.is_absent() {
        return Ok(x.clone());
    }
    let rank = x.rank("split_heads")?;
    if rank == 0 {
        return Err(GraphError::invalid_argument("split_heads", "operand must have rank >= 1").into());
    }
    let mut shape = leading(rank - 1);
    shape.push(DimExpr::Const(num_heads));
    shape.push(DimExpr::quotient(rank - 1, num_heads));
    reshape(x, shape, &[])
}

/// `{..., heads, depth}` → `{..., heads * depth}`.
pub fn merge_heads(x: &Node) -> Result<Node> {
    if x.is_absent() {
        return Ok(x.clone());
    }
    let rank = x.rank("merge_heads")?;
    if rank < 2 {
        return Err(GraphError::invalid_argument("merge_heads", "operand must have rank >= 2").into());
    }
    let mut shape = leading(rank - 2);
    shape.push(DimExpr::product(rank - 2..rank));
    reshape(x, shape, &[])
}

/// Collapses every axis but the last into one.
pub fn flatten_leading(x: &Node) -> Result<Node> {
    if x.is_absent() {
        return Ok(x.clone());
    }
    let rank = x.rank("flatten_leading")?;
    if rank < 2 {
        return Ok(x.clone());
    }
    reshape(
        x,
        vec![DimExpr::product(0..rank - 1), DimExpr::axis(rank - 1)],
        &[],
    )
}

/// Collapses every axis but the first into one.
pub fn flatten_trailing(x: &Node) -> Result<Node> {
    if x.is_absent() {
        return Ok(x.clone());
    }
    let rank = x.rank("flatten_trailing")?;
    if rank < 2 {
        return Ok(x.clone());
    }
    reshape(x, vec![DimExpr::axis(0), DimExpr::product(1..rank)], &[])
}

fn spatial_rank(x: &Node, factor: usize, op: &'static str) -> Result<usize> {
    if factor == 0 {
        return Err(GraphError::invalid_argument(op, "factor must be positive").into());
    }
    let rank = x.rank(op)?;
    if rank < 3 {
        return Err(GraphError::invalid_argument(op, "expected trailing {H, W, C} axes").into());
    }
    Ok(rank - 3)
}

/// Depth-to-space: `{..., H, W, C·r²}` → `{..., H·r, W·r, C}`.
///
/// Channels are read as `(C, r_h, r_w)` and interleaved as `H, r_h, W, r_w, C`.
pub fn pixel_shuffle(x: &Node, factor: usize) -> Result<Node> {
    if x.is_absent() {
        return Ok(x.clone());
    }
    let n = spatial_rank(x, factor, "pixel_shuffle")?;
    let mut split = leading(n + 2);
    split.push(DimExpr::quotient(n + 2, factor * factor));
    split.push(DimExpr::Const(factor));
    split.push(DimExpr::Const(factor));
    let split = reshape(x, split, &[])?;

    let mut perm: Vec<usize> = (0..n).collect();
    perm.extend([n, n + 3, n + 1, n + 4, n + 2]);
    let interleaved = transpose(&split, &perm)?;

    let mut merged = leading(n);
    merged.push(DimExpr::product(n..n + 2));
    merged.push(DimExpr::product(n + 2..n + 4));
    merged.push(DimExpr::axis(n + 4));
    reshape(&interleaved, merged, &[])
}

/// Space-to-depth: `{..., H·r, W·r, C}` → `{..., H, W, C·r²}`; exact inverse of
/// [`pixel_shuffle`] with the same factor.
pub fn pixel_unshuffle(x: &Node, factor: usize) -> Result<Node> {
    if x.is_absent() {
        return Ok(x.clone());
    }
    let n = spatial_rank(x, factor, "pixel_unshuffle")?;
    let mut split = leading(n);
    split.extend([
        DimExpr::quotient(n, factor),
        DimExpr::Const(factor),
        DimExpr::quotient(n + 1, factor),
        DimExpr::Const(factor),
        DimExpr::axis(n + 2),
    ]);
    let split = reshape(x, split, &[])?;

    let mut perm: Vec<usize> = (0..n).collect();
    perm.extend([n, n + 2, n + 4, n + 1, n + 3]);
    let gathered = transpose(&split, &perm)?;

    let mut merged = leading(n + 2);
    merged.push(DimExpr::product(n + 2..n + 5));
    reshape(&gathered, merged, &[])
}

/// Selects element `index` along `axis` and drops that axis.
pub fn take_token(x: &Node, axis: isize, index: usize) -> Result<Node> {
    if x.is_absent() {
        return Ok(x.clone());
    }
    let rank = x.rank("take_token")?;
    let axis = normalize_axis(axis, rank, "take_token").map_err(GraphError::from)?;
    let window = slice(x, axis as isize, index, 1)?;
    let shape = (0..rank)
        .filter(|&a| a != axis)
        .map(DimExpr::axis)
        .collect();
    reshape(&window, shape, &[])
}

/// Cosine similarity along the trailing axis, which is removed.
pub fn cosine_similarity(x: &Node, y: &Node) -> Result<Node> {
    let dot = reduce_sum(&mul(x, y)?, -1, false)?;
    let x_norm = sqrt(&reduce_sum(&mul(x, x)?, -1, false)?)?;
    let y_norm = sqrt(&reduce_sum(&mul(y, y)?, -1, false)?)?;
    let denom = maximum(&mul(&x_norm, &y_norm)?, &Node::scalar_f32(COSINE_EPS))?;
    div(&dot, &denom)
}
