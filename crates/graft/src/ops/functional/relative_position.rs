//! Relative-position bucketing.
//!
//! Signed distances `j - i` are mapped to a bounded set of buckets: small distances get one bucket
//! each, larger ones share logarithmically widening buckets up to `max_distance`. Bidirectional
//! bucketing reserves half of the budget for positive distances.

use anyhow::Result;

use crate::backend::spec::DType;
use crate::config::RelativePositionOptions;
use crate::error::GraphError;
use crate::ops::functional::attention::AttentionCache;
use crate::ops::functional::tensor_ops::{
    abs, add, cast, div, dynamic_slice, floor, greater, iota, less, log, maximum, minimum, mul,
    neg, reshape, select, sub, take, transpose,
};
use crate::ops::graph::dims::DimExpr;
use crate::ops::graph::node::Node;
use crate::ops::graph::optional::default;

/// Bucket budget after the sign split, and the extent of the linear region.
fn budget(options: &RelativePositionOptions) -> (usize, usize) {
    let buckets = if options.bidirectional {
        options.num_buckets / 2
    } else {
        options.num_buckets
    };
    (buckets, buckets / 2)
}

/// Log-region scale factors shared by the graph and host implementations.
fn log_factors(options: &RelativePositionOptions) -> (f32, f32, f32) {
    let (buckets, max_exact) = budget(options);
    let max_exact = max_exact as f32;
    let log_span = (options.max_distance as f32 / max_exact).ln();
    let log_buckets = (buckets as f32) - max_exact;
    (max_exact, log_span, log_buckets)
}

/// Host reference of [`relative_position_bucket`] for a single distance.
pub fn relative_position_bucket_host(relative_position: i32, options: &RelativePositionOptions) -> i32 {
    let (buckets, max_exact) = budget(options);
    let (buckets, max_exact) = (buckets as i32, max_exact as i32);
    let (offset, distance) = if options.bidirectional {
        let offset = if relative_position > 0 { buckets } else { 0 };
        (offset, relative_position.abs())
    } else {
        (0, -relative_position.min(0))
    };
    if distance < max_exact {
        return offset + distance;
    }
    let (max_exact_f, log_span, log_buckets) = log_factors(options);
    let scaled = (distance.max(1) as f32 / max_exact_f).ln() / log_span * log_buckets;
    let large = (max_exact + scaled.floor() as i32).min(buckets - 1);
    offset + large
}

/// Maps an si32 tensor of signed distances to si32 bucket ids in `[0, num_buckets)`.
pub fn relative_position_bucket(
    relative_position: &Node,
    options: &RelativePositionOptions,
) -> Result<Node> {
    let (buckets, max_exact) = budget(options);
    if max_exact == 0 {
        return Err(GraphError::InvalidOptions {
            op: "relative_position_bucket",
            reason: format!("num_buckets {} leaves no exact buckets", options.num_buckets),
        }
        .into());
    }
    let zero = Node::scalar_i32(0);
    let (offset, distance) = if options.bidirectional {
        let positive = greater(relative_position, &zero)?;
        let offset = select(&positive, &Node::scalar_i32(buckets as i32), &zero)?;
        (Some(offset), abs(relative_position)?)
    } else {
        (None, neg(&minimum(relative_position, &zero)?)?)
    };

    let is_small = less(&distance, &Node::scalar_i32(max_exact as i32))?;
    let (max_exact_f, log_span, log_buckets) = log_factors(options);
    let distance_f = cast(&maximum(&distance, &Node::scalar_i32(1))?, DType::F32)?;
    let ratio = log(&div(&distance_f, &Node::scalar_f32(max_exact_f))?)?;
    let scaled = mul(
        &div(&ratio, &Node::scalar_f32(log_span))?,
        &Node::scalar_f32(log_buckets),
    )?;
    let large = add(
        &cast(&floor(&scaled)?, DType::Si32)?,
        &Node::scalar_i32(max_exact as i32),
    )?;
    let large = minimum(&large, &Node::scalar_i32(buckets as i32 - 1))?;
    let bucket = select(&is_small, &distance, &large)?;
    match offset {
        Some(offset) => add(&bucket, &offset),
        None => Ok(bucket),
    }
}

/// `j - i` over a `{len(i), len(j)}` grid whose extents are read from `refs`.
fn distance_grid(rows: DimExpr, cols: DimExpr, refs: &[&Node]) -> Result<Node> {
    let shape = vec![rows, cols];
    let key_positions = iota(shape.clone(), 1, refs)?;
    let query_positions = iota(shape, 0, refs)?;
    sub(&key_positions, &query_positions)
}

/// Attention bias `{1, heads, Lq, Lk}` from a learned `{num_buckets, heads}` table.
///
/// `query` and `key` are `{batch, seq, ...}` activations. With a cache, both grid extents are the
/// cached key length. A present `offset` (si32 scalar) keeps only the query rows starting there,
/// as many as `query` has positions.
pub fn relative_position_bias(
    table: &Node,
    query: &Node,
    key: &Node,
    cache: Option<&AttentionCache>,
    offset: &Node,
    options: &RelativePositionOptions,
) -> Result<Node> {
    let grid = match cache {
        Some(cache) => distance_grid(DimExpr::of(0, 1), DimExpr::of(0, 1), &[&cache.key])?,
        None => distance_grid(DimExpr::of(0, 1), DimExpr::of(1, 1), &[query, key])?,
    };
    let buckets = relative_position_bucket(&grid, options)?;
    let embedded = take(table, &buckets)?;
    let heads_first = transpose(&embedded, &[2, 0, 1])?;
    let bias = reshape(
        &heads_first,
        vec![
            DimExpr::Const(1),
            DimExpr::axis(0),
            DimExpr::axis(1),
            DimExpr::axis(2),
        ],
        &[],
    )?;
    if offset.is_absent() {
        return Ok(bias);
    }
    let sliced = dynamic_slice(&bias, 2, offset, DimExpr::of(2, 1), &[query])?;
    default(&sliced, &bias)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_buckets_match_t5_reference_values() {
        let options = RelativePositionOptions::new(1);
        // 32 buckets, bidirectional, max distance 128.
        assert_eq!(relative_position_bucket_host(0, &options), 0);
        assert_eq!(relative_position_bucket_host(-3, &options), 3);
        assert_eq!(relative_position_bucket_host(3, &options), 19);
        assert_eq!(relative_position_bucket_host(-8, &options), 8);
        assert_eq!(relative_position_bucket_host(-1000, &options), 15);
        assert_eq!(relative_position_bucket_host(1000, &options), 31);
    }

    #[test]
    fn unidirectional_ignores_future_positions() {
        let mut options = RelativePositionOptions::new(1);
        options.bidirectional = false;
        assert_eq!(relative_position_bucket_host(5, &options), 0);
        assert_eq!(relative_position_bucket_host(-5, &options), 5);
        assert_eq!(relative_position_bucket_host(-10_000, &options), 31);
    }
}
