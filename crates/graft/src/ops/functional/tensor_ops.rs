//! Primitive graph builders.
//!
//! Every builder validates its static options eagerly, infers the construction-time output type,
//! and propagates static absence. Elementwise builders broadcast numpy-style; the tracer turns
//! implicit broadcasts into explicit ones.

use anyhow::Result;

use crate::backend::spec::{
    ComparisonOp, DType, Dimension, DotGeneralSpec, ElementwiseBinaryOp, ElementwiseUnaryOp,
    ReduceKind,
};
use crate::error::GraphError;
use crate::ops::graph::dims::{normalize_axis, DimExpr};
use crate::ops::graph::node::{primitive, Node, Op};

fn axis_of(x: &Node, axis: isize, op: &'static str) -> Result<usize> {
    if x.is_absent() {
        // Absent values carry no rank; the result is absent regardless of the axis.
        return Ok(axis.max(0) as usize);
    }
    let rank = x.rank(op)?;
    Ok(normalize_axis(axis, rank, op).map_err(GraphError::from)?)
}

fn binary(kind: ElementwiseBinaryOp, lhs: &Node, rhs: &Node) -> Result<Node> {
    primitive(Op::Binary(kind), vec![lhs.clone(), rhs.clone()])
}

fn unary(kind: ElementwiseUnaryOp, x: &Node) -> Result<Node> {
    primitive(Op::Unary(kind), vec![x.clone()])
}

pub fn add(lhs: &Node, rhs: &Node) -> Result<Node> {
    binary(ElementwiseBinaryOp::Add, lhs, rhs)
}

pub fn sub(lhs: &Node, rhs: &Node) -> Result<Node> {
    binary(ElementwiseBinaryOp::Sub, lhs, rhs)
}

pub fn mul(lhs: &Node, rhs: &Node) -> Result<Node> {
    binary(ElementwiseBinaryOp::Mul, lhs, rhs)
}

pub fn div(lhs: &Node, rhs: &Node) -> Result<Node> {
    binary(ElementwiseBinaryOp::Div, lhs, rhs)
}

pub fn maximum(lhs: &Node, rhs: &Node) -> Result<Node> {
    binary(ElementwiseBinaryOp::Maximum, lhs, rhs)
}

pub fn minimum(lhs: &Node, rhs: &Node) -> Result<Node> {
    binary(ElementwiseBinaryOp::Minimum, lhs, rhs)
}

pub fn neg(x: &Node) -> Result<Node> {
    unary(ElementwiseUnaryOp::Neg, x)
}

pub fn abs(x: &Node) -> Result<Node> {
    unary(ElementwiseUnaryOp::Abs, x)
}

pub fn exp(x: &Node) -> Result<Node> {
    unary(ElementwiseUnaryOp::Exp, x)
}

pub fn log(x: &Node) -> Result<Node> {
    unary(ElementwiseUnaryOp::Log, x)
}

pub fn sqrt(x: &Node) -> Result<Node> {
    unary(ElementwiseUnaryOp::Sqrt, x)
}

pub fn rsqrt(x: &Node) -> Result<Node> {
    unary(ElementwiseUnaryOp::Rsqrt, x)
}

pub fn floor(x: &Node) -> Result<Node> {
    unary(ElementwiseUnaryOp::Floor, x)
}

pub fn reciprocal(x: &Node) -> Result<Node> {
    unary(ElementwiseUnaryOp::Reciprocal, x)
}

pub fn tanh(x: &Node) -> Result<Node> {
    unary(ElementwiseUnaryOp::Tanh, x)
}

/// `x * x`.
pub fn square(x: &Node) -> Result<Node> {
    mul(x, x)
}

pub fn compare(lhs: &Node, rhs: &Node, op: ComparisonOp) -> Result<Node> {
    primitive(Op::Compare(op), vec![lhs.clone(), rhs.clone()])
}

pub fn greater(lhs: &Node, rhs: &Node) -> Result<Node> {
    compare(lhs, rhs, ComparisonOp::Greater)
}

pub fn less(lhs: &Node, rhs: &Node) -> Result<Node> {
    compare(lhs, rhs, ComparisonOp::Less)
}

/// Elementwise `predicate ? on_true : on_false` with broadcasting.
pub fn select(predicate: &Node, on_true: &Node, on_false: &Node) -> Result<Node> {
    primitive(
        Op::Select,
        vec![predicate.clone(), on_true.clone(), on_false.clone()],
    )
}

pub fn cast(x: &Node, dtype: DType) -> Result<Node> {
    primitive(Op::Cast(dtype), vec![x.clone()])
}

/// Generalized contraction; output axes are batch, lhs free, rhs free.
pub fn dot_general(lhs: &Node, rhs: &Node, spec: DotGeneralSpec) -> Result<Node> {
    primitive(Op::DotGeneral(spec), vec![lhs.clone(), rhs.clone()])
}

fn reduce(x: &Node, kind: ReduceKind, axis: isize, keepdims: bool, op: &'static str) -> Result<Node> {
    let axis = axis_of(x, axis, op)?;
    primitive(
        Op::Reduce {
            kind,
            axis,
            keepdims,
        },
        vec![x.clone()],
    )
}

pub fn reduce_sum(x: &Node, axis: isize, keepdims: bool) -> Result<Node> {
    reduce(x, ReduceKind::Sum, axis, keepdims, "reduce_sum")
}

pub fn reduce_max(x: &Node, axis: isize, keepdims: bool) -> Result<Node> {
    reduce(x, ReduceKind::Max, axis, keepdims, "reduce_max")
}

/// Extent of `axis` as an f32 scalar node: a literal when static, a traced size otherwise.
pub fn axis_size(x: &Node, axis: usize) -> Result<Node> {
    match x.shape("axis_size")?.dim(axis) {
        Some(Dimension::Static(extent)) => Ok(Node::scalar_f32(*extent as f32)),
        _ => cast(&dim_size(x, axis)?, DType::F32),
    }
}

pub fn reduce_mean(x: &Node, axis: isize, keepdims: bool) -> Result<Node> {
    if x.is_absent() {
        return Ok(x.clone());
    }
    let axis = axis_of(x, axis, "reduce_mean")?;
    let sum = reduce_sum(x, axis as isize, keepdims)?;
    div(&sum, &axis_size(x, axis)?)
}

/// Reshapes `x`; each output axis is a [`DimExpr`] over the operands `x` and `refs`.
pub fn reshape(x: &Node, shape: Vec<DimExpr>, refs: &[&Node]) -> Result<Node> {
    let mut inputs = vec![x.clone()];
    inputs.extend(refs.iter().map(|node| (*node).clone()));
    primitive(Op::Reshape(shape), inputs)
}

/// Reshape to fully static extents.
pub fn reshape_static(x: &Node, shape: &[usize]) -> Result<Node> {
    reshape(x, shape.iter().map(|&d| DimExpr::Const(d)).collect(), &[])
}

pub fn transpose(x: &Node, perm: &[usize]) -> Result<Node> {
    primitive(Op::Transpose(perm.to_vec()), vec![x.clone()])
}

/// Static window `start..start + len` along `axis`.
pub fn slice(x: &Node, axis: isize, start: usize, len: usize) -> Result<Node> {
    let axis = axis_of(x, axis, "slice")?;
    primitive(Op::Slice { axis, start, len }, vec![x.clone()])
}

/// Window along `axis` starting at the si32 scalar `start`; `len` may reference `refs`
/// (operand index 2 onwards).
pub fn dynamic_slice(
    x: &Node,
    axis: isize,
    start: &Node,
    len: DimExpr,
    refs: &[&Node],
) -> Result<Node> {
    let axis = axis_of(x, axis, "dynamic_slice")?;
    let mut inputs = vec![x.clone(), start.clone()];
    inputs.extend(refs.iter().map(|node| (*node).clone()));
    primitive(Op::DynamicSlice { axis, len }, inputs)
}

pub fn concat(items: &[&Node], axis: isize) -> Result<Node> {
    let Some(first) = items.first() else {
        return Err(GraphError::invalid_argument("concat", "needs at least one operand").into());
    };
    let axis = axis_of(first, axis, "concat")?;
    primitive(
        Op::Concat { axis },
        items.iter().map(|node| (*node).clone()).collect(),
    )
}

/// Si32 counter along `axis` over a shape described against `refs`.
pub fn iota(shape: Vec<DimExpr>, axis: usize, refs: &[&Node]) -> Result<Node> {
    primitive(
        Op::Iota { shape, axis },
        refs.iter().map(|node| (*node).clone()).collect(),
    )
}

/// Si32 scalar holding the traced extent of `axis` of `x`.
pub fn dim_size(x: &Node, axis: usize) -> Result<Node> {
    primitive(Op::DimSize(DimExpr::axis(axis)), vec![x.clone()])
}

/// Gathers rows of `table` (axis 0) by si32 `indices`.
pub fn take(table: &Node, indices: &Node) -> Result<Node> {
    primitive(Op::Take, vec![table.clone(), indices.clone()])
}

/// Uniform `[0, 1)` draw keyed by an si32 `[seed, counter]` node.
pub fn rng_uniform(key: &Node, shape: Vec<DimExpr>, refs: &[&Node]) -> Result<Node> {
    let mut inputs = vec![key.clone()];
    inputs.extend(refs.iter().map(|node| (*node).clone()));
    primitive(Op::RngUniform { shape }, inputs)
}

/// Numerically stable softmax over the last axis.
pub fn softmax_last_axis(x: &Node) -> Result<Node> {
    let max = reduce_max(x, -1, true)?;
    let shifted = sub(x, &max)?;
    let exps = exp(&shifted)?;
    let sum = reduce_sum(&exps, -1, true)?;
    div(&exps, &sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{Shape, TensorSpec};
    use crate::ops::graph::node::NodeType;

    fn input(dims: Vec<Dimension>) -> Node {
        Node::input("x", TensorSpec::new(DType::F32, Shape::new(dims)))
    }

    #[test]
    fn mean_over_dynamic_axis_uses_traced_size() {
        let x = input(vec![Dimension::dynamic("b"), 4.into()]);
        let mean = reduce_mean(&x, 0, false).unwrap();
        assert_eq!(mean.spec().unwrap().shape, Shape::from_static(&[4]));
    }

    #[test]
    fn negative_axes_normalize() {
        let x = input(vec![2.into(), 3.into(), 5.into()]);
        let s = slice(&x, -1, 1, 2).unwrap();
        assert_eq!(s.spec().unwrap().shape, Shape::from_static(&[2, 3, 2]));
    }

    #[test]
    fn static_shape_conflicts_fail_eagerly() {
        let a = input(vec![2.into(), 3.into()]);
        let b = input(vec![4.into(), 3.into()]);
        let err = add(&a, &b).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn absent_operands_short_circuit_shape_checks() {
        let x = input(vec![2.into()]);
        let out = add(&x, &Node::absent()).unwrap();
        assert_eq!(out.ty(), &NodeType::Absent);
        assert!(reduce_mean(&Node::absent(), 3, true).unwrap().is_absent());
    }
}
