//! Symbolic dimension expressions.
//!
//! Ops whose output extents depend on their inputs (reshape, iota, rng draws, dynamic slices)
//! describe each output axis as a [`DimExpr`]. The same expression is resolved twice: against
//! possibly-dynamic shapes while the graph is built, and against concrete shapes while it is
//! traced.

use serde::{Deserialize, Serialize};

use crate::backend::spec::{Dimension, Shape};

/// Reference to axis `axis` of the node's `input`-th operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimRef {
    pub input: usize,
    pub axis: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimExpr {
    Const(usize),
    Axis(DimRef),
    Product(Vec<DimRef>),
    Quotient(DimRef, usize),
    /// Reshape only: whatever extent keeps the element count unchanged.
    Infer,
}

impl DimExpr {
    /// Axis `axis` of the first operand.
    pub fn axis(axis: usize) -> Self {
        DimExpr::Axis(DimRef { input: 0, axis })
    }

    pub fn of(input: usize, axis: usize) -> Self {
        DimExpr::Axis(DimRef { input, axis })
    }

    /// Product of a contiguous axis range of the first operand.
    pub fn product(axes: std::ops::Range<usize>) -> Self {
        DimExpr::Product(axes.map(|axis| DimRef { input: 0, axis }).collect())
    }

    pub fn quotient(axis: usize, divisor: usize) -> Self {
        DimExpr::Quotient(DimRef { input: 0, axis }, divisor)
    }
}

/// Failure to resolve or validate a shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferError {
    pub op: &'static str,
    pub reason: String,
}

impl InferError {
    pub fn new(op: &'static str, reason: impl Into<String>) -> Self {
        Self {
            op,
            reason: reason.into(),
        }
    }
}

fn lookup<'a>(
    shapes: &'a [&Shape],
    dim: DimRef,
    op: &'static str,
) -> Result<&'a Dimension, InferError> {
    shapes
        .get(dim.input)
        .and_then(|shape| shape.dim(dim.axis))
        .ok_or_else(|| {
            InferError::new(
                op,
                format!("axis {} of operand {} does not exist", dim.axis, dim.input),
            )
        })
}

/// Resolves `expr`; `Ok(None)` is returned for [`DimExpr::Infer`].
pub fn resolve(
    expr: &DimExpr,
    shapes: &[&Shape],
    op: &'static str,
) -> Result<Option<Dimension>, InferError> {
    let dim = match expr {
        DimExpr::Const(value) => Dimension::Static(*value),
        DimExpr::Axis(dim) => lookup(shapes, *dim, op)?.clone(),
        DimExpr::Product(dims) => {
            let mut product = 1usize;
            let mut symbols = Vec::new();
            for dim in dims {
                match lookup(shapes, *dim, op)? {
                    Dimension::Static(value) => product *= value,
                    Dimension::Dynamic(sym) => symbols.push(sym.as_str().to_string()),
                }
            }
            if symbols.is_empty() {
                Dimension::Static(product)
            } else {
                if product != 1 {
                    symbols.push(product.to_string());
                }
                Dimension::dynamic(symbols.join("*"))
            }
        }
        DimExpr::Quotient(dim, divisor) => {
            if *divisor == 0 {
                return Err(InferError::new(op, "division by a zero factor"));
            }
            match lookup(shapes, *dim, op)? {
                Dimension::Static(value) => {
                    if value % divisor != 0 {
                        return Err(InferError::new(
                            op,
                            format!("extent {value} is not divisible by {divisor}"),
                        ));
                    }
                    Dimension::Static(value / divisor)
                }
                Dimension::Dynamic(sym) => Dimension::dynamic(format!("{}/{divisor}", sym.as_str())),
            }
        }
        DimExpr::Infer => return Ok(None),
    };
    Ok(Some(dim))
}

/// Resolves a full shape where [`DimExpr::Infer`] is not allowed.
pub fn resolve_shape(
    exprs: &[DimExpr],
    shapes: &[&Shape],
    op: &'static str,
) -> Result<Shape, InferError> {
    let mut dims = Vec::with_capacity(exprs.len());
    for expr in exprs {
        match resolve(expr, shapes, op)? {
            Some(dim) => dims.push(dim),
            None => return Err(InferError::new(op, "inferred extents are only valid in reshape")),
        }
    }
    Ok(Shape::new(dims))
}

/// Unifies two extents that must agree.
pub fn unify(
    lhs: &Dimension,
    rhs: &Dimension,
    op: &'static str,
) -> Result<Dimension, InferError> {
    match (lhs, rhs) {
        (Dimension::Static(a), Dimension::Static(b)) if a != b => Err(InferError::new(
            op,
            format!("extents {a} and {b} disagree"),
        )),
        (Dimension::Static(_), _) => Ok(lhs.clone()),
        (_, Dimension::Static(_)) => Ok(rhs.clone()),
        _ => Ok(lhs.clone()),
    }
}

/// Numpy-style broadcast of two shapes, aligned from the trailing axis.
pub fn broadcast_shapes(lhs: &Shape, rhs: &Shape, op: &'static str) -> Result<Shape, InferError> {
    let rank = lhs.rank().max(rhs.rank());
    let one = Dimension::Static(1);
    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let l = if i + lhs.rank() >= rank {
            &lhs.dims()[i + lhs.rank() - rank]
        } else {
            &one
        };
        let r = if i + rhs.rank() >= rank {
            &rhs.dims()[i + rhs.rank() - rank]
        } else {
            &one
        };
        let dim = match (l, r) {
            (Dimension::Static(1), _) => r.clone(),
            (_, Dimension::Static(1)) => l.clone(),
            _ => unify(l, r, op).map_err(|_| {
                InferError::new(op, format!("shapes {lhs} and {rhs} are not broadcastable"))
            })?,
        };
        dims.push(dim);
    }
    Ok(Shape::new(dims))
}

/// Normalizes a possibly negative axis against `rank`.
pub fn normalize_axis(axis: isize, rank: usize, op: &'static str) -> Result<usize, InferError> {
    let resolved = if axis < 0 {
        axis + rank as isize
    } else {
        axis
    };
    if resolved < 0 || resolved as usize >= rank {
        return Err(InferError::new(
            op,
            format!("axis {axis} is out of range for rank {rank}"),
        ));
    }
    Ok(resolved as usize)
}
