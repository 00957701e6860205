//! Output-type inference shared by graph construction and tracing.
//!
//! During construction shapes may contain dynamic extents and only statically provable
//! violations fail. During tracing every extent is concrete, so the same rules become exact.

use crate::backend::spec::{
    DType, Dimension, DotGeneralSpec, ElementwiseUnaryOp, Shape, TensorSpec,
};
use crate::ops::graph::dims::{
    broadcast_shapes, resolve, resolve_shape, unify, DimExpr, InferError,
};
use crate::ops::graph::node::Op;

fn expect_arity(op: &'static str, specs: &[&TensorSpec], min: usize) -> Result<(), InferError> {
    if specs.len() < min {
        return Err(InferError::new(
            op,
            format!("expected at least {min} operands, got {}", specs.len()),
        ));
    }
    Ok(())
}

fn expect_dtype(op: &'static str, what: &str, spec: &TensorSpec, dtype: DType) -> Result<(), InferError> {
    if spec.dtype != dtype {
        return Err(InferError::new(
            op,
            format!("{what} must be {dtype:?}, got {:?}", spec.dtype),
        ));
    }
    Ok(())
}

fn expect_same_dtype(op: &'static str, lhs: &TensorSpec, rhs: &TensorSpec) -> Result<(), InferError> {
    if lhs.dtype != rhs.dtype {
        return Err(InferError::new(
            op,
            format!("operand dtypes differ ({:?} vs {:?})", lhs.dtype, rhs.dtype),
        ));
    }
    Ok(())
}

fn shapes<'a>(specs: &[&'a TensorSpec]) -> Vec<&'a Shape> {
    specs.iter().map(|spec| &spec.shape).collect()
}

/// Infers the output of a computing op; structural ops are handled by the caller.
pub(crate) fn infer_output(op: &Op, specs: &[&TensorSpec]) -> Result<TensorSpec, InferError> {
    let name = op.name();
    match op {
        Op::Unary(kind) => {
            expect_arity(name, specs, 1)?;
            let input = specs[0];
            let float_only = !matches!(kind, ElementwiseUnaryOp::Neg | ElementwiseUnaryOp::Abs);
            if float_only {
                expect_dtype(name, "operand", input, DType::F32)?;
            } else if input.dtype == DType::I1 {
                return Err(InferError::new(name, "boolean operands are not numeric"));
            }
            Ok(input.clone())
        }
        Op::Binary(_) => {
            expect_arity(name, specs, 2)?;
            expect_same_dtype(name, specs[0], specs[1])?;
            if specs[0].dtype == DType::I1 {
                return Err(InferError::new(name, "boolean operands are not numeric"));
            }
            let shape = broadcast_shapes(&specs[0].shape, &specs[1].shape, name)?;
            Ok(TensorSpec::new(specs[0].dtype, shape))
        }
        Op::Compare(_) => {
            expect_arity(name, specs, 2)?;
            expect_same_dtype(name, specs[0], specs[1])?;
            let shape = broadcast_shapes(&specs[0].shape, &specs[1].shape, name)?;
            Ok(TensorSpec::new(DType::I1, shape))
        }
        Op::Select => {
            expect_arity(name, specs, 3)?;
            expect_dtype(name, "predicate", specs[0], DType::I1)?;
            expect_same_dtype(name, specs[1], specs[2])?;
            let branches = broadcast_shapes(&specs[1].shape, &specs[2].shape, name)?;
            let shape = broadcast_shapes(&specs[0].shape, &branches, name)?;
            Ok(TensorSpec::new(specs[1].dtype, shape))
        }
        Op::Cast(dtype) => {
            expect_arity(name, specs, 1)?;
            Ok(TensorSpec::new(*dtype, specs[0].shape.clone()))
        }
        Op::DotGeneral(spec) => {
            expect_arity(name, specs, 2)?;
            infer_dot_general(spec, specs[0], specs[1])
        }
        Op::Reduce { axis, keepdims, .. } => {
            expect_arity(name, specs, 1)?;
            let input = specs[0];
            expect_dtype(name, "operand", input, DType::F32)?;
            if *axis >= input.shape.rank() {
                return Err(InferError::new(
                    name,
                    format!("axis {axis} out of range for rank {}", input.shape.rank()),
                ));
            }
            let mut dims = input.shape.dims().to_vec();
            if *keepdims {
                dims[*axis] = Dimension::Static(1);
            } else {
                dims.remove(*axis);
            }
            Ok(TensorSpec::new(input.dtype, Shape::new(dims)))
        }
        Op::Reshape(exprs) => {
            expect_arity(name, specs, 1)?;
            infer_reshape(exprs, specs)
        }
        Op::Transpose(perm) => {
            expect_arity(name, specs, 1)?;
            let input = specs[0];
            let rank = input.shape.rank();
            let mut seen = vec![false; rank];
            if perm.len() != rank {
                return Err(InferError::new(
                    name,
                    format!("permutation {perm:?} does not match rank {rank}"),
                ));
            }
            for &axis in perm {
                if axis >= rank || seen[axis] {
                    return Err(InferError::new(name, format!("{perm:?} is not a permutation")));
                }
                seen[axis] = true;
            }
            let dims = perm
                .iter()
                .map(|&axis| input.shape.dims()[axis].clone())
                .collect::<Vec<_>>();
            Ok(TensorSpec::new(input.dtype, Shape::new(dims)))
        }
        Op::Slice { axis, start, len } => {
            expect_arity(name, specs, 1)?;
            let input = specs[0];
            let Some(dim) = input.shape.dim(*axis) else {
                return Err(InferError::new(name, format!("axis {axis} out of range")));
            };
            if let Dimension::Static(extent) = dim {
                if start + len > *extent {
                    return Err(InferError::new(
                        name,
                        format!("window {start}..{} exceeds extent {extent}", start + len),
                    ));
                }
            }
            let mut dims = input.shape.dims().to_vec();
            dims[*axis] = Dimension::Static(*len);
            Ok(TensorSpec::new(input.dtype, Shape::new(dims)))
        }
        Op::DynamicSlice { axis, len } => {
            expect_arity(name, specs, 2)?;
            let input = specs[0];
            expect_dtype(name, "start", specs[1], DType::Si32)?;
            if specs[1].shape.rank() != 0 {
                return Err(InferError::new(name, "start must be a scalar"));
            }
            let Some(dim) = input.shape.dim(*axis) else {
                return Err(InferError::new(name, format!("axis {axis} out of range")));
            };
            let all = shapes(specs);
            let window = resolve_shape(std::slice::from_ref(len), &all, name)?
                .into_dims()
                .remove(0);
            if let (Dimension::Static(extent), Dimension::Static(size)) = (dim, &window) {
                if size > extent {
                    return Err(InferError::new(
                        name,
                        format!("window {size} exceeds extent {extent}"),
                    ));
                }
            }
            let mut dims = input.shape.dims().to_vec();
            dims[*axis] = window;
            Ok(TensorSpec::new(input.dtype, Shape::new(dims)))
        }
        Op::Concat { axis } => {
            expect_arity(name, specs, 1)?;
            let first = specs[0];
            let rank = first.shape.rank();
            if *axis >= rank {
                return Err(InferError::new(name, format!("axis {axis} out of range")));
            }
            let mut dims = first.shape.dims().to_vec();
            let mut total = Some(0usize);
            let mut symbols = Vec::new();
            for spec in specs {
                expect_same_dtype(name, first, spec)?;
                if spec.shape.rank() != rank {
                    return Err(InferError::new(name, "operands must share rank"));
                }
                for (i, dim) in spec.shape.dims().iter().enumerate() {
                    if i == *axis {
                        match dim {
                            Dimension::Static(v) => total = total.map(|t| t + v),
                            Dimension::Dynamic(sym) => {
                                total = None;
                                symbols.push(sym.as_str().to_string());
                            }
                        }
                    } else {
                        dims[i] = unify(&dims[i], dim, name)?;
                    }
                }
            }
            dims[*axis] = match total {
                Some(total) => Dimension::Static(total),
                None => Dimension::dynamic(symbols.join("+")),
            };
            Ok(TensorSpec::new(first.dtype, Shape::new(dims)))
        }
        Op::Iota { shape, axis } => {
            let shape = resolve_shape(shape, &shapes(specs), name)?;
            if *axis >= shape.rank() {
                return Err(InferError::new(name, format!("axis {axis} out of range")));
            }
            Ok(TensorSpec::new(DType::Si32, shape))
        }
        Op::DimSize(expr) => {
            resolve_shape(std::slice::from_ref(expr), &shapes(specs), name)?;
            Ok(TensorSpec::new(DType::Si32, Shape::scalar()))
        }
        Op::Take => {
            expect_arity(name, specs, 2)?;
            let table = specs[0];
            expect_dtype(name, "indices", specs[1], DType::Si32)?;
            if table.shape.rank() == 0 {
                return Err(InferError::new(name, "table must have rank >= 1"));
            }
            let mut dims = specs[1].shape.dims().to_vec();
            dims.extend_from_slice(&table.shape.dims()[1..]);
            Ok(TensorSpec::new(table.dtype, Shape::new(dims)))
        }
        Op::RngUniform { shape } => {
            expect_arity(name, specs, 1)?;
            expect_dtype(name, "key", specs[0], DType::Si32)?;
            if let Some(dims) = specs[0].shape.static_dims() {
                if dims != [2] {
                    return Err(InferError::new(name, "key must have shape [2]"));
                }
            }
            let shape = resolve_shape(shape, &shapes(specs), name)?;
            Ok(TensorSpec::new(DType::F32, shape))
        }
        Op::Input { .. }
        | Op::Param(_)
        | Op::Constant(_)
        | Op::Absent
        | Op::Default
        | Op::IfPresent
        | Op::Tuple
        | Op::TupleElement(_) => Err(InferError::new(name, "op has no inferred output")),
    }
}

fn infer_dot_general(
    spec: &DotGeneralSpec,
    lhs: &TensorSpec,
    rhs: &TensorSpec,
) -> Result<TensorSpec, InferError> {
    const OP: &str = "dot_general";
    expect_dtype(OP, "lhs", lhs, DType::F32)?;
    expect_dtype(OP, "rhs", rhs, DType::F32)?;
    if spec.batch_lhs.len() != spec.batch_rhs.len()
        || spec.contract_lhs.len() != spec.contract_rhs.len()
    {
        return Err(InferError::new(OP, "batch/contract axis lists differ in length"));
    }
    let l = lhs.shape.dims();
    let r = rhs.shape.dims();
    let in_range = |axes: &[usize], rank: usize| axes.iter().all(|&a| a < rank);
    if !in_range(&spec.batch_lhs, l.len())
        || !in_range(&spec.contract_lhs, l.len())
        || !in_range(&spec.batch_rhs, r.len())
        || !in_range(&spec.contract_rhs, r.len())
    {
        return Err(InferError::new(OP, "axis out of range"));
    }
    let mut dims = Vec::new();
    for (&a, &b) in spec.batch_lhs.iter().zip(&spec.batch_rhs) {
        dims.push(unify(&l[a], &r[b], OP)?);
    }
    for (&a, &b) in spec.contract_lhs.iter().zip(&spec.contract_rhs) {
        unify(&l[a], &r[b], OP)?;
    }
    for (axis, dim) in l.iter().enumerate() {
        if !spec.batch_lhs.contains(&axis) && !spec.contract_lhs.contains(&axis) {
            dims.push(dim.clone());
        }
    }
    for (axis, dim) in r.iter().enumerate() {
        if !spec.batch_rhs.contains(&axis) && !spec.contract_rhs.contains(&axis) {
            dims.push(dim.clone());
        }
    }
    Ok(TensorSpec::new(DType::F32, Shape::new(dims)))
}

fn infer_reshape(exprs: &[DimExpr], specs: &[&TensorSpec]) -> Result<TensorSpec, InferError> {
    const OP: &str = "reshape";
    let input = specs[0];
    let all = shapes(specs);
    let mut dims: Vec<Option<Dimension>> = Vec::with_capacity(exprs.len());
    for expr in exprs {
        dims.push(resolve(expr, &all, OP)?);
    }
    let infer_slots = dims.iter().filter(|d| d.is_none()).count();
    if infer_slots > 1 {
        return Err(InferError::new(OP, "at most one extent may be inferred"));
    }
    let known: Option<usize> = dims
        .iter()
        .flatten()
        .map(Dimension::as_static)
        .product::<Option<usize>>();
    let total = input.shape.element_count();
    let resolved = dims
        .into_iter()
        .map(|dim| match dim {
            Some(dim) => Ok(dim),
            None => match (total, known) {
                (Some(total), Some(known)) => {
                    if known == 0 || total % known != 0 {
                        Err(InferError::new(
                            OP,
                            format!("cannot infer extent: {total} elements into blocks of {known}"),
                        ))
                    } else {
                        Ok(Dimension::Static(total / known))
                    }
                }
                _ => Ok(Dimension::dynamic("?")),
            },
        })
        .collect::<Result<Vec<_>, _>>()?;
    let out = Shape::new(resolved);
    if let (Some(total), Some(count)) = (total, out.element_count()) {
        if total != count {
            return Err(InferError::new(
                OP,
                format!("cannot reshape {} into {out}", input.shape),
            ));
        }
    }
    Ok(TensorSpec::new(input.dtype, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::ElementwiseBinaryOp;

    fn f32_spec(dims: &[usize]) -> TensorSpec {
        TensorSpec::new(DType::F32, Shape::from_static(dims))
    }

    #[test]
    fn reshape_infers_single_extent() {
        let input = f32_spec(&[2, 3, 4]);
        let out = infer_output(
            &Op::Reshape(vec![DimExpr::axis(0), DimExpr::Infer]),
            &[&input],
        )
        .unwrap();
        assert_eq!(out.shape, Shape::from_static(&[2, 12]));
    }

    #[test]
    fn binary_rejects_mixed_dtypes() {
        let lhs = f32_spec(&[2]);
        let rhs = TensorSpec::new(DType::Si32, Shape::from_static(&[2]));
        assert!(infer_output(&Op::Binary(ElementwiseBinaryOp::Add), &[&lhs, &rhs]).is_err());
    }

    #[test]
    fn dot_general_orders_batch_then_free_axes() {
        let lhs = f32_spec(&[2, 4, 3, 8]);
        let rhs = f32_spec(&[2, 4, 5, 8]);
        let spec = DotGeneralSpec {
            batch_lhs: vec![0, 1],
            batch_rhs: vec![0, 1],
            contract_lhs: vec![3],
            contract_rhs: vec![3],
        };
        let out = infer_output(&Op::DotGeneral(spec), &[&lhs, &rhs]).unwrap();
        assert_eq!(out.shape, Shape::from_static(&[2, 4, 3, 5]));
    }
}
