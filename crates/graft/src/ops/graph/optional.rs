//! Presence combinators over single nodes.
//!
//! Every node is either `Present` or `Absent` once traced. Primitive ops propagate absence;
//! [`default`] and [`if_present`] choose between branches, which are both constructed eagerly.

use anyhow::Result;

use crate::backend::spec::{Dimension, Shape, TensorSpec};
use crate::error::GraphError;
use crate::ops::graph::node::{Node, NodeType, Op};

/// Merges the types of two alternatives into the type the combinator advertises.
///
/// Same-rank tensors keep agreeing extents and turn disagreeing ones dynamic. Otherwise the
/// preferred branch wins, unless it is statically absent.
fn merge_types(op: &'static str, preferred: &NodeType, other: &NodeType) -> Result<NodeType> {
    match (preferred, other) {
        (NodeType::Absent, _) => Ok(other.clone()),
        (_, NodeType::Absent) => Ok(preferred.clone()),
        (NodeType::Tensor(a), NodeType::Tensor(b)) => {
            if a.dtype != b.dtype {
                return Err(GraphError::invalid_argument(
                    op,
                    format!("alternatives have different dtypes ({:?} vs {:?})", a.dtype, b.dtype),
                )
                .into());
            }
            if a.shape.rank() != b.shape.rank() {
                return Ok(preferred.clone());
            }
            let dims = a
                .shape
                .dims()
                .iter()
                .zip(b.shape.dims())
                .map(|(x, y)| {
                    if x == y {
                        x.clone()
                    } else {
                        Dimension::dynamic("?")
                    }
                })
                .collect::<Vec<_>>();
            Ok(NodeType::Tensor(TensorSpec::new(a.dtype, Shape::new(dims))))
        }
        (NodeType::Tuple(a), NodeType::Tuple(b)) if a.len() == b.len() => {
            let items = a
                .iter()
                .zip(b)
                .map(|(x, y)| merge_types(op, x, y))
                .collect::<Result<Vec<_>>>()?;
            Ok(NodeType::Tuple(items))
        }
        _ => Err(GraphError::invalid_argument(
            op,
            "alternatives mix tensors and tuples of different arity",
        )
        .into()),
    }
}

/// `x` when present at runtime, otherwise `fallback`.
pub fn default(x: &Node, fallback: &Node) -> Result<Node> {
    let ty = merge_types("default", x.ty(), fallback.ty())?;
    Ok(Node::new(Op::Default, vec![x.clone(), fallback.clone()], ty))
}

/// `on_true` when `condition` is present at runtime, otherwise `on_false` (absent if omitted).
pub fn if_present(condition: &Node, on_true: &Node, on_false: Option<&Node>) -> Result<Node> {
    let on_false = match on_false {
        Some(node) => node.clone(),
        None => Node::absent(),
    };
    let ty = if condition.is_absent() {
        on_false.ty().clone()
    } else {
        merge_types("if_present", on_true.ty(), on_false.ty())?
    };
    Ok(Node::new(
        Op::IfPresent,
        vec![condition.clone(), on_true.clone(), on_false],
        ty,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::DType;

    fn f32_input(name: &str, dims: &[usize]) -> Node {
        Node::optional_input(name, TensorSpec::new(DType::F32, Shape::from_static(dims)))
    }

    #[test]
    fn default_prefers_value_type() {
        let x = f32_input("x", &[2, 3]);
        let fallback = Node::scalar_f32(0.0);
        let node = default(&x, &fallback).unwrap();
        assert_eq!(node.spec(), x.spec());
    }

    #[test]
    fn default_of_static_absence_takes_fallback_type() {
        let fallback = f32_input("y", &[4]);
        let node = default(&Node::absent(), &fallback).unwrap();
        assert_eq!(node.spec(), fallback.spec());
    }

    #[test]
    fn default_rejects_dtype_conflicts() {
        let x = f32_input("x", &[2]);
        let err = default(&x, &Node::scalar_i32(0)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn if_present_without_fallback_is_optional() {
        let cond = f32_input("c", &[1]);
        let value = f32_input("v", &[2]);
        let node = if_present(&cond, &value, None).unwrap();
        assert_eq!(node.inputs().len(), 3);
        assert!(node.inputs()[2].is_absent());
    }
}
