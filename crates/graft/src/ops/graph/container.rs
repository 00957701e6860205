//! Nested tuples and named mappings of graph values.
//!
//! [`Container`] is a generic tree; all pairwise combinators share [`Container::zip_with`],
//! which requires both trees to have the same arity and keys at every level.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::error::GraphError;
use crate::ops::graph::node::{Node, NodeType, Op};
use crate::ops::graph::optional;

#[derive(Debug, Clone, PartialEq)]
pub enum Container<T> {
    Leaf(T),
    Tuple(Vec<Container<T>>),
    Map(BTreeMap<String, Container<T>>),
}

impl<T> Container<T> {
    pub fn leaf(value: T) -> Self {
        Container::Leaf(value)
    }

    pub fn tuple(items: impl IntoIterator<Item = Container<T>>) -> Self {
        Container::Tuple(items.into_iter().collect())
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Container<T>)>) -> Self {
        Container::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            Container::Leaf(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_leaf(self) -> Option<T> {
        match self {
            Container::Leaf(value) => Some(value),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Container<T>> {
        match self {
            Container::Map(entries) => entries.get(key),
            _ => None,
        }
    }

    pub fn index(&self, index: usize) -> Option<&Container<T>> {
        match self {
            Container::Tuple(items) => items.get(index),
            _ => None,
        }
    }

    /// Leaves in depth-first order (tuple position, then sorted mapping key).
    pub fn leaves(&self) -> Vec<&T> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Container::Leaf(value) => out.push(value),
                Container::Tuple(items) => stack.extend(items.iter().rev()),
                Container::Map(entries) => stack.extend(entries.values().rev()),
            }
        }
        out
    }

    pub fn map_leaves<U>(&self, mut f: impl FnMut(&T) -> U) -> Container<U> {
        self.map_inner(&mut f)
    }

    fn map_inner<U>(&self, f: &mut impl FnMut(&T) -> U) -> Container<U> {
        match self {
            Container::Leaf(value) => Container::Leaf(f(value)),
            Container::Tuple(items) => {
                Container::Tuple(items.iter().map(|item| item.map_inner(f)).collect())
            }
            Container::Map(entries) => Container::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.map_inner(f)))
                    .collect(),
            ),
        }
    }

    pub fn try_map_leaves<U>(&self, mut f: impl FnMut(&T) -> Result<U>) -> Result<Container<U>> {
        self.try_map_inner(&mut f)
    }

    fn try_map_inner<U>(&self, f: &mut impl FnMut(&T) -> Result<U>) -> Result<Container<U>> {
        Ok(match self {
            Container::Leaf(value) => Container::Leaf(f(value)?),
            Container::Tuple(items) => Container::Tuple(
                items
                    .iter()
                    .map(|item| item.try_map_inner(f))
                    .collect::<Result<_>>()?,
            ),
            Container::Map(entries) => Container::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.try_map_inner(f)?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    /// Pairs leaves of two structurally compatible trees.
    pub fn zip_with<U, V>(
        &self,
        other: &Container<U>,
        mut f: impl FnMut(&T, &U) -> Result<V>,
    ) -> Result<Container<V>> {
        self.zip_inner(other, "$", &mut f)
    }

    fn zip_inner<U, V>(
        &self,
        other: &Container<U>,
        path: &str,
        f: &mut impl FnMut(&T, &U) -> Result<V>,
    ) -> Result<Container<V>> {
        match (self, other) {
            (Container::Leaf(a), Container::Leaf(b)) => Ok(Container::Leaf(f(a, b)?)),
            (Container::Tuple(a), Container::Tuple(b)) => {
                if a.len() != b.len() {
                    return Err(GraphError::structure(
                        path,
                        format!("tuple arity {} vs {}", a.len(), b.len()),
                    )
                    .into());
                }
                let items = a
                    .iter()
                    .zip(b)
                    .enumerate()
                    .map(|(i, (x, y))| x.zip_inner(y, &format!("{path}[{i}]"), f))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Container::Tuple(items))
            }
            (Container::Map(a), Container::Map(b)) => {
                if !a.keys().eq(b.keys()) {
                    let left = a.keys().cloned().collect::<Vec<_>>();
                    let right = b.keys().cloned().collect::<Vec<_>>();
                    return Err(GraphError::structure(
                        path,
                        format!("mapping keys {left:?} vs {right:?}"),
                    )
                    .into());
                }
                let entries = a
                    .iter()
                    .zip(b.values())
                    .map(|((k, x), y)| Ok((k.clone(), x.zip_inner(y, &format!("{path}.{k}"), f)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?;
                Ok(Container::Map(entries))
            }
            _ => Err(GraphError::structure(
                path,
                format!("{} vs {}", self.kind(), other.kind()),
            )
            .into()),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Container::Leaf(_) => "leaf",
            Container::Tuple(_) => "tuple",
            Container::Map(_) => "mapping",
        }
    }
}

impl Container<Node> {
    /// Packs the tree into a single tuple node; mappings become tuples in key order.
    pub fn to_node(&self) -> Node {
        match self {
            Container::Leaf(node) => node.clone(),
            Container::Tuple(items) => Node::tuple(items.iter().map(Container::to_node).collect()),
            Container::Map(entries) => {
                Node::tuple(entries.values().map(Container::to_node).collect())
            }
        }
    }
}

impl From<Node> for Container<Node> {
    fn from(node: Node) -> Self {
        Container::Leaf(node)
    }
}

/// Leafwise [`optional::default`].
pub fn default(x: &Container<Node>, fallback: &Container<Node>) -> Result<Container<Node>> {
    x.zip_with(fallback, |value, fallback| optional::default(value, fallback))
}

/// Leafwise [`optional::if_present`] on a single condition.
///
/// An omitted `on_false` becomes `on_true` with every leaf replaced by an absent node.
pub fn if_present(
    condition: &Node,
    on_true: &Container<Node>,
    on_false: Option<&Container<Node>>,
) -> Result<Container<Node>> {
    let synthesized;
    let on_false = match on_false {
        Some(container) => container,
        None => {
            synthesized = on_true.map_leaves(|_| Node::absent());
            &synthesized
        }
    };
    on_true.zip_with(on_false, |t, f| optional::if_present(condition, t, Some(f)))
}

/// Named outputs; a value that is absent at runtime surfaces as `None` in the results.
pub fn output<K: Into<String>>(entries: impl IntoIterator<Item = (K, Node)>) -> Container<Node> {
    Container::map(entries.into_iter().map(|(k, v)| (k, Container::Leaf(v))))
}

/// `container` when the host-level `condition` holds, otherwise a single absent leaf.
pub fn maybe_container(container: Container<Node>, condition: bool) -> Container<Node> {
    if condition {
        container
    } else {
        Container::Leaf(Node::absent())
    }
}

/// Splits a multi-output node into `size` positional element nodes.
pub fn unwrap_tuple(x: &Node, size: usize) -> Result<Vec<Node>> {
    let element_types: Vec<NodeType> = match x.ty() {
        NodeType::Tuple(items) => {
            if items.len() != size {
                return Err(GraphError::structure(
                    "$",
                    format!("cannot unwrap tuple of {} into {size}", items.len()),
                )
                .into());
            }
            items.clone()
        }
        NodeType::Absent => vec![NodeType::Absent; size],
        NodeType::Tensor(_) => {
            return Err(GraphError::invalid_argument("unwrap_tuple", "operand is not a tuple").into())
        }
    };
    Ok(element_types
        .into_iter()
        .enumerate()
        .map(|(index, ty)| Node::new(Op::TupleElement(index), vec![x.clone()], ty))
        .collect())
}

/// New tuple node holding the elements of `tuple` followed by `x`.
pub fn append(tuple: &Node, x: &Node) -> Result<Node> {
    let size = match tuple.ty() {
        NodeType::Tuple(items) => items.len(),
        _ => {
            return Err(GraphError::invalid_argument("append", "first operand is not a tuple").into())
        }
    };
    let mut items = unwrap_tuple(tuple, size)?;
    items.push(x.clone());
    Ok(Node::tuple(items))
}
