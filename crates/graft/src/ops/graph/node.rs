//! Immutable symbolic graph nodes.
//!
//! A [`Node`] is a shared handle to a placeholder produced by an [`Op`] applied to earlier nodes.
//! Nodes carry a construction-time [`NodeType`] whose dimensions may be dynamic; nothing is
//! evaluated until a graph is traced with concrete feeds.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::backend::spec::{
    ComparisonOp, DType, DotGeneralSpec, ElementwiseBinaryOp, ElementwiseUnaryOp, ReduceKind,
    Shape, TensorLiteral, TensorSpec,
};
use crate::error::GraphError;
use crate::ops::graph::dims::{DimExpr, InferError};
use crate::ops::graph::infer::infer_output;
use crate::params::ParamDecl;
use crate::tensor::Tensor;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

/// Monotonic node identity; a node's inputs always carry smaller ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// Operation producing a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Input { name: String, optional: bool },
    Param(Arc<ParamDecl>),
    Constant(TensorLiteral),
    Absent,
    Unary(ElementwiseUnaryOp),
    Binary(ElementwiseBinaryOp),
    Compare(ComparisonOp),
    /// Operands: predicate, on_true, on_false.
    Select,
    Cast(DType),
    DotGeneral(DotGeneralSpec),
    Reduce {
        kind: ReduceKind,
        axis: usize,
        keepdims: bool,
    },
    Reshape(Vec<DimExpr>),
    Transpose(Vec<usize>),
    Slice {
        axis: usize,
        start: usize,
        len: usize,
    },
    /// Operands: input, si32 scalar start, then any operands referenced by `len`.
    DynamicSlice { axis: usize, len: DimExpr },
    Concat { axis: usize },
    /// Operands are only consulted for their shapes.
    Iota { shape: Vec<DimExpr>, axis: usize },
    /// Si32 scalar holding an extent resolved at trace time.
    DimSize(DimExpr),
    /// Operands: table, si32 indices.
    Take,
    /// Operands: si32 `[seed, counter]` key, then any operands referenced by `shape`.
    RngUniform { shape: Vec<DimExpr> },
    /// Operands: value, fallback.
    Default,
    /// Operands: condition, on_true, on_false.
    IfPresent,
    Tuple,
    TupleElement(usize),
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Input { .. } => "input",
            Op::Param(_) => "param",
            Op::Constant(_) => "constant",
            Op::Absent => "absent",
            Op::Unary(_) => "unary",
            Op::Binary(_) => "binary",
            Op::Compare(_) => "compare",
            Op::Select => "select",
            Op::Cast(_) => "cast",
            Op::DotGeneral(_) => "dot_general",
            Op::Reduce { .. } => "reduce",
            Op::Reshape(_) => "reshape",
            Op::Transpose(_) => "transpose",
            Op::Slice { .. } => "slice",
            Op::DynamicSlice { .. } => "dynamic_slice",
            Op::Concat { .. } => "concat",
            Op::Iota { .. } => "iota",
            Op::DimSize(_) => "dim_size",
            Op::Take => "take",
            Op::RngUniform { .. } => "rng_uniform",
            Op::Default => "default",
            Op::IfPresent => "if_present",
            Op::Tuple => "tuple",
            Op::TupleElement(_) => "tuple_element",
        }
    }

    /// Structural ops route values instead of computing on them, so absence does not
    /// propagate through them automatically.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Op::Default | Op::IfPresent | Op::Tuple | Op::TupleElement(_)
        )
    }
}

/// Construction-time type of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeType {
    Tensor(TensorSpec),
    Tuple(Vec<NodeType>),
    /// Statically known to be absent.
    Absent,
}

struct NodeInner {
    id: NodeId,
    op: Op,
    inputs: Vec<Node>,
    ty: NodeType,
}

/// Shared handle to an immutable graph node.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

impl Node {
    pub(crate) fn new(op: Op, inputs: Vec<Node>, ty: NodeType) -> Self {
        let id = NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed));
        Node(Arc::new(NodeInner { id, op, inputs, ty }))
    }

    /// Required runtime input.
    pub fn input(name: impl Into<String>, spec: TensorSpec) -> Self {
        Self::new(
            Op::Input {
                name: name.into(),
                optional: false,
            },
            Vec::new(),
            NodeType::Tensor(spec),
        )
    }

    /// Runtime input that may be fed as absent or omitted entirely.
    pub fn optional_input(name: impl Into<String>, spec: TensorSpec) -> Self {
        Self::new(
            Op::Input {
                name: name.into(),
                optional: true,
            },
            Vec::new(),
            NodeType::Tensor(spec),
        )
    }

    pub fn absent() -> Self {
        Self::new(Op::Absent, Vec::new(), NodeType::Absent)
    }

    pub fn constant(literal: TensorLiteral) -> Self {
        let spec = literal.spec.clone();
        Self::new(Op::Constant(literal), Vec::new(), NodeType::Tensor(spec))
    }

    pub fn from_tensor(tensor: &Tensor) -> Self {
        Self::constant(tensor.to_literal())
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self::constant(TensorLiteral::from_f32(&[], &[value]))
    }

    pub fn scalar_i32(value: i32) -> Self {
        Self::constant(TensorLiteral::from_i32(&[], &[value]))
    }

    /// Scalar of the given dtype; booleans are `value != 0`.
    pub fn scalar(dtype: DType, value: f64) -> Self {
        match dtype {
            DType::F32 => Self::scalar_f32(value as f32),
            DType::Si32 => Self::scalar_i32(value as i32),
            DType::I1 => Self::constant(TensorLiteral::from_bool(&[], &[value != 0.0])),
        }
    }

    /// Multi-output node grouping `items` positionally.
    pub fn tuple(items: Vec<Node>) -> Self {
        let ty = NodeType::Tuple(items.iter().map(|n| n.ty().clone()).collect());
        Self::new(Op::Tuple, items, ty)
    }

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn op(&self) -> &Op {
        &self.0.op
    }

    pub fn inputs(&self) -> &[Node] {
        &self.0.inputs
    }

    pub fn ty(&self) -> &NodeType {
        &self.0.ty
    }

    /// True when absence is already known while building the graph.
    pub fn is_absent(&self) -> bool {
        matches!(self.0.ty, NodeType::Absent)
    }

    pub fn spec(&self) -> Option<&TensorSpec> {
        match &self.0.ty {
            NodeType::Tensor(spec) => Some(spec),
            _ => None,
        }
    }

    /// Tensor spec, or an error naming `op` when the node is a tuple or statically absent.
    pub fn tensor_spec(&self, op: &'static str) -> Result<&TensorSpec> {
        match &self.0.ty {
            NodeType::Tensor(spec) => Ok(spec),
            NodeType::Tuple(items) => Err(GraphError::invalid_argument(
                op,
                format!("expected a tensor operand, got a tuple of {}", items.len()),
            )
            .into()),
            NodeType::Absent => Err(GraphError::invalid_argument(
                op,
                "expected a tensor operand, got a statically absent value",
            )
            .into()),
        }
    }

    pub fn shape(&self, op: &'static str) -> Result<&Shape> {
        Ok(&self.tensor_spec(op)?.shape)
    }

    pub fn dtype(&self, op: &'static str) -> Result<DType> {
        Ok(self.tensor_spec(op)?.dtype)
    }

    pub fn rank(&self, op: &'static str) -> Result<usize> {
        Ok(self.shape(op)?.rank())
    }

    pub fn param_decl(&self) -> Option<&Arc<ParamDecl>> {
        match &self.0.op {
            Op::Param(decl) => Some(decl),
            _ => None,
        }
    }

    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs = self.inputs().iter().map(|n| n.id().0).collect::<Vec<_>>();
        f.debug_struct("Node")
            .field("id", &self.id().0)
            .field("op", &self.op().name())
            .field("inputs", &inputs)
            .field("ty", self.ty())
            .finish()
    }
}

impl From<InferError> for GraphError {
    fn from(err: InferError) -> Self {
        GraphError::ShapeMismatch {
            op: err.op,
            reason: err.reason,
        }
    }
}

/// Builds a computing node, propagating static absence and inferring the output type.
pub(crate) fn primitive(op: Op, inputs: Vec<Node>) -> Result<Node> {
    debug_assert!(!op.is_structural());
    if inputs.iter().any(Node::is_absent) {
        return Ok(Node::new(op, inputs, NodeType::Absent));
    }
    let name = op.name();
    let specs = inputs
        .iter()
        .map(|n| n.tensor_spec(name))
        .collect::<Result<Vec<_>>>()?;
    let spec = infer_output(&op, &specs).map_err(GraphError::from)?;
    Ok(Node::new(op, inputs, NodeType::Tensor(spec)))
}
