//! Lowering of node graphs into executable programs.
//!
//! Tracing is the point where presence and concrete shapes are resolved. Every reachable node is
//! visited once in id order (a topological order, since inputs are always older than their
//! users). Both branches of a `default`/`if_present` are lowered and the unselected one is
//! removed afterwards by [`eliminate_dead_code`], together with any feeds or parameters only it
//! referenced.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use smallvec::SmallVec;

use crate::backend::dce::eliminate_dead_code;
use crate::backend::spec::{
    BackendError, BroadcastToSpec, CastSpec, CompareSpec, ConcatSpec, DType, Dimension,
    DynamicSliceSpec, ElementwiseBinaryOp, IotaSpec, Operand, Operation, Program, ProgramBuilder,
    ReduceSpec, ReshapeSpec, RngUniformSpec, Shape, SliceSpec, SpecErrorCode, TensorLiteral,
    TensorSpec, TransposeSpec, ValueId,
};
use crate::ops::graph::dims::{resolve, InferError};
use crate::ops::graph::infer::infer_output;
use crate::ops::graph::node::{Node, NodeId, Op};
use crate::params::ParamDecl;

/// Entry function name of every traced program.
pub const ENTRY: &str = "main";

/// Concrete feed types keyed by input name; `None` marks a feed that is explicitly absent.
pub type FeedSignature = BTreeMap<String, Option<TensorSpec>>;

/// Source of one entry parameter of a traced program.
#[derive(Debug, Clone)]
pub enum ProgramInput {
    Feed(String),
    Param(Arc<ParamDecl>),
}

/// Where each root's value ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSlot {
    Absent,
    /// Index into the entry function results.
    Result(usize),
    Tuple(Vec<OutputSlot>),
}

#[derive(Debug, Clone)]
pub struct TracedProgram {
    pub program: Program,
    /// One entry per entry-function parameter, in order.
    pub inputs: Vec<ProgramInput>,
    /// One slot per traced root.
    pub outputs: Vec<OutputSlot>,
}

impl TracedProgram {
    /// Parameters the store must materialize before the program can run.
    pub fn param_manifest(&self) -> impl Iterator<Item = &ParamDecl> {
        self.inputs.iter().filter_map(|input| match input {
            ProgramInput::Param(decl) => Some(decl.as_ref()),
            ProgramInput::Feed(_) => None,
        })
    }
}

#[derive(Debug, Clone)]
enum Value {
    Present(ValueId),
    Absent,
    Tuple(Vec<Value>),
}

fn trace_error(err: InferError) -> anyhow::Error {
    BackendError::spec(
        SpecErrorCode::ShapeMismatch,
        format!("{}: {}", err.op, err.reason),
    )
    .into()
}

/// Nodes reachable from `roots`, sorted topologically.
fn reachable(roots: &[Node]) -> Vec<Node> {
    let mut seen: HashMap<NodeId, Node> = HashMap::new();
    let mut stack: Vec<Node> = roots.to_vec();
    while let Some(node) = stack.pop() {
        if seen.contains_key(&node.id()) {
            continue;
        }
        stack.extend(node.inputs().iter().cloned());
        seen.insert(node.id(), node);
    }
    let mut nodes: Vec<Node> = seen.into_values().collect();
    nodes.sort_by_key(Node::id);
    nodes
}

/// Lowers the graph rooted at `roots` for the given feed types.
pub fn trace(roots: &[Node], feeds: &FeedSignature) -> Result<TracedProgram> {
    let mut tracer = Tracer {
        builder: ProgramBuilder::new(),
        feeds,
        inputs: Vec::new(),
        feed_values: HashMap::new(),
        values: HashMap::new(),
    };
    let nodes = reachable(roots);
    for node in &nodes {
        let value = tracer
            .lower(node)
            .with_context(|| format!("failed to lower {} node #{}", node.op().name(), node.id().0))?;
        tracer.values.insert(node.id(), value);
    }

    let mut result_ids = Vec::new();
    let mut outputs = Vec::with_capacity(roots.len());
    for root in roots {
        let value = tracer.value(root)?;
        outputs.push(collect_results(&value, &mut result_ids));
    }

    let Tracer {
        builder, inputs, ..
    } = tracer;
    let mut function = builder.finish(ENTRY, result_ids)?;
    let dce = eliminate_dead_code(&mut function);
    let inputs = dce
        .live_params
        .iter()
        .map(|&index| inputs[index].clone())
        .collect::<Vec<_>>();
    log::debug!(
        "traced {} nodes into {} instructions ({} pruned), {} inputs",
        nodes.len(),
        function.body.len(),
        dce.erased_insts,
        inputs.len()
    );
    Ok(TracedProgram {
        program: Program::new(ENTRY).with_functions(vec![function]),
        inputs,
        outputs,
    })
}

fn collect_results(value: &Value, result_ids: &mut Vec<ValueId>) -> OutputSlot {
    match value {
        Value::Present(id) => {
            result_ids.push(*id);
            OutputSlot::Result(result_ids.len() - 1)
        }
        Value::Absent => OutputSlot::Absent,
        Value::Tuple(items) => OutputSlot::Tuple(
            items
                .iter()
                .map(|item| collect_results(item, result_ids))
                .collect(),
        ),
    }
}

struct Tracer<'a> {
    builder: ProgramBuilder,
    feeds: &'a FeedSignature,
    inputs: Vec<ProgramInput>,
    feed_values: HashMap<String, ValueId>,
    values: HashMap<NodeId, Value>,
}

impl Tracer<'_> {
    fn value(&self, node: &Node) -> Result<Value> {
        self.values
            .get(&node.id())
            .cloned()
            .ok_or_else(|| anyhow!("node #{} was not lowered before its user", node.id().0))
    }

    fn spec_of(&self, id: ValueId) -> Result<TensorSpec> {
        self.builder
            .value_spec(id)
            .cloned()
            .ok_or_else(|| anyhow!("value %{} has no recorded type", id.0))
    }

    fn lower(&mut self, node: &Node) -> Result<Value> {
        let inputs = node.inputs();
        match node.op() {
            Op::Input { name, optional } => self.lower_input(node, name, *optional),
            Op::Param(decl) => {
                let id = self.builder.add_parameter(decl.spec());
                self.inputs.push(ProgramInput::Param(Arc::clone(decl)));
                Ok(Value::Present(id))
            }
            Op::Constant(literal) => Ok(Value::Present(self.builder.emit_single(
                Operation::Constant(literal.clone()),
                Vec::new(),
                literal.spec.clone(),
            ))),
            Op::Absent => Ok(Value::Absent),
            Op::Default => match self.value(&inputs[0])? {
                Value::Absent => self.value(&inputs[1]),
                present => Ok(present),
            },
            Op::IfPresent => match self.value(&inputs[0])? {
                Value::Absent => self.value(&inputs[2]),
                _ => self.value(&inputs[1]),
            },
            Op::Tuple => Ok(Value::Tuple(
                inputs
                    .iter()
                    .map(|input| self.value(input))
                    .collect::<Result<_>>()?,
            )),
            Op::TupleElement(index) => match self.value(&inputs[0])? {
                Value::Tuple(items) => items
                    .get(*index)
                    .cloned()
                    .ok_or_else(|| anyhow!("tuple element {index} out of range ({})", items.len())),
                Value::Absent => Ok(Value::Absent),
                Value::Present(_) => bail!("tuple_element applied to a tensor"),
            },
            op => self.lower_primitive(op, inputs),
        }
    }

    fn lower_input(&mut self, node: &Node, name: &str, optional: bool) -> Result<Value> {
        let declared = node.tensor_spec("input")?;
        let spec = match self.feeds.get(name) {
            Some(Some(spec)) => spec,
            Some(None) | None if optional => return Ok(Value::Absent),
            Some(None) => bail!("required input `{name}` was fed as absent"),
            None => bail!("missing feed for required input `{name}`"),
        };
        if spec.dtype != declared.dtype {
            bail!(
                "feed `{name}` has dtype {:?}, input declares {:?}",
                spec.dtype,
                declared.dtype
            );
        }
        if spec.shape.rank() != declared.shape.rank() {
            bail!(
                "feed `{name}` has shape {}, input declares {}",
                spec.shape,
                declared.shape
            );
        }
        for (fed, expected) in spec.shape.dims().iter().zip(declared.shape.dims()) {
            if let (Dimension::Static(fed), Dimension::Static(expected)) = (fed, expected) {
                if fed != expected {
                    bail!(
                        "feed `{name}` has shape {}, input declares {}",
                        spec.shape,
                        declared.shape
                    );
                }
            }
        }
        if let Some(&id) = self.feed_values.get(name) {
            return Ok(Value::Present(id));
        }
        let id = self.builder.add_parameter(spec.clone());
        self.inputs.push(ProgramInput::Feed(name.to_string()));
        self.feed_values.insert(name.to_string(), id);
        Ok(Value::Present(id))
    }

    fn lower_primitive(&mut self, op: &Op, inputs: &[Node]) -> Result<Value> {
        let mut ids: SmallVec<[ValueId; 4]> = SmallVec::new();
        for input in inputs {
            match self.value(input)? {
                Value::Present(id) => ids.push(id),
                Value::Absent => return Ok(Value::Absent),
                Value::Tuple(_) => bail!("{} received a tuple operand", op.name()),
            }
        }
        let specs = ids
            .iter()
            .map(|&id| self.spec_of(id))
            .collect::<Result<Vec<_>>>()?;
        let spec_refs = specs.iter().collect::<Vec<_>>();
        let output = infer_output(op, &spec_refs).map_err(trace_error)?;
        let Some(out_dims) = output.shape.static_dims() else {
            bail!("{} produced a non-static shape {}", op.name(), output.shape);
        };

        let id = match op {
            Op::Unary(kind) => self.emit(
                Operation::ElementwiseUnary(*kind),
                vec![ids[0]],
                output,
            ),
            Op::Binary(kind) => {
                let lhs = self.broadcast(ids[0], &output.shape)?;
                let rhs = self.broadcast(ids[1], &output.shape)?;
                self.emit(Operation::ElementwiseBinary(*kind), vec![lhs, rhs], output)
            }
            Op::Compare(cmp) => {
                let lhs = self.broadcast(ids[0], &output.shape)?;
                let rhs = self.broadcast(ids[1], &output.shape)?;
                self.emit(
                    Operation::Compare(CompareSpec { op: *cmp }),
                    vec![lhs, rhs],
                    output,
                )
            }
            Op::Select => {
                let operands = ids[..3]
                    .iter()
                    .map(|&id| self.broadcast(id, &output.shape))
                    .collect::<Result<Vec<_>>>()?;
                self.emit(Operation::Select, operands, output)
            }
            Op::Cast(dtype) => self.emit(
                Operation::Cast(CastSpec { dtype: *dtype }),
                vec![ids[0]],
                output,
            ),
            Op::DotGeneral(spec) => self.emit(
                Operation::DotGeneral(spec.clone()),
                vec![ids[0], ids[1]],
                output,
            ),
            Op::Reduce {
                kind,
                axis,
                keepdims,
            } => self.emit(
                Operation::Reduce(ReduceSpec {
                    kind: *kind,
                    axis: *axis,
                    keepdims: *keepdims,
                }),
                vec![ids[0]],
                output,
            ),
            Op::Reshape(_) => self.emit(
                Operation::Reshape(ReshapeSpec {
                    new_shape: out_dims,
                }),
                vec![ids[0]],
                output,
            ),
            Op::Transpose(perm) => self.emit(
                Operation::Transpose(TransposeSpec { perm: perm.clone() }),
                vec![ids[0]],
                output,
            ),
            Op::Slice { axis, start, .. } => {
                let mut starts = vec![0; out_dims.len()];
                starts[*axis] = *start;
                self.emit(
                    Operation::Slice(SliceSpec {
                        starts,
                        sizes: out_dims,
                    }),
                    vec![ids[0]],
                    output,
                )
            }
            Op::DynamicSlice { axis, .. } => {
                let starts = self.start_vector(ids[1], *axis, out_dims.len())?;
                self.emit(
                    Operation::DynamicSlice(DynamicSliceSpec { sizes: out_dims }),
                    vec![ids[0], starts],
                    output,
                )
            }
            Op::Concat { axis } => self.emit(
                Operation::Concat(ConcatSpec { axis: *axis }),
                ids.to_vec(),
                output,
            ),
            Op::Iota { axis, .. } => self.emit(
                Operation::Iota(IotaSpec {
                    shape: output.shape.clone(),
                    dtype: DType::Si32,
                    axis: *axis,
                }),
                Vec::new(),
                output,
            ),
            Op::DimSize(expr) => {
                let shapes = specs.iter().map(|spec| &spec.shape).collect::<Vec<_>>();
                let extent = match resolve(expr, &shapes, "dim_size").map_err(trace_error)? {
                    Some(Dimension::Static(extent)) => extent,
                    other => bail!("dim_size resolved to {other:?}"),
                };
                let value = i32::try_from(extent)
                    .map_err(|_| anyhow!("extent {extent} does not fit in si32"))?;
                let literal = TensorLiteral::from_i32(&[], &[value]);
                self.emit(Operation::Constant(literal), Vec::new(), output)
            }
            Op::Take => self.emit(Operation::Take, vec![ids[0], ids[1]], output),
            Op::RngUniform { .. } => self.emit(
                Operation::RngUniform(RngUniformSpec {
                    shape: output.shape.clone(),
                    dtype: DType::F32,
                }),
                vec![ids[0]],
                output,
            ),
            Op::Input { .. }
            | Op::Param(_)
            | Op::Constant(_)
            | Op::Absent
            | Op::Default
            | Op::IfPresent
            | Op::Tuple
            | Op::TupleElement(_) => bail!("{} is not a computing op", op.name()),
        };
        Ok(Value::Present(id))
    }

    fn emit(&mut self, op: Operation, operands: Vec<ValueId>, output: TensorSpec) -> ValueId {
        let operands = operands.into_iter().map(Operand::Value).collect();
        self.builder.emit_single(op, operands, output)
    }

    fn broadcast(&mut self, id: ValueId, target: &Shape) -> Result<ValueId> {
        let spec = self.spec_of(id)?;
        if &spec.shape == target {
            return Ok(id);
        }
        Ok(self.emit(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: target.clone(),
            }),
            vec![id],
            TensorSpec::new(spec.dtype, target.clone()),
        ))
    }

    /// Expands a scalar start offset into the rank-length start vector, zero off `axis`.
    fn start_vector(&mut self, start: ValueId, axis: usize, rank: usize) -> Result<ValueId> {
        let single = self.emit(
            Operation::Reshape(ReshapeSpec { new_shape: vec![1] }),
            vec![start],
            TensorSpec::new(DType::Si32, Shape::from_static(&[1])),
        );
        if rank == 1 {
            return Ok(single);
        }
        let vector_spec = TensorSpec::new(DType::Si32, Shape::from_static(&[rank]));
        let spread = self.broadcast(single, &vector_spec.shape)?;
        let one_hot = (0..rank)
            .map(|i| i32::from(i == axis))
            .collect::<Vec<_>>();
        let one_hot = self.emit(
            Operation::Constant(TensorLiteral::from_i32(&[rank], &one_hot)),
            Vec::new(),
            vector_spec.clone(),
        );
        Ok(self.emit(
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Mul),
            vec![spread, one_hot],
            vector_spec,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::ElementwiseUnaryOp;
    use crate::ops::graph::node::primitive;
    use crate::ops::graph::optional::default;

    fn spec(dims: &[usize]) -> TensorSpec {
        TensorSpec::new(DType::F32, Shape::from_static(dims))
    }

    #[test]
    fn unselected_default_branch_is_pruned() {
        let x = Node::optional_input("x", spec(&[2]));
        let y = Node::input("y", spec(&[2]));
        let exp_y = primitive(Op::Unary(ElementwiseUnaryOp::Exp), vec![y]).unwrap();
        let out = default(&x, &exp_y).unwrap();

        let mut feeds = FeedSignature::new();
        feeds.insert("x".into(), Some(spec(&[2])));
        feeds.insert("y".into(), Some(spec(&[2])));
        let traced = trace(&[out], &feeds).unwrap();
        let function = traced.program.entry_function().unwrap();
        assert!(function.body.is_empty());
        assert!(matches!(&traced.inputs[..], [ProgramInput::Feed(name)] if name == "x"));
        assert_eq!(traced.outputs, vec![OutputSlot::Result(0)]);
    }

    #[test]
    fn absent_feed_propagates_through_primitives() {
        let x = Node::optional_input("x", spec(&[2]));
        let neg = primitive(Op::Unary(ElementwiseUnaryOp::Neg), vec![x]).unwrap();
        let traced = trace(&[neg], &FeedSignature::new()).unwrap();
        assert_eq!(traced.outputs, vec![OutputSlot::Absent]);
    }

    #[test]
    fn missing_required_feed_fails() {
        let x = Node::input("x", spec(&[2]));
        assert!(trace(&[x], &FeedSignature::new()).is_err());
    }

    #[test]
    fn binary_operands_are_broadcast_explicitly() {
        let x = Node::input("x", spec(&[2, 3]));
        let sum = primitive(
            Op::Binary(ElementwiseBinaryOp::Add),
            vec![x, Node::scalar_f32(1.0)],
        )
        .unwrap();
        let mut feeds = FeedSignature::new();
        feeds.insert("x".into(), Some(spec(&[2, 3])));
        let traced = trace(&[sum], &feeds).unwrap();
        let function = traced.program.entry_function().unwrap();
        assert!(function
            .body
            .iter()
            .any(|inst| matches!(inst.op, Operation::BroadcastTo(_))));
    }
}
