use std::collections::HashMap;
use std::sync::Arc;

use graft::backend::spec::{
    BackendError, BackendResult, BroadcastToSpec, CastSpec, CompareSpec, ComparisonOp,
    ConcatSpec, DType, Dimension, DotGeneralSpec, DynamicSliceSpec, ElementwiseBinaryOp,
    ElementwiseUnaryOp, Instruction, IotaSpec, Operand, Operation, PortableBackend, Program,
    ReduceKind, ReduceSpec, RngUniformSpec, Shape, SliceSpec, SpecErrorCode, TensorInit,
    TensorLiteral, TensorSpec, TransposeSpec, ValueId,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Clone, Debug)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub data: TensorData,
}

#[derive(Clone, Debug)]
pub enum TensorData {
    F32(Arc<[f32]>),
    Si32(Arc<[i32]>),
    Bool(Arc<[u8]>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::Si32(values) => values.len(),
            TensorData::Bool(values) => values.len(),
        }
    }

    /// Builds `len` elements where element `i` is read from position `source(i)`.
    fn gather(&self, len: usize, mut source: impl FnMut(usize) -> usize) -> TensorData {
        match self {
            TensorData::F32(values) => TensorData::F32((0..len).map(|i| values[source(i)]).collect()),
            TensorData::Si32(values) => {
                TensorData::Si32((0..len).map(|i| values[source(i)]).collect())
            }
            TensorData::Bool(values) => {
                TensorData::Bool((0..len).map(|i| values[source(i)]).collect())
            }
        }
    }
}

/// Straightforward interpreter of lowered programs over row-major host buffers.
#[derive(Clone, Debug, Default)]
pub struct CpuPortableBackend;

impl CpuPortableBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PortableBackend for CpuPortableBackend {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu-ref"
    }

    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle> {
        match init {
            TensorInit::Literal(lit) => literal_to_tensor(&lit),
            TensorInit::Zeroed(spec) => zeroed_tensor(&spec),
        }
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        Ok(tensor_to_literal(tensor))
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Self::TensorHandle> {
        execute_operation(instruction, inputs)
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        let function = program
            .entry_function()
            .ok_or_else(|| BackendError::execution("entry function not found"))?;

        if function.parameter_ids.len() != entry_inputs.len() {
            return Err(BackendError::execution(format!(
                "entry input arity mismatch: expected {}, got {}",
                function.parameter_ids.len(),
                entry_inputs.len()
            )));
        }

        let mut values: HashMap<ValueId, CpuTensor> = HashMap::new();
        for ((param_id, expected), handle) in function
            .parameter_ids
            .iter()
            .zip(&function.parameters)
            .zip(entry_inputs)
        {
            if &handle.spec != expected {
                return Err(BackendError::spec(
                    SpecErrorCode::ShapeMismatch,
                    format!("entry input {param_id:?} is {}, expected {expected}", handle.spec),
                ));
            }
            values.insert(*param_id, handle.clone());
        }

        for (instr_index, instruction) in function.body.iter().enumerate() {
            let mut inputs = Vec::with_capacity(instruction.operands.len());
            for operand in &instruction.operands {
                let tensor = match operand {
                    Operand::Value(id) => values
                        .get(id)
                        .cloned()
                        .ok_or_else(|| BackendError::execution("operand value missing"))?,
                    Operand::Literal(lit) => literal_to_tensor(lit)?,
                };
                inputs.push(tensor);
            }
            let output = execute_operation(instruction, &inputs).map_err(|err| {
                augment_backend_error(err, &function.name, instr_index, instruction)
            })?;
            values.insert(instruction.id, output);
        }
        log::trace!(
            "cpu-ref executed `{}`: {} instructions",
            function.name,
            function.body.len()
        );

        function
            .result_ids
            .iter()
            .map(|id| {
                values
                    .get(id)
                    .cloned()
                    .ok_or_else(|| BackendError::execution("missing function result value"))
            })
            .collect()
    }
}

fn literal_to_tensor(literal: &TensorLiteral) -> BackendResult<CpuTensor> {
    let data = match literal.spec.dtype {
        DType::F32 => TensorData::F32(Arc::from(bytes_to_f32(&literal.bytes)?)),
        DType::Si32 => TensorData::Si32(Arc::from(bytes_to_i32(&literal.bytes)?)),
        DType::I1 => TensorData::Bool(Arc::from(literal.bytes.as_ref())),
    };
    if data.len() != element_count(&literal.spec.shape)? {
        return Err(BackendError::spec(
            SpecErrorCode::ShapeMismatch,
            format!("literal payload does not match {}", literal.spec),
        ));
    }
    Ok(CpuTensor {
        spec: literal.spec.clone(),
        data,
    })
}

fn zeroed_tensor(spec: &TensorSpec) -> BackendResult<CpuTensor> {
    let elem_count = element_count(&spec.shape)?;
    let data = match spec.dtype {
        DType::F32 => TensorData::F32(Arc::from(vec![0.0; elem_count])),
        DType::Si32 => TensorData::Si32(Arc::from(vec![0; elem_count])),
        DType::I1 => TensorData::Bool(Arc::from(vec![0; elem_count])),
    };
    Ok(CpuTensor {
        spec: spec.clone(),
        data,
    })
}

fn tensor_to_literal(tensor: &CpuTensor) -> TensorLiteral {
    match &tensor.data {
        TensorData::F32(values) => TensorLiteral::new(tensor.spec.clone(), f32_to_bytes(values)),
        TensorData::Si32(values) => TensorLiteral::new(tensor.spec.clone(), i32_to_bytes(values)),
        TensorData::Bool(values) => TensorLiteral::new(tensor.spec.clone(), Arc::clone(values)),
    }
}

fn execute_operation(instruction: &Instruction, inputs: &[CpuTensor]) -> BackendResult<CpuTensor> {
    let output = &instruction.output;
    match &instruction.op {
        Operation::Constant(literal) => literal_to_tensor(literal),
        Operation::Reshape(_) => op_reshape(inputs, output),
        Operation::Slice(spec) => op_slice(inputs, output, spec),
        Operation::DynamicSlice(spec) => op_dynamic_slice(inputs, output, spec),
        Operation::Transpose(spec) => op_transpose(inputs, output, spec),
        Operation::BroadcastTo(spec) => op_broadcast_to(inputs, output, spec),
        Operation::Concat(spec) => op_concat(inputs, output, spec),
        Operation::Take => op_take(inputs, output),
        Operation::DotGeneral(spec) => op_dot_general(inputs, output, spec),
        Operation::ElementwiseBinary(op) => op_elementwise_binary(inputs, output, *op),
        Operation::ElementwiseUnary(op) => op_elementwise_unary(inputs, output, *op),
        Operation::Reduce(spec) => op_reduce(inputs, output, spec),
        Operation::Compare(spec) => op_compare(inputs, output, spec),
        Operation::Select => op_select(inputs, output),
        Operation::Cast(spec) => op_cast(inputs, output, spec),
        Operation::Iota(spec) => op_iota(output, spec),
        Operation::RngUniform(spec) => op_rng_uniform(inputs, output, spec),
    }
}

fn augment_backend_error(
    error: BackendError,
    function_name: &str,
    instruction_index: usize,
    instruction: &Instruction,
) -> BackendError {
    let location = format!(
        "at function `{function_name}` instruction #{instruction_index}, {} {:?} -> {}",
        instruction.op.name(),
        instruction.id,
        instruction.output
    );
    match error {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!("{message} ({location})"),
        },
        BackendError::Unimplemented { op, reason } => BackendError::Unimplemented {
            op,
            reason: format!("{reason} ({location})"),
        },
        other => other,
    }
}

fn op_reshape(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    if element_count(&input.spec.shape)? != element_count(&output.shape)? {
        return Err(BackendError::execution("reshape element count mismatch"));
    }
    Ok(CpuTensor {
        spec: output.clone(),
        data: input.data.clone(),
    })
}

/// Copies the window `[starts, starts + out_dims)` of `input`.
fn window(input: &CpuTensor, output: &TensorSpec, starts: &[usize]) -> BackendResult<CpuTensor> {
    let input_dims = static_dims(&input.spec.shape)?;
    let out_dims = static_dims(&output.shape)?;
    if starts.len() != input_dims.len() || out_dims.len() != input_dims.len() {
        return Err(BackendError::execution("slice rank mismatch"));
    }
    for axis in 0..input_dims.len() {
        if starts[axis] + out_dims[axis] > input_dims[axis] {
            return Err(BackendError::spec(
                SpecErrorCode::IndexOutOfBounds,
                format!("slice window exceeds axis {axis} of {}", input.spec.shape),
            ));
        }
    }
    let strides = compute_strides(&input_dims);
    let len = out_dims.iter().product();
    let data = input.data.gather(len, |idx| {
        unravel_index(idx, &out_dims)
            .iter()
            .enumerate()
            .map(|(axis, &c)| (starts[axis] + c) * strides[axis])
            .sum()
    });
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn op_slice(inputs: &[CpuTensor], output: &TensorSpec, spec: &SliceSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    if spec.sizes != static_dims(&output.shape)? {
        return Err(BackendError::execution("slice output shape mismatch"));
    }
    window(input, output, &spec.starts)
}

fn op_dynamic_slice(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &DynamicSliceSpec,
) -> BackendResult<CpuTensor> {
    if inputs.len() != 2 {
        return Err(BackendError::execution(
            "dynamic_slice expects (input, starts)",
        ));
    }
    let input = &inputs[0];
    let input_dims = static_dims(&input.spec.shape)?;
    if input_dims.len() != spec.sizes.len() {
        return Err(BackendError::execution(
            "dynamic_slice sizes length must match input rank",
        ));
    }
    let starts = match &inputs[1].data {
        TensorData::Si32(values) if values.len() == input_dims.len() => values,
        TensorData::Si32(_) => {
            return Err(BackendError::execution(
                "dynamic_slice starts must be 1-D of length equal to rank",
            ))
        }
        _ => return Err(BackendError::execution("dynamic_slice starts must be si32")),
    };

    // Starts are clamped so the window stays in bounds.
    let mut clamped = Vec::with_capacity(input_dims.len());
    for axis in 0..input_dims.len() {
        let size = spec.sizes[axis];
        if size > input_dims[axis] {
            return Err(BackendError::execution(
                "dynamic_slice size exceeds dimension",
            ));
        }
        let max_start = input_dims[axis] - size;
        clamped.push((starts[axis].max(0) as usize).min(max_start));
    }
    window(input, output, &clamped)
}

fn op_transpose(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &TransposeSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let input_dims = static_dims(&input.spec.shape)?;
    if spec.perm.len() != input_dims.len() {
        return Err(BackendError::execution("transpose rank mismatch"));
    }
    let out_dims = static_dims(&output.shape)?;
    let input_strides = compute_strides(&input_dims);
    let len = out_dims.iter().product();
    let data = input.data.gather(len, |idx| {
        unravel_index(idx, &out_dims)
            .iter()
            .enumerate()
            .map(|(out_axis, &c)| c * input_strides[spec.perm[out_axis]])
            .sum()
    });
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn op_broadcast_to(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &BroadcastToSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let input_dims = static_dims(&input.spec.shape)?;
    let out_dims = static_dims(&output.shape)?;
    if out_dims != static_dims(&spec.result_shape)? {
        return Err(BackendError::execution(
            "broadcast_to result shape mismatch",
        ));
    }
    if out_dims.len() < input_dims.len() {
        return Err(BackendError::execution(
            "broadcast_to result rank must be >= operand rank",
        ));
    }
    // Operand axes align with the trailing result axes; size-1 axes repeat with stride 0.
    let rank_diff = out_dims.len() - input_dims.len();
    let mut aligned = vec![1usize; out_dims.len()];
    aligned[rank_diff..].copy_from_slice(&input_dims);
    for (axis, (&dim, &out_dim)) in aligned.iter().zip(&out_dims).enumerate() {
        if dim != 1 && dim != out_dim {
            return Err(BackendError::spec(
                SpecErrorCode::BroadcastIncompatible,
                format!(
                    "cannot broadcast {} to {} (axis {axis})",
                    input.spec.shape, output.shape
                ),
            ));
        }
    }
    let in_strides: Vec<usize> = compute_strides(&aligned)
        .into_iter()
        .zip(&aligned)
        .map(|(stride, &dim)| if dim == 1 { 0 } else { stride })
        .collect();
    let len = out_dims.iter().product();
    let data = input.data.gather(len, |idx| {
        unravel_index(idx, &out_dims)
            .iter()
            .zip(&in_strides)
            .map(|(&c, &stride)| c * stride)
            .sum()
    });
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn concat_values<T: Copy>(parts: &[(usize, &[T])], outer: usize, inner: usize) -> Vec<T> {
    let total: usize = parts.iter().map(|(axis_dim, _)| axis_dim * inner).sum();
    let mut result = Vec::with_capacity(outer * total);
    for outer_idx in 0..outer {
        for (axis_dim, values) in parts {
            let chunk = axis_dim * inner;
            result.extend_from_slice(&values[outer_idx * chunk..(outer_idx + 1) * chunk]);
        }
    }
    result
}

fn op_concat(inputs: &[CpuTensor], output: &TensorSpec, spec: &ConcatSpec) -> BackendResult<CpuTensor> {
    if inputs.is_empty() {
        return Err(BackendError::execution("concat expects at least one input"));
    }
    let out_dims = static_dims(&output.shape)?;
    let axis = spec.axis;
    if axis >= out_dims.len() {
        return Err(BackendError::execution("concat axis out of range"));
    }
    let inner = out_dims.iter().skip(axis + 1).product::<usize>();
    let outer = out_dims.iter().take(axis).product::<usize>();

    let mut axis_dims = Vec::with_capacity(inputs.len());
    for tensor in inputs {
        if tensor.spec.dtype != output.dtype {
            return Err(BackendError::execution("concat requires matching dtypes"));
        }
        let dims = static_dims(&tensor.spec.shape)?;
        if dims.len() != out_dims.len() {
            return Err(BackendError::execution("concat rank mismatch"));
        }
        for (idx, (&dim, &out_dim)) in dims.iter().zip(&out_dims).enumerate() {
            if idx != axis && dim != out_dim {
                return Err(BackendError::execution("concat dimension mismatch"));
            }
        }
        axis_dims.push(dims[axis]);
    }
    if axis_dims.iter().sum::<usize>() != out_dims[axis] {
        return Err(BackendError::execution(
            "concat inputs do not match output axis length",
        ));
    }

    let data = match output.dtype {
        DType::F32 => {
            let parts = axis_dims
                .iter()
                .zip(inputs)
                .map(|(&dim, t)| f32_values(t).map(|values| (dim, values)))
                .collect::<BackendResult<Vec<_>>>()?;
            TensorData::F32(Arc::from(concat_values(&parts, outer, inner)))
        }
        DType::Si32 => {
            let parts = axis_dims
                .iter()
                .zip(inputs)
                .map(|(&dim, t)| i32_values(t).map(|values| (dim, values)))
                .collect::<BackendResult<Vec<_>>>()?;
            TensorData::Si32(Arc::from(concat_values(&parts, outer, inner)))
        }
        DType::I1 => {
            let parts = axis_dims
                .iter()
                .zip(inputs)
                .map(|(&dim, t)| bool_values(t).map(|values| (dim, values)))
                .collect::<BackendResult<Vec<_>>>()?;
            TensorData::Bool(Arc::from(concat_values(&parts, outer, inner)))
        }
    };
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn op_take(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    if inputs.len() != 2 {
        return Err(BackendError::execution("take expects two operands"));
    }
    let table = &inputs[0];
    let table_dims = static_dims(&table.spec.shape)?;
    if table_dims.is_empty() {
        return Err(BackendError::execution("take requires rank >= 1"));
    }
    let indices = i32_values(&inputs[1])?;
    let rows = table_dims[0];
    let inner = table_dims.iter().skip(1).product::<usize>();
    let expected_out = indices.len() * inner;
    if element_count(&output.shape)? != expected_out {
        return Err(BackendError::execution("take output shape mismatch"));
    }
    if let Some(bad) = indices.iter().find(|&&index| index < 0 || index as usize >= rows) {
        return Err(BackendError::spec(
            SpecErrorCode::IndexOutOfBounds,
            format!("take index {bad} outside [0, {rows})"),
        ));
    }
    let data = table.data.gather(expected_out, |idx| {
        indices[idx / inner] as usize * inner + idx % inner
    });
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn op_elementwise_binary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: ElementwiseBinaryOp,
) -> BackendResult<CpuTensor> {
    if inputs.len() != 2 {
        return Err(BackendError::execution(
            "elementwise binary expects 2 inputs",
        ));
    }
    if inputs[0].data.len() != inputs[1].data.len() {
        return Err(BackendError::execution("elementwise size mismatch"));
    }
    let data = match (&inputs[0].data, &inputs[1].data) {
        (TensorData::F32(a), TensorData::F32(b)) => TensorData::F32(
            a.iter()
                .zip(b.iter())
                .map(|(&x, &y)| match op {
                    ElementwiseBinaryOp::Add => x + y,
                    ElementwiseBinaryOp::Sub => x - y,
                    ElementwiseBinaryOp::Mul => x * y,
                    ElementwiseBinaryOp::Div => x / y,
                    ElementwiseBinaryOp::Maximum => x.max(y),
                    ElementwiseBinaryOp::Minimum => x.min(y),
                })
                .collect(),
        ),
        (TensorData::Si32(a), TensorData::Si32(b)) => {
            let mut result = Vec::with_capacity(a.len());
            for (&x, &y) in a.iter().zip(b.iter()) {
                result.push(match op {
                    ElementwiseBinaryOp::Add => x.wrapping_add(y),
                    ElementwiseBinaryOp::Sub => x.wrapping_sub(y),
                    ElementwiseBinaryOp::Mul => x.wrapping_mul(y),
                    ElementwiseBinaryOp::Div => x
                        .checked_div(y)
                        .ok_or_else(|| BackendError::execution("si32 division by zero"))?,
                    ElementwiseBinaryOp::Maximum => x.max(y),
                    ElementwiseBinaryOp::Minimum => x.min(y),
                });
            }
            TensorData::Si32(Arc::from(result))
        }
        _ => {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeNotSupported,
                format!("elementwise binary on {:?}", output.dtype),
            ))
        }
    };
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn op_elementwise_unary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: ElementwiseUnaryOp,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let data = match &input.data {
        TensorData::F32(values) => TensorData::F32(
            values
                .iter()
                .map(|&x| match op {
                    ElementwiseUnaryOp::Neg => -x,
                    ElementwiseUnaryOp::Abs => x.abs(),
                    ElementwiseUnaryOp::Exp => x.exp(),
                    ElementwiseUnaryOp::Log => x.ln(),
                    ElementwiseUnaryOp::Sqrt => x.sqrt(),
                    ElementwiseUnaryOp::Rsqrt => 1.0 / x.sqrt(),
                    ElementwiseUnaryOp::Reciprocal => 1.0 / x,
                    ElementwiseUnaryOp::Floor => x.floor(),
                    ElementwiseUnaryOp::Tanh => x.tanh(),
                })
                .collect(),
        ),
        TensorData::Si32(values) => match op {
            ElementwiseUnaryOp::Neg => TensorData::Si32(values.iter().map(|x| x.wrapping_neg()).collect()),
            ElementwiseUnaryOp::Abs => TensorData::Si32(values.iter().map(|x| x.wrapping_abs()).collect()),
            other => {
                return Err(BackendError::unimplemented(
                    "elementwise_unary",
                    format!("{other:?} on si32"),
                ))
            }
        },
        TensorData::Bool(_) => {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeNotSupported,
                "elementwise unary on i1".to_string(),
            ))
        }
    };
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn op_reduce(inputs: &[CpuTensor], output: &TensorSpec, spec: &ReduceSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let values = f32_values(input)?;
    let dims = static_dims(&input.spec.shape)?;
    let axis = spec.axis;
    if axis >= dims.len() {
        return Err(BackendError::execution("reduce axis out of range"));
    }
    // keepdims only changes the output shape, not the row-major layout.
    let axis_len = dims[axis];
    let inner = compute_strides(&dims)[axis];
    let outer = dims[..axis].iter().product::<usize>();
    let mut result = vec![0.0f32; outer * inner];
    for outer_idx in 0..outer {
        for inner_idx in 0..inner {
            let base = outer_idx * axis_len * inner + inner_idx;
            let mut acc = match spec.kind {
                ReduceKind::Sum => 0.0f32,
                ReduceKind::Max => f32::NEG_INFINITY,
                ReduceKind::Min => f32::INFINITY,
            };
            for a in 0..axis_len {
                let value = values[base + a * inner];
                acc = match spec.kind {
                    ReduceKind::Sum => acc + value,
                    ReduceKind::Max => acc.max(value),
                    ReduceKind::Min => acc.min(value),
                };
            }
            result[outer_idx * inner + inner_idx] = acc;
        }
    }
    if result.len() != element_count(&output.shape)? {
        return Err(BackendError::execution("reduce output shape mismatch"));
    }
    Ok(CpuTensor {
        spec: output.clone(),
        data: TensorData::F32(Arc::from(result)),
    })
}

fn op_dot_general(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &DotGeneralSpec,
) -> BackendResult<CpuTensor> {
    if inputs.len() != 2 {
        return Err(BackendError::execution("dot_general expects two inputs"));
    }
    let (lhs, rhs) = (&inputs[0], &inputs[1]);
    let lhs_values = f32_values(lhs)?;
    let rhs_values = f32_values(rhs)?;
    let lhs_dims = static_dims(&lhs.spec.shape)?;
    let rhs_dims = static_dims(&rhs.spec.shape)?;
    let lhs_strides = compute_strides(&lhs_dims);
    let rhs_strides = compute_strides(&rhs_dims);

    let free_axes = |rank: usize, batch: &[usize], contract: &[usize]| -> Vec<usize> {
        (0..rank)
            .filter(|ax| !batch.contains(ax) && !contract.contains(ax))
            .collect()
    };
    let lhs_free_axes = free_axes(lhs_dims.len(), &spec.batch_lhs, &spec.contract_lhs);
    let rhs_free_axes = free_axes(rhs_dims.len(), &spec.batch_rhs, &spec.contract_rhs);

    let batch_shape: Vec<usize> = spec.batch_lhs.iter().map(|&ax| lhs_dims[ax]).collect();
    let lhs_free_shape: Vec<usize> = lhs_free_axes.iter().map(|&ax| lhs_dims[ax]).collect();
    let rhs_free_shape: Vec<usize> = rhs_free_axes.iter().map(|&ax| rhs_dims[ax]).collect();
    let contract_shape: Vec<usize> = spec.contract_lhs.iter().map(|&ax| lhs_dims[ax]).collect();

    let mut output_data = Vec::with_capacity(element_count(&output.shape)?);
    for batch_index in MultiIndex::new(&batch_shape) {
        for lhs_free_index in MultiIndex::new(&lhs_free_shape) {
            for rhs_free_index in MultiIndex::new(&rhs_free_shape) {
                let mut sum = 0.0f32;
                for contract_index in MultiIndex::new(&contract_shape) {
                    let lhs_idx = build_index(
                        &lhs_strides,
                        [&spec.batch_lhs, &lhs_free_axes, &spec.contract_lhs],
                        [&batch_index, &lhs_free_index, &contract_index],
                    );
                    let rhs_idx = build_index(
                        &rhs_strides,
                        [&spec.batch_rhs, &rhs_free_axes, &spec.contract_rhs],
                        [&batch_index, &rhs_free_index, &contract_index],
                    );
                    sum += lhs_values[lhs_idx] * rhs_values[rhs_idx];
                }
                output_data.push(sum);
            }
        }
    }
    if output_data.len() != element_count(&output.shape)? {
        return Err(BackendError::execution("dot_general output shape mismatch"));
    }
    Ok(CpuTensor {
        spec: output.clone(),
        data: TensorData::F32(Arc::from(output_data)),
    })
}

fn compare<T: PartialOrd>(op: ComparisonOp, x: T, y: T) -> bool {
    match op {
        ComparisonOp::Less => x < y,
        ComparisonOp::LessEqual => x <= y,
        ComparisonOp::Equal => x == y,
        ComparisonOp::GreaterEqual => x >= y,
        ComparisonOp::Greater => x > y,
        ComparisonOp::NotEqual => x != y,
    }
}

fn op_compare(inputs: &[CpuTensor], output: &TensorSpec, spec: &CompareSpec) -> BackendResult<CpuTensor> {
    if inputs.len() != 2 {
        return Err(BackendError::execution("compare expects two inputs"));
    }
    let result: Arc<[u8]> = match (&inputs[0].data, &inputs[1].data) {
        (TensorData::F32(a), TensorData::F32(b)) => a
            .iter()
            .zip(b.iter())
            .map(|(&x, &y)| compare(spec.op, x, y) as u8)
            .collect(),
        (TensorData::Si32(a), TensorData::Si32(b)) => a
            .iter()
            .zip(b.iter())
            .map(|(&x, &y)| compare(spec.op, x, y) as u8)
            .collect(),
        (TensorData::Bool(a), TensorData::Bool(b)) => a
            .iter()
            .zip(b.iter())
            .map(|(&x, &y)| compare(spec.op, x != 0, y != 0) as u8)
            .collect(),
        _ => return Err(BackendError::execution("compare operands differ in dtype")),
    };
    Ok(CpuTensor {
        spec: output.clone(),
        data: TensorData::Bool(result),
    })
}

fn op_select(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    if inputs.len() != 3 {
        return Err(BackendError::execution("select expects three operands"));
    }
    let pred = bool_values(&inputs[0])?;
    let len = pred.len();
    if inputs[1].data.len() != len || inputs[2].data.len() != len {
        return Err(BackendError::execution("select size mismatch"));
    }
    let pick = |i: usize| pred[i] != 0;
    let data = match (&inputs[1].data, &inputs[2].data) {
        (TensorData::F32(t), TensorData::F32(f)) => {
            TensorData::F32((0..len).map(|i| if pick(i) { t[i] } else { f[i] }).collect())
        }
        (TensorData::Si32(t), TensorData::Si32(f)) => {
            TensorData::Si32((0..len).map(|i| if pick(i) { t[i] } else { f[i] }).collect())
        }
        (TensorData::Bool(t), TensorData::Bool(f)) => {
            TensorData::Bool((0..len).map(|i| if pick(i) { t[i] } else { f[i] }).collect())
        }
        _ => {
            return Err(BackendError::execution(
                "select dtype combination unsupported",
            ))
        }
    };
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn f32_to_i32_trunc_saturating(value: f32) -> i32 {
    if value.is_nan() {
        return 0;
    }
    let truncated = value.trunc();
    if truncated >= i32::MAX as f32 {
        i32::MAX
    } else if truncated <= i32::MIN as f32 {
        i32::MIN
    } else {
        truncated as i32
    }
}

fn op_cast(inputs: &[CpuTensor], output: &TensorSpec, spec: &CastSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    if output.dtype != spec.dtype {
        return Err(BackendError::execution("cast output dtype mismatch"));
    }
    let data = match (&input.data, spec.dtype) {
        (TensorData::F32(values), DType::F32) => TensorData::F32(values.clone()),
        (TensorData::Si32(values), DType::Si32) => TensorData::Si32(values.clone()),
        (TensorData::Bool(values), DType::I1) => TensorData::Bool(values.clone()),
        (TensorData::Si32(values), DType::F32) => {
            TensorData::F32(values.iter().map(|&v| v as f32).collect())
        }
        (TensorData::F32(values), DType::Si32) => {
            TensorData::Si32(values.iter().map(|&v| f32_to_i32_trunc_saturating(v)).collect())
        }
        (TensorData::Bool(values), DType::Si32) => {
            TensorData::Si32(values.iter().map(|&v| i32::from(v != 0)).collect())
        }
        (TensorData::Bool(values), DType::F32) => {
            TensorData::F32(values.iter().map(|&v| if v == 0 { 0.0 } else { 1.0 }).collect())
        }
        (TensorData::Si32(values), DType::I1) => {
            TensorData::Bool(values.iter().map(|&v| (v != 0) as u8).collect())
        }
        (TensorData::F32(values), DType::I1) => {
            TensorData::Bool(values.iter().map(|&v| (v != 0.0) as u8).collect())
        }
    };
    Ok(CpuTensor {
        spec: output.clone(),
        data,
    })
}

fn op_iota(output: &TensorSpec, spec: &IotaSpec) -> BackendResult<CpuTensor> {
    let dims = static_dims(&spec.shape)?;
    if spec.axis >= dims.len() {
        return Err(BackendError::execution("iota axis out of range"));
    }
    if spec.dtype != DType::Si32 {
        return Err(BackendError::execution("iota only supports si32 dtype"));
    }
    let len = element_count(&spec.shape)?;
    let result: Arc<[i32]> = (0..len)
        .map(|idx| unravel_index(idx, &dims)[spec.axis] as i32)
        .collect();
    Ok(CpuTensor {
        spec: output.clone(),
        data: TensorData::Si32(result),
    })
}

/// Uniform `[0, 1)` samples determined entirely by the `[seed, counter]` key.
fn op_rng_uniform(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &RngUniformSpec,
) -> BackendResult<CpuTensor> {
    let key = i32_values(expect_single(inputs)?)?;
    let [seed, counter] = key else {
        return Err(BackendError::execution("rng key must hold [seed, counter]"));
    };
    if spec.dtype != DType::F32 {
        return Err(BackendError::execution("rng_uniform only supports f32"));
    }
    let stream = (u64::from(*seed as u32) << 32) | u64::from(*counter as u32);
    let mut rng = StdRng::seed_from_u64(stream);
    let len = element_count(&spec.shape)?;
    let result: Arc<[f32]> = (0..len).map(|_| rng.gen::<f32>()).collect();
    Ok(CpuTensor {
        spec: output.clone(),
        data: TensorData::F32(result),
    })
}

fn expect_single(inputs: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    if inputs.len() != 1 {
        Err(BackendError::execution("operation expects single input"))
    } else {
        Ok(&inputs[0])
    }
}

fn f32_values(tensor: &CpuTensor) -> BackendResult<&[f32]> {
    match &tensor.data {
        TensorData::F32(values) => Ok(values),
        _ => Err(BackendError::spec(
            SpecErrorCode::DTypeNotSupported,
            format!("expected f32 operand, got {:?}", tensor.spec.dtype),
        )),
    }
}

fn i32_values(tensor: &CpuTensor) -> BackendResult<&[i32]> {
    match &tensor.data {
        TensorData::Si32(values) => Ok(values),
        _ => Err(BackendError::spec(
            SpecErrorCode::DTypeNotSupported,
            format!("expected si32 operand, got {:?}", tensor.spec.dtype),
        )),
    }
}

fn bool_values(tensor: &CpuTensor) -> BackendResult<&[u8]> {
    match &tensor.data {
        TensorData::Bool(values) => Ok(values),
        _ => Err(BackendError::spec(
            SpecErrorCode::DTypeNotSupported,
            format!("expected i1 operand, got {:?}", tensor.spec.dtype),
        )),
    }
}

fn static_dims(shape: &Shape) -> BackendResult<Vec<usize>> {
    shape
        .dims()
        .iter()
        .map(|dim| match dim {
            Dimension::Static(v) => Ok(*v),
            Dimension::Dynamic(sym) => Err(BackendError::execution(format!(
                "dynamic dimension {} not supported at runtime",
                sym.as_str()
            ))),
        })
        .collect()
}

fn element_count(shape: &Shape) -> BackendResult<usize> {
    Ok(static_dims(shape)?.into_iter().product())
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

fn bytes_to_f32(bytes: &[u8]) -> BackendResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(BackendError::execution(
            "literal byte length mismatches f32",
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn bytes_to_i32(bytes: &[u8]) -> BackendResult<Vec<i32>> {
    if bytes.len() % 4 != 0 {
        return Err(BackendError::execution(
            "literal byte length mismatches i32",
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn f32_to_bytes(values: &[f32]) -> Arc<[u8]> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn i32_to_bytes(values: &[i32]) -> Arc<[u8]> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

struct MultiIndex {
    shape: Vec<usize>,
    current: Vec<usize>,
    first: bool,
}

impl MultiIndex {
    fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            current: vec![0; shape.len()],
            first: true,
        }
    }
}

impl Iterator for MultiIndex {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first {
            self.first = false;
            if self.shape.iter().any(|&dim| dim == 0) {
                return None;
            }
            return Some(self.current.clone());
        }
        for i in (0..self.current.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.shape[i] {
                return Some(self.current.clone());
            }
            self.current[i] = 0;
        }
        None
    }
}

/// Flat offset of the element addressed by per-group axis lists and coordinates.
fn build_index(strides: &[usize], axes: [&[usize]; 3], coords: [&[usize]; 3]) -> usize {
    axes.iter()
        .zip(coords.iter())
        .flat_map(|(axes, coords)| axes.iter().zip(coords.iter()))
        .map(|(&axis, &coord)| coord * strides[axis])
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_tensor(dims: &[usize], values: &[f32]) -> CpuTensor {
        literal_to_tensor(&TensorLiteral::from_f32(dims, values)).unwrap()
    }

    fn spec(dims: &[usize]) -> TensorSpec {
        TensorSpec::new(DType::F32, Shape::from_static(dims))
    }

    #[test]
    fn broadcast_repeats_size_one_axes() {
        let input = f32_tensor(&[2, 1], &[1.0, 2.0]);
        let out = op_broadcast_to(
            &[input],
            &spec(&[2, 3]),
            &BroadcastToSpec {
                result_shape: Shape::from_static(&[2, 3]),
            },
        )
        .unwrap();
        assert_eq!(f32_values(&out).unwrap(), &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn dynamic_slice_clamps_start() {
        let input = f32_tensor(&[4], &[0.0, 1.0, 2.0, 3.0]);
        let starts = literal_to_tensor(&TensorLiteral::from_i32(&[1], &[7])).unwrap();
        let out = op_dynamic_slice(
            &[input, starts],
            &spec(&[2]),
            &DynamicSliceSpec { sizes: vec![2] },
        )
        .unwrap();
        assert_eq!(f32_values(&out).unwrap(), &[2.0, 3.0]);
    }

    #[test]
    fn rng_is_a_function_of_the_key() {
        let key = |counter| literal_to_tensor(&TensorLiteral::from_i32(&[2], &[3, counter])).unwrap();
        let rng = RngUniformSpec {
            shape: Shape::from_static(&[8]),
            dtype: DType::F32,
        };
        let a = op_rng_uniform(&[key(0)], &spec(&[8]), &rng).unwrap();
        let b = op_rng_uniform(&[key(0)], &spec(&[8]), &rng).unwrap();
        let c = op_rng_uniform(&[key(1)], &spec(&[8]), &rng).unwrap();
        assert_eq!(f32_values(&a).unwrap(), f32_values(&b).unwrap());
        assert_ne!(f32_values(&a).unwrap(), f32_values(&c).unwrap());
        assert!(f32_values(&a).unwrap().iter().all(|v| (0.0..1.0).contains(v)));
    }
}
