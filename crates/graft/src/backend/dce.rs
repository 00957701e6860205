use std::collections::{HashMap, HashSet};

use crate::backend::spec::{Function, Operand, ValueId};

/// Outcome of [`eliminate_dead_code`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DceResult {
    pub erased_insts: usize,
    /// Indices (into the original parameter list) of parameters that are still referenced.
    pub live_params: Vec<usize>,
}

/// Removes instructions and parameters not reachable from the function results.
///
/// Unselected `default`/`if_present` branches are lowered eagerly and rely on this pass to
/// disappear from the executed program.
pub fn eliminate_dead_code(function: &mut Function) -> DceResult {
    let mut def_map: HashMap<ValueId, usize> = HashMap::with_capacity(function.body.len());
    for (idx, inst) in function.body.iter().enumerate() {
        def_map.insert(inst.id, idx);
    }

    let mut worklist: Vec<ValueId> = function.result_ids.clone();
    let mut live: HashSet<ValueId> = HashSet::new();
    while let Some(value) = worklist.pop() {
        if !live.insert(value) {
            continue;
        }
        let Some(&idx) = def_map.get(&value) else {
            continue;
        };
        for operand in &function.body[idx].operands {
            match operand {
                Operand::Value(dep) => worklist.push(*dep),
                Operand::Literal(_) => {}
            }
        }
    }

    let before = function.body.len();
    function.body.retain(|inst| live.contains(&inst.id));

    let mut live_params = Vec::new();
    let mut parameter_ids = Vec::new();
    let mut parameters = Vec::new();
    for (index, (id, spec)) in function
        .parameter_ids
        .iter()
        .zip(function.parameters.iter())
        .enumerate()
    {
        if live.contains(id) {
            live_params.push(index);
            parameter_ids.push(*id);
            parameters.push(spec.clone());
        }
    }
    function.parameter_ids = parameter_ids;
    function.parameters = parameters;

    DceResult {
        erased_insts: before.saturating_sub(function.body.len()),
        live_params,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{
        DType, ElementwiseBinaryOp, ElementwiseUnaryOp, Operation, ProgramBuilder, Shape,
        TensorSpec,
    };

    #[test]
    fn drops_unreachable_instructions_and_params() {
        let spec = TensorSpec::new(DType::F32, Shape::from_static(&[2]));
        let mut builder = ProgramBuilder::new();
        let a = builder.add_parameter(spec.clone());
        let unused = builder.add_parameter(spec.clone());
        let dead = builder.emit_single(
            Operation::ElementwiseUnary(ElementwiseUnaryOp::Exp),
            vec![Operand::Value(unused)],
            spec.clone(),
        );
        let live = builder.emit_single(
            Operation::ElementwiseBinary(ElementwiseBinaryOp::Add),
            vec![Operand::Value(a), Operand::Value(a)],
            spec,
        );
        let mut function = builder.finish("main", vec![live]).unwrap();

        let result = eliminate_dead_code(&mut function);
        assert_eq!(result.erased_insts, 1);
        assert_eq!(result.live_params, vec![0]);
        assert_eq!(function.parameter_ids, vec![a]);
        assert!(function.body.iter().all(|inst| inst.id != dead));
    }
}
