#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use graft::backend::spec::{
    BackendResult, Function, Instruction, Operation, PortableBackend, Program, TensorInit,
    TensorLiteral,
};
use graft::runtime::Outputs;
use graft::{Session, Tensor};
use graft_backend_ref_cpu::CpuPortableBackend;

/// Reference CPU backend that remembers every program it was asked to run.
#[derive(Default)]
pub struct RecordingBackend {
    inner: CpuPortableBackend,
    programs: Mutex<Vec<Program>>,
    runs: AtomicUsize,
}

impl RecordingBackend {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_program(&self) -> Program {
        self.programs
            .lock()
            .expect("backend mutex poisoned")
            .last()
            .cloned()
            .expect("backend should record a program")
    }

    pub fn last_entry_function(&self) -> Function {
        let program = self.last_program();
        program
            .entry_function()
            .cloned()
            .expect("entry function present")
    }

    /// Number of instructions in the last program for which `pred` holds.
    pub fn count_ops(&self, pred: impl Fn(&Operation) -> bool) -> usize {
        self.last_entry_function()
            .body
            .iter()
            .filter(|instruction| pred(&instruction.op))
            .count()
    }
}

type CpuHandle = <CpuPortableBackend as PortableBackend>::TensorHandle;

impl PortableBackend for RecordingBackend {
    type TensorHandle = CpuHandle;

    fn backend_name(&self) -> &str {
        "cpu-recording"
    }

    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle> {
        self.inner.materialize(init)
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        self.inner.to_literal(tensor)
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Self::TensorHandle> {
        self.inner.execute_instruction(instruction, inputs)
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.programs
            .lock()
            .expect("backend mutex poisoned")
            .push(program.clone());
        self.inner.run_program(program, entry_inputs)
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn session() -> (Arc<RecordingBackend>, Session<RecordingBackend>) {
    init_logging();
    let backend = Arc::new(RecordingBackend::default());
    let session = Session::new(Arc::clone(&backend));
    (backend, session)
}

/// Present tensor stored under `key` in a mapping result.
pub fn tensor<'a>(outputs: &'a Outputs, key: &str) -> &'a Tensor {
    outputs
        .get(key)
        .and_then(|entry| entry.as_leaf())
        .and_then(|value| value.as_ref())
        .unwrap_or_else(|| panic!("output `{key}` should be present"))
}

pub fn is_absent(outputs: &Outputs, key: &str) -> bool {
    matches!(outputs.get(key).and_then(|entry| entry.as_leaf()), Some(None))
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol,
            "element {index}: {a} vs {e} (tolerance {tol})"
        );
    }
}
