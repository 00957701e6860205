//! Reference CPU backend for graft.
//!
//! Interprets lowered programs instruction by instruction over row-major host buffers. It favours
//! clarity over speed and serves as the ground truth for other backends and for tests.

pub mod cpu;

pub use cpu::{CpuPortableBackend, CpuTensor, TensorData};
