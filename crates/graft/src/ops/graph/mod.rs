//! Symbolic graph core: nodes, presence combinators, containers, and lowering.

pub mod container;
pub mod dims;
mod infer;
pub mod node;
pub mod optional;
pub mod trace;

pub use container::{append, maybe_container, output, unwrap_tuple, Container};
pub use dims::{DimExpr, DimRef};
pub use node::{Node, NodeId, NodeType, Op};
pub use optional::{default, if_present};
pub use trace::{trace, FeedSignature, OutputSlot, ProgramInput, TracedProgram};
