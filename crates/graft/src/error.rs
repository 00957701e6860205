//! Construction-time error taxonomy.
//!
//! Builders return `anyhow::Result`; every contract violation detected while a graph is being
//! assembled is raised immediately as one of these variants so callers can
//! `downcast_ref::<GraphError>()` to distinguish caller bugs from execution faults
//! ([`crate::backend::spec::BackendError`]).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("unknown option `{key}` for {op} (recognized: {expected})")]
    UnknownOption {
        op: &'static str,
        key: String,
        expected: String,
    },
    #[error("invalid options for {op}: {reason}")]
    InvalidOptions { op: &'static str, reason: String },
    #[error("containers are not structurally compatible at `{path}`: {reason}")]
    StructureMismatch { path: String, reason: String },
    #[error("cannot evaluate shape of parameter `{name}`: {reason}")]
    ParamShape { name: String, reason: String },
    #[error("duplicate parameter `{0}`")]
    DuplicateParam(String),
    #[error("invalid parameter name `{name}`: {reason}")]
    InvalidParamName { name: String, reason: String },
    #[error("{op}: {reason}")]
    InvalidArgument { op: &'static str, reason: String },
    #[error("{op}: shape mismatch: {reason}")]
    ShapeMismatch { op: &'static str, reason: String },
}

impl GraphError {
    pub(crate) fn invalid_argument(op: &'static str, reason: impl Into<String>) -> Self {
        GraphError::InvalidArgument {
            op,
            reason: reason.into(),
        }
    }

    pub(crate) fn structure(path: impl Into<String>, reason: impl Into<String>) -> Self {
        GraphError::StructureMismatch {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
