//! Parameter declarations.
//!
//! A parameter is a named, initializer-bound slot whose shape is derived from the shapes of the
//! inputs it will be combined with. The graph only records the declaration; a
//! [`crate::runtime::ParamStore`] materializes and persists values.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::backend::spec::{DType, Dimension, Shape, TensorSpec};
use crate::error::GraphError;
use crate::ops::graph::node::{Node, NodeType, Op};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct BaseParamId(pub u128);

/// Stable id derived from the fully qualified parameter name.
pub fn base_param_id(name: &str) -> BaseParamId {
    let hash = blake3::hash(name.as_bytes());
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&hash.as_bytes()[..16]);
    BaseParamId(u128::from_le_bytes(raw))
}

/// How a store fills a parameter the first time it is requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Initializer {
    Zeros,
    Ones,
    Constant { value: f32 },
    Normal { std: f32 },
    /// Counter-based PRNG key `[seed, 0]`.
    RngKey { seed: i32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDecl {
    pub name: String,
    pub shape: Vec<usize>,
    pub initializer: Initializer,
    pub dtype: DType,
}

impl ParamDecl {
    pub fn id(&self) -> BaseParamId {
        base_param_id(&self.name)
    }

    pub fn spec(&self) -> TensorSpec {
        TensorSpec::new(self.dtype, Shape::from_static(&self.shape))
    }
}

/// Extent of `axis` (negative counts from the end), failing when it is not static.
pub fn static_dim(shape: &Shape, axis: isize) -> Result<usize> {
    let rank = shape.rank() as isize;
    let resolved = if axis < 0 { axis + rank } else { axis };
    if resolved < 0 || resolved >= rank {
        return Err(anyhow!("axis {axis} is out of range for shape {shape}"));
    }
    match &shape.dims()[resolved as usize] {
        Dimension::Static(value) => Ok(*value),
        Dimension::Dynamic(sym) => Err(anyhow!(
            "axis {axis} of shape {shape} is dynamic (`{}`)",
            sym.as_str()
        )),
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    let reason = if segment.is_empty() {
        Some("segments must be non-empty")
    } else if segment.contains('.') {
        Some("segments may not contain '.'")
    } else if !segment.is_ascii() {
        Some("segments must be ASCII")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(GraphError::InvalidParamName {
            name: segment.to_string(),
            reason: reason.to_string(),
        }
        .into()),
        None => Ok(()),
    }
}

/// Hierarchical namespace enforcing unique parameter names within one model.
#[derive(Clone)]
pub struct ParamScope {
    prefix: Vec<String>,
    seen: Arc<Mutex<HashSet<String>>>,
}

impl Default for ParamScope {
    fn default() -> Self {
        Self::root()
    }
}

impl ParamScope {
    pub fn root() -> Self {
        Self {
            prefix: Vec::new(),
            seen: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Nested scope sharing the uniqueness registry.
    pub fn child(&self, segment: &str) -> Result<Self> {
        validate_segment(segment)?;
        let mut prefix = self.prefix.clone();
        prefix.push(segment.to_string());
        Ok(Self {
            prefix,
            seen: Arc::clone(&self.seen),
        })
    }

    pub fn qualified(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.prefix.join("."))
        }
    }

    fn register(&self, name: &str) -> Result<String> {
        validate_segment(name)?;
        let full = self.qualified(name);
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| anyhow!("parameter registry lock poisoned"))?;
        if !seen.insert(full.clone()) {
            return Err(GraphError::DuplicateParam(full).into());
        }
        Ok(full)
    }

    /// Declares an f32 parameter whose shape is computed from `inputs`.
    ///
    /// `shape_fn` runs exactly once, here; it must produce concrete extents from the
    /// construction-time shapes or the declaration fails.
    pub fn param<F>(
        &self,
        name: &str,
        inputs: &[&Node],
        shape_fn: F,
        initializer: Initializer,
    ) -> Result<Node>
    where
        F: FnOnce(&[&Shape]) -> Result<Vec<usize>>,
    {
        let full = self.register(name)?;
        let mut shapes = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            match input.ty() {
                NodeType::Tensor(spec) => shapes.push(&spec.shape),
                NodeType::Tuple(_) => {
                    return Err(GraphError::ParamShape {
                        name: full,
                        reason: format!("input {index} is a tuple"),
                    }
                    .into())
                }
                NodeType::Absent => {
                    return Err(GraphError::ParamShape {
                        name: full,
                        reason: format!("input {index} is statically absent"),
                    }
                    .into())
                }
            }
        }
        let shape = shape_fn(&shapes).map_err(|err| GraphError::ParamShape {
            name: full.clone(),
            reason: format!("{err:#}"),
        })?;
        Ok(Self::declare(ParamDecl {
            name: full,
            shape,
            initializer,
            dtype: DType::F32,
        }))
    }

    /// Declares a parameter with a fixed shape.
    pub fn param_with_shape(
        &self,
        name: &str,
        shape: &[usize],
        initializer: Initializer,
    ) -> Result<Node> {
        let shape = shape.to_vec();
        self.param(name, &[], move |_| Ok(shape), initializer)
    }

    /// Declares a `[seed, counter]` PRNG key slot.
    pub fn rng_key(&self, name: &str, seed: i32) -> Result<Node> {
        let full = self.register(name)?;
        Ok(Self::declare(ParamDecl {
            name: full,
            shape: vec![2],
            initializer: Initializer::RngKey { seed },
            dtype: DType::Si32,
        }))
    }

    fn declare(decl: ParamDecl) -> Node {
        let spec = decl.spec();
        log::trace!("declared parameter `{}` {}", decl.name, spec);
        Node::new(Op::Param(Arc::new(decl)), Vec::new(), NodeType::Tensor(spec))
    }
}
