//! Host-backed tensor used for feeds, parameter values, and results.

use anyhow::{bail, ensure, Result};
use rand::Rng;
use std::sync::Arc;

use crate::backend::spec::{DType, Shape, TensorLiteral, TensorSpec};

#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    F32(Vec<f32>),
    Si32(Vec<i32>),
    Bool(Vec<bool>),
}

impl HostData {
    fn len(&self) -> usize {
        match self {
            HostData::F32(values) => values.len(),
            HostData::Si32(values) => values.len(),
            HostData::Bool(values) => values.len(),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            HostData::F32(_) => DType::F32,
            HostData::Si32(_) => DType::Si32,
            HostData::Bool(_) => DType::I1,
        }
    }
}

/// Dense row-major tensor living in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: HostData,
}

impl Tensor {
    fn checked(shape: &[usize], data: HostData) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape
            );
        }
        Ok(Tensor {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Constructs an `F32` tensor, validating the length against the shape.
    pub fn from_f32(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        Self::checked(shape, HostData::F32(data))
    }

    pub fn from_i32(shape: &[usize], data: Vec<i32>) -> Result<Self> {
        Self::checked(shape, HostData::Si32(data))
    }

    pub fn from_bool(shape: &[usize], data: Vec<bool>) -> Result<Self> {
        Self::checked(shape, HostData::Bool(data))
    }

    pub fn scalar_f32(value: f32) -> Self {
        Tensor {
            shape: Vec::new(),
            data: HostData::F32(vec![value]),
        }
    }

    pub fn scalar_bool(value: bool) -> Self {
        Tensor {
            shape: Vec::new(),
            data: HostData::Bool(vec![value]),
        }
    }

    pub fn filled(shape: &[usize], value: f32) -> Self {
        let len = shape.iter().product();
        Tensor {
            shape: shape.to_vec(),
            data: HostData::F32(vec![value; len]),
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::filled(shape, 1.0)
    }

    /// Samples from `N(0, std^2)` using the Box-Muller transform.
    pub fn randn(shape: &[usize], std: f32, rng: &mut impl Rng) -> Self {
        let len: usize = shape.iter().product();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        Tensor {
            shape: shape.to_vec(),
            data: HostData::F32(values),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &HostData {
        &self.data
    }

    pub fn spec(&self) -> TensorSpec {
        TensorSpec::new(self.dtype(), Shape::from_static(&self.shape))
    }

    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            HostData::F32(values) => Ok(values),
            other => bail!("tensor holds {:?}, not F32", other.dtype()),
        }
    }

    pub fn as_i32(&self) -> Result<&[i32]> {
        match &self.data {
            HostData::Si32(values) => Ok(values),
            other => bail!("tensor holds {:?}, not Si32", other.dtype()),
        }
    }

    pub fn as_bool(&self) -> Result<&[bool]> {
        match &self.data {
            HostData::Bool(values) => Ok(values),
            other => bail!("tensor holds {:?}, not I1", other.dtype()),
        }
    }

    pub fn to_literal(&self) -> TensorLiteral {
        match &self.data {
            HostData::F32(values) => TensorLiteral::from_f32(&self.shape, values),
            HostData::Si32(values) => TensorLiteral::from_i32(&self.shape, values),
            HostData::Bool(values) => TensorLiteral::from_bool(&self.shape, values),
        }
    }

    pub fn from_literal(literal: &TensorLiteral) -> Result<Self> {
        let Some(shape) = literal.spec.shape.static_dims() else {
            bail!("literal shape {} is not static", literal.spec.shape);
        };
        let bytes: Arc<[u8]> = Arc::clone(&literal.bytes);
        let data = match literal.spec.dtype {
            DType::F32 => {
                ensure!(bytes.len() % 4 == 0, "literal byte length mismatches f32");
                HostData::F32(
                    bytes
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )
            }
            DType::Si32 => {
                ensure!(bytes.len() % 4 == 0, "literal byte length mismatches si32");
                HostData::Si32(
                    bytes
                        .chunks_exact(4)
                        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )
            }
            DType::I1 => HostData::Bool(bytes.iter().map(|&b| b != 0).collect()),
        };
        Self::checked(&shape, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn literal_conversion_preserves_values() {
        let tensor = Tensor::from_i32(&[2, 2], vec![1, -2, 3, -4]).unwrap();
        let back = Tensor::from_literal(&tensor.to_literal()).unwrap();
        assert_eq!(back, tensor);
    }

    #[test]
    fn rejects_mismatched_length() {
        assert!(Tensor::from_f32(&[2, 3], vec![0.0; 5]).is_err());
    }

    #[test]
    fn randn_fills_requested_length() {
        let mut rng = StdRng::seed_from_u64(7);
        let tensor = Tensor::randn(&[3, 3], 0.02, &mut rng);
        assert_eq!(tensor.len(), 9);
        assert!(tensor.as_f32().unwrap().iter().all(|v| v.abs() < 1.0));
    }
}
