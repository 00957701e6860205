use std::collections::HashMap;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::backend::spec::DType;
use crate::params::{base_param_id, BaseParamId, Initializer, ParamDecl};
use crate::tensor::Tensor;

/// Owner of parameter values. The session fetches every parameter a program reads and stores
/// advanced state after a run.
pub trait ParamStore {
    /// Returns the current value, initializing it from the declaration on first use.
    fn fetch(&mut self, decl: &ParamDecl) -> Result<Tensor>;

    fn store(&mut self, decl: &ParamDecl, value: Tensor) -> Result<()>;
}

/// Host-memory store keyed by [`BaseParamId`], initializing lazily from a seeded RNG.
pub struct InMemoryParamStore {
    values: HashMap<BaseParamId, (String, Tensor)>,
    rng: StdRng,
}

impl Default for InMemoryParamStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl InMemoryParamStore {
    pub fn new(seed: u64) -> Self {
        Self {
            values: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.values
            .get(&base_param_id(name))
            .map(|(_, tensor)| tensor)
    }

    /// Overrides or preloads a value by fully qualified name.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        let name = name.into();
        self.values
            .insert(base_param_id(&name), (name, tensor));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.values().map(|(name, _)| name.as_str())
    }

    fn initialize(&mut self, decl: &ParamDecl) -> Result<Tensor> {
        let shape = decl.shape.as_slice();
        let tensor = match (&decl.initializer, decl.dtype) {
            (Initializer::Zeros, DType::F32) => Tensor::zeros(shape),
            (Initializer::Ones, DType::F32) => Tensor::ones(shape),
            (Initializer::Constant { value }, DType::F32) => Tensor::filled(shape, *value),
            (Initializer::Normal { std }, DType::F32) => Tensor::randn(shape, *std, &mut self.rng),
            (Initializer::RngKey { seed }, DType::Si32) => Tensor::from_i32(shape, vec![*seed, 0])?,
            (initializer, dtype) => {
                bail!(
                    "parameter `{}`: initializer {initializer:?} cannot produce {dtype:?}",
                    decl.name
                )
            }
        };
        log::trace!("initialized parameter `{}` {}", decl.name, tensor.spec());
        Ok(tensor)
    }

    fn check(decl: &ParamDecl, tensor: &Tensor) -> Result<()> {
        if tensor.dtype() != decl.dtype || tensor.shape() != decl.shape.as_slice() {
            bail!(
                "parameter `{}` holds {}, declaration expects {}",
                decl.name,
                tensor.spec(),
                decl.spec()
            );
        }
        Ok(())
    }
}

impl ParamStore for InMemoryParamStore {
    fn fetch(&mut self, decl: &ParamDecl) -> Result<Tensor> {
        if let Some((_, tensor)) = self.values.get(&decl.id()) {
            Self::check(decl, tensor)?;
            return Ok(tensor.clone());
        }
        let tensor = self.initialize(decl)?;
        self.values
            .insert(decl.id(), (decl.name.clone(), tensor.clone()));
        Ok(tensor)
    }

    fn store(&mut self, decl: &ParamDecl, value: Tensor) -> Result<()> {
        Self::check(decl, &value)?;
        self.values.insert(decl.id(), (decl.name.clone(), value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(name: &str, initializer: Initializer, dtype: DType, shape: Vec<usize>) -> ParamDecl {
        ParamDecl {
            name: name.into(),
            shape,
            initializer,
            dtype,
        }
    }

    #[test]
    fn rng_key_starts_at_counter_zero() {
        let mut store = InMemoryParamStore::default();
        let key = decl("rng", Initializer::RngKey { seed: 9 }, DType::Si32, vec![2]);
        let value = store.fetch(&key).unwrap();
        assert_eq!(value.as_i32().unwrap(), &[9, 0]);
        assert_eq!(store.get("rng"), Some(&value));
    }

    #[test]
    fn normal_init_is_reproducible_per_seed() {
        let w = decl("w", Initializer::Normal { std: 0.02 }, DType::F32, vec![3, 4]);
        let a = InMemoryParamStore::new(5).fetch(&w).unwrap();
        let b = InMemoryParamStore::new(5).fetch(&w).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn store_rejects_wrong_shape() {
        let mut store = InMemoryParamStore::default();
        let w = decl("w", Initializer::Ones, DType::F32, vec![4]);
        assert!(store.store(&w, Tensor::ones(&[3])).is_err());
        store.insert("w", Tensor::ones(&[3]));
        assert!(store.fetch(&w).is_err());
    }
}
