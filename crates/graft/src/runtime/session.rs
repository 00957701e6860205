//! Trace-once, run-many execution.
//!
//! A [`Session`] lowers the requested outputs for the current feed signature, caches the traced
//! program keyed by root identities and feed types, binds feeds and stored parameters to the
//! program inputs, and writes stateful results back into the store.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::backend::spec::{PortableBackend, TensorInit};
use crate::ops::functional::StateUpdate;
use crate::ops::graph::container::Container;
use crate::ops::graph::node::Node;
use crate::ops::graph::trace::{trace, FeedSignature, OutputSlot, ProgramInput, TracedProgram};
use crate::runtime::feeds::Feeds;
use crate::runtime::param_store::ParamStore;
use crate::tensor::Tensor;

/// Plans retained before least-recently-used eviction.
pub const DEFAULT_PLAN_CACHE_CAPACITY: usize = 32;

fn default_plan_cache_capacity() -> usize {
    DEFAULT_PLAN_CACHE_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionOptions {
    #[serde(default = "default_plan_cache_capacity")]
    pub plan_cache_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            plan_cache_capacity: DEFAULT_PLAN_CACHE_CAPACITY,
        }
    }
}

/// Results mirroring the requested container; absent values surface as `None`.
pub type Outputs = Container<Option<Tensor>>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct PlanKey(u128);

#[derive(Serialize)]
struct PlanSignature<'a> {
    roots: Vec<u64>,
    feeds: &'a FeedSignature,
}

impl PlanKey {
    fn new(roots: &[Node], feeds: &FeedSignature) -> Result<Self> {
        let signature = PlanSignature {
            roots: roots.iter().map(|root| root.id().0).collect(),
            feeds,
        };
        let bytes = serde_json::to_vec(&signature).context("failed to encode plan signature")?;
        let hash = blake3::hash(&bytes);
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&hash.as_bytes()[..16]);
        Ok(PlanKey(u128::from_le_bytes(raw)))
    }
}

pub struct Session<B: PortableBackend + 'static> {
    backend: Arc<B>,
    plans: Mutex<LruCache<PlanKey, Arc<TracedProgram>>>,
}

impl<B: PortableBackend + 'static> Session<B> {
    pub fn new(backend: Arc<B>) -> Self {
        let capacity = NonZeroUsize::new(DEFAULT_PLAN_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self::build(backend, capacity)
    }

    pub fn with_options(backend: Arc<B>, options: SessionOptions) -> Result<Self> {
        let capacity = NonZeroUsize::new(options.plan_cache_capacity)
            .ok_or_else(|| anyhow!("plan_cache_capacity must be positive"))?;
        Ok(Self::build(backend, capacity))
    }

    fn build(backend: Arc<B>, capacity: NonZeroUsize) -> Self {
        Self {
            backend,
            plans: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Number of traced programs currently cached.
    pub fn cached_plans(&self) -> usize {
        self.plans.lock().map(|plans| plans.len()).unwrap_or(0)
    }

    /// Traces `outputs` (and any state updates) for the feed types in `feeds`, reusing a cached
    /// plan when the same roots were traced for the same signature before.
    pub fn plan(
        &self,
        outputs: &Container<Node>,
        updates: &[StateUpdate],
        feeds: &Feeds,
    ) -> Result<Arc<TracedProgram>> {
        let roots = roots(outputs, updates);
        let signature = feeds.signature();
        let key = PlanKey::new(&roots, &signature)?;
        {
            let mut plans = self
                .plans
                .lock()
                .map_err(|_| anyhow!("plan cache lock poisoned"))?;
            if let Some(plan) = plans.get(&key) {
                log::trace!("plan cache hit ({:032x})", key.0);
                return Ok(Arc::clone(plan));
            }
        }

        log::debug!(
            "plan cache miss ({:032x}): tracing {} roots for {} feeds on {}",
            key.0,
            roots.len(),
            signature.len(),
            self.backend.backend_name()
        );
        let plan = Arc::new(trace(&roots, &signature)?);
        if crate::env::dump_program_enabled() {
            log::info!("traced program:\n{}", plan.program.to_text());
        }
        let mut plans = self
            .plans
            .lock()
            .map_err(|_| anyhow!("plan cache lock poisoned"))?;
        plans.put(key, Arc::clone(&plan));
        Ok(plan)
    }

    pub fn run(
        &self,
        outputs: &Container<Node>,
        feeds: &Feeds,
        store: &mut dyn ParamStore,
    ) -> Result<Outputs> {
        self.run_with_updates(outputs, &[], feeds, store)
    }

    /// Runs `outputs` and writes each present update back into its parameter slot.
    pub fn run_with_updates(
        &self,
        outputs: &Container<Node>,
        updates: &[StateUpdate],
        feeds: &Feeds,
        store: &mut dyn ParamStore,
    ) -> Result<Outputs> {
        let plan = self.plan(outputs, updates, feeds)?;

        let mut handles = Vec::with_capacity(plan.inputs.len());
        for input in &plan.inputs {
            let tensor = match input {
                ProgramInput::Feed(name) => feeds
                    .tensor(name)
                    .cloned()
                    .ok_or_else(|| anyhow!("feed `{name}` disappeared between trace and run"))?,
                ProgramInput::Param(decl) => store
                    .fetch(decl)
                    .with_context(|| format!("failed to fetch parameter `{}`", decl.name))?,
            };
            handles.push(
                self.backend
                    .materialize(TensorInit::Literal(tensor.to_literal()))?,
            );
        }

        let results = self.backend.run_program(&plan.program, &handles)?;
        let mut tensors = Vec::with_capacity(results.len());
        for handle in &results {
            tensors.push(Tensor::from_literal(&self.backend.to_literal(handle)?)?);
        }

        let leaf_count = outputs.leaves().len();
        let (output_slots, update_slots) = plan.outputs.split_at(leaf_count);
        let mut slots = output_slots.iter();
        let values = rebuild(outputs, &mut slots, &tensors)?;

        for (update, slot) in updates.iter().zip(update_slots) {
            match slot {
                OutputSlot::Result(index) => {
                    log::trace!("writing back state `{}`", update.param.name);
                    store.store(&update.param, tensors[*index].clone())?;
                }
                OutputSlot::Absent => {}
                OutputSlot::Tuple(_) => bail!("state update `{}` is a tuple", update.param.name),
            }
        }
        Ok(values)
    }
}

fn roots(outputs: &Container<Node>, updates: &[StateUpdate]) -> Vec<Node> {
    outputs
        .leaves()
        .into_iter()
        .cloned()
        .chain(updates.iter().map(|update| update.value.clone()))
        .collect()
}

fn slot_value(slot: &OutputSlot, tensors: &[Tensor]) -> Result<Outputs> {
    Ok(match slot {
        OutputSlot::Absent => Container::Leaf(None),
        OutputSlot::Result(index) => Container::Leaf(Some(
            tensors
                .get(*index)
                .cloned()
                .ok_or_else(|| anyhow!("program returned no result {index}"))?,
        )),
        OutputSlot::Tuple(items) => Container::Tuple(
            items
                .iter()
                .map(|item| slot_value(item, tensors))
                .collect::<Result<_>>()?,
        ),
    })
}

/// Replaces each leaf of `outputs` with the value of its slot. Tuple-valued leaves expand into
/// nested tuples.
fn rebuild<'a>(
    outputs: &Container<Node>,
    slots: &mut impl Iterator<Item = &'a OutputSlot>,
    tensors: &[Tensor],
) -> Result<Outputs> {
    match outputs {
        Container::Leaf(_) => {
            let slot = slots
                .next()
                .ok_or_else(|| anyhow!("traced program has fewer outputs than requested"))?;
            slot_value(slot, tensors)
        }
        Container::Tuple(items) => Ok(Container::Tuple(
            items
                .iter()
                .map(|item| rebuild(item, slots, tensors))
                .collect::<Result<_>>()?,
        )),
        Container::Map(entries) => Ok(Container::Map(
            entries
                .iter()
                .map(|(key, item)| Ok::<_, anyhow::Error>((key.clone(), rebuild(item, slots, tensors)?)))
                .collect::<Result<_>>()?,
        )),
    }
}
