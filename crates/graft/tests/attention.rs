mod common;

use anyhow::Result;
use graft::backend::spec::{DType, Shape, TensorSpec};
use graft::config::{AttentionOptions, RelativePositionOptions};
use graft::nn::{AttentionCache, AttentionInputs, MultiHeadAttention};
use graft::ops::functional::{attention_bias, attention_weights, MASKED_BIAS};
use graft::ops::graph::output;
use graft::params::ParamScope;
use graft::{Feeds, InMemoryParamStore, Node, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

use common::{assert_close, is_absent, session, tensor};

fn f32_input(name: &str, dims: &[usize]) -> Node {
    Node::input(name, TensorSpec::new(DType::F32, Shape::from_static(dims)))
}

fn optional_f32_input(name: &str, dims: &[usize]) -> Node {
    Node::optional_input(name, TensorSpec::new(DType::F32, Shape::from_static(dims)))
}

#[test]
fn mask_becomes_additive_bias() -> Result<()> {
    let (_, session) = session();
    let mask = optional_f32_input("mask", &[2, 3]);
    let outputs = output([("bias", attention_bias(&mask)?)]);
    let mut store = InMemoryParamStore::default();

    let feeds = Feeds::new().with(
        "mask",
        Tensor::from_f32(&[2, 3], vec![1.0, 1.0, 0.0, 1.0, 0.0, 0.0])?,
    );
    let result = session.run(&outputs, &feeds, &mut store)?;
    let bias = tensor(&result, "bias");
    assert_eq!(bias.shape(), &[2, 1, 1, 3]);
    assert_eq!(
        bias.as_f32()?,
        &[0.0, 0.0, MASKED_BIAS, 0.0, MASKED_BIAS, MASKED_BIAS]
    );

    let result = session.run(&outputs, &Feeds::new().absent("mask"), &mut store)?;
    let bias = tensor(&result, "bias");
    assert!(bias.shape().is_empty());
    assert_eq!(bias.as_f32()?, &[0.0]);
    Ok(())
}

#[test]
fn weights_are_row_stochastic() -> Result<()> {
    let (_, session) = session();
    let dims = [2, 3, 4, 8];
    let query = f32_input("query", &dims);
    let key = f32_input("key", &dims);
    let weights = attention_weights(&query, &key, &attention_bias(&Node::absent())?, true)?;
    let outputs = output([("weights", weights)]);

    let mut rng = StdRng::seed_from_u64(11);
    let feeds = Feeds::new()
        .with("query", Tensor::randn(&dims, 1.0, &mut rng))
        .with("key", Tensor::randn(&dims, 1.0, &mut rng));
    let result = session.run(&outputs, &feeds, &mut InMemoryParamStore::default())?;
    let weights = tensor(&result, "weights");
    assert_eq!(weights.shape(), &[2, 4, 3, 3]);
    for row in weights.as_f32()?.chunks(3) {
        assert!(row.iter().all(|&w| w >= 0.0));
        assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn masked_keys_receive_no_weight() -> Result<()> {
    let (_, session) = session();
    let mut options = AttentionOptions::new(4);
    options.output_weights = true;
    let layer = MultiHeadAttention::new(ParamScope::root().child("attn")?, options)?;
    let hidden = f32_input("hidden", &[2, 3, 16]);
    let mask = optional_f32_input("mask", &[2, 3]);
    let outputs = layer.forward(&AttentionInputs::new(hidden).with_mask(mask))?;

    let mut rng = StdRng::seed_from_u64(3);
    let hidden_value = Tensor::randn(&[2, 3, 16], 1.0, &mut rng);
    let mut store = InMemoryParamStore::new(5);

    let feeds = Feeds::new().with("hidden", hidden_value.clone()).with(
        "mask",
        Tensor::from_f32(&[2, 3], vec![1.0, 1.0, 1.0, 1.0, 1.0, 0.0])?,
    );
    let masked = session.run(&outputs, &feeds, &mut store)?;
    assert_eq!(tensor(&masked, "output").shape(), &[2, 3, 16]);
    let weights = tensor(&masked, "weights").as_f32()?;
    // Batch 1 occupies the second half; its last key column is masked.
    for row in weights[weights.len() / 2..].chunks(3) {
        assert!(row[2].abs() < 1e-12);
    }

    let feeds = Feeds::new().with("hidden", hidden_value);
    let unmasked = session.run(&outputs, &feeds, &mut store)?;
    let weights = tensor(&unmasked, "weights").as_f32()?;
    assert!(weights[weights.len() / 2..].chunks(3).all(|row| row[2] > 0.0));
    // Batch 0 saw no masking either way.
    assert_close(
        &tensor(&unmasked, "output").as_f32()?[..48],
        &tensor(&masked, "output").as_f32()?[..48],
        1e-5,
    );
    assert_eq!(session.cached_plans(), 2);
    Ok(())
}

#[test]
fn weights_are_absent_unless_requested() -> Result<()> {
    let (_, session) = session();
    let layer = MultiHeadAttention::new(ParamScope::root(), AttentionOptions::new(2))?;
    let outputs = layer.forward(&AttentionInputs::new(f32_input("hidden", &[1, 2, 8])))?;
    let feeds = Feeds::new().with("hidden", Tensor::ones(&[1, 2, 8]));
    let result = session.run(&outputs, &feeds, &mut InMemoryParamStore::default())?;
    assert!(is_absent(&result, "weights"));
    assert_eq!(tensor(&result, "output").shape(), &[1, 2, 8]);
    Ok(())
}

#[test]
fn cached_decode_step_matches_full_sequence() -> Result<()> {
    let (_, session) = session();
    let mut options = AttentionOptions::new(2);
    options.relative_position = Some(RelativePositionOptions::new(2));
    let layer = MultiHeadAttention::new(ParamScope::root().child("self_attention")?, options)?;
    let mut store = InMemoryParamStore::new(17);

    let mut rng = StdRng::seed_from_u64(23);
    let full = Tensor::randn(&[1, 5, 8], 1.0, &mut rng);
    let values = full.as_f32()?;
    let prefix = Tensor::from_f32(&[1, 4, 8], values[..32].to_vec())?;
    let step = Tensor::from_f32(&[1, 1, 8], values[32..].to_vec())?;

    let full_graph = layer.forward(&AttentionInputs::new(f32_input("hidden", &[1, 5, 8])))?;
    let expected = session.run(&full_graph, &Feeds::new().with("hidden", full), &mut store)?;

    let prefix_graph = layer.forward(&AttentionInputs::new(f32_input("prefix", &[1, 4, 8])))?;
    let prefix_out = session.run(&prefix_graph, &Feeds::new().with("prefix", prefix), &mut store)?;
    let cache_entry = prefix_out.get("cache").expect("cache returned");
    let past = |index: usize| {
        cache_entry
            .index(index)
            .and_then(|entry| entry.as_leaf())
            .and_then(|value| value.clone())
            .expect("cached tensor present")
    };
    let (past_key, past_value) = (past(0), past(1));
    assert_eq!(past_key.shape(), &[1, 4, 2, 4]);

    let cache = AttentionCache::new(
        f32_input("past_key", &[1, 4, 2, 4]),
        f32_input("past_value", &[1, 4, 2, 4]),
    )?;
    let offset = Node::input("offset", TensorSpec::new(DType::Si32, Shape::scalar()));
    let step_graph = layer.forward(
        &AttentionInputs::new(f32_input("step", &[1, 1, 8]))
            .with_cache(&cache)
            .with_position_offset(offset),
    )?;
    let feeds = Feeds::new()
        .with("step", step)
        .with("past_key", past_key)
        .with("past_value", past_value)
        .with("offset", Tensor::from_i32(&[], vec![4])?);
    let decoded = session.run(&step_graph, &feeds, &mut store)?;

    assert_eq!(tensor(&decoded, "position_bias").shape(), &[1, 2, 1, 5]);
    assert_close(
        tensor(&decoded, "output").as_f32()?,
        &tensor(&expected, "output").as_f32()?[32..],
        1e-4,
    );
    Ok(())
}
