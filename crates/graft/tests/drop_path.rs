mod common;

use anyhow::Result;
use graft::backend::spec::{DType, Operation, Shape, TensorSpec};
use graft::config::DropPathOptions;
use graft::nn::DropPath;
use graft::ops::graph::output;
use graft::params::ParamScope;
use graft::{Feeds, InMemoryParamStore, Node, Tensor};

use common::{session, tensor};

fn activations() -> Node {
    Node::input("x", TensorSpec::new(DType::F32, Shape::from_static(&[16, 4])))
}

fn training() -> Node {
    Node::optional_input("training", TensorSpec::new(DType::I1, Shape::scalar()))
}

fn key_of(store: &InMemoryParamStore) -> Vec<i32> {
    store
        .get("block.rng")
        .expect("rng key stored")
        .as_i32()
        .expect("si32 key")
        .to_vec()
}

#[test]
fn training_drops_examples_and_advances_key() -> Result<()> {
    let (_, session) = session();
    let layer = DropPath::new(
        ParamScope::root().child("block")?,
        DropPathOptions { rate: 0.5, seed: 7 },
    )?;
    let (y, update) = layer.forward(&activations(), &training())?;
    let updates: Vec<_> = update.into_iter().collect();
    let outputs = output([("y", y)]);
    let mut store = InMemoryParamStore::default();
    let feeds = Feeds::new()
        .with("x", Tensor::ones(&[16, 4]))
        .with("training", Tensor::scalar_bool(true));

    let first = session.run_with_updates(&outputs, &updates, &feeds, &mut store)?;
    assert_eq!(key_of(&store), vec![7, 1]);
    let second = session.run_with_updates(&outputs, &updates, &feeds, &mut store)?;
    assert_eq!(key_of(&store), vec![7, 2]);

    for result in [&first, &second] {
        for example in tensor(result, "y").as_f32()?.chunks(4) {
            // Whole examples are either dropped or rescaled by 1 / keep_prob.
            assert!(example.iter().all(|&v| v == 0.0) || example.iter().all(|&v| v == 2.0));
        }
    }
    assert_ne!(tensor(&first, "y"), tensor(&second, "y"));
    Ok(())
}

#[test]
fn inference_is_identity_and_keeps_key() -> Result<()> {
    let (_, session) = session();
    let layer = DropPath::new(
        ParamScope::root().child("block")?,
        DropPathOptions { rate: 0.3, seed: 1 },
    )?;
    let (y, update) = layer.forward(&activations(), &training())?;
    let updates: Vec<_> = update.into_iter().collect();
    let outputs = output([("y", y)]);
    let input = Tensor::filled(&[16, 4], 0.5);
    let mut store = InMemoryParamStore::default();

    let off = Feeds::new()
        .with("x", input.clone())
        .with("training", Tensor::scalar_bool(false));
    let result = session.run_with_updates(&outputs, &updates, &off, &mut store)?;
    assert_eq!(tensor(&result, "y"), &input);
    assert_eq!(key_of(&store), vec![1, 0]);

    let unspecified = Feeds::new().with("x", input.clone());
    let result = session.run_with_updates(&outputs, &updates, &unspecified, &mut store)?;
    assert_eq!(tensor(&result, "y"), &input);
    assert_eq!(key_of(&store), vec![1, 0]);
    Ok(())
}

#[test]
fn zero_rate_emits_no_random_draw() -> Result<()> {
    let (backend, session) = session();
    let scope = ParamScope::root().child("block")?;
    let layer = DropPath::new(scope, DropPathOptions::default())?;
    let (y, update) = layer.forward(&activations(), &training())?;
    assert!(update.is_none());

    let feeds = Feeds::new()
        .with("x", Tensor::ones(&[16, 4]))
        .with("training", Tensor::scalar_bool(true));
    let mut store = InMemoryParamStore::default();
    let result = session.run(&output([("y", y)]), &feeds, &mut store)?;
    assert_eq!(tensor(&result, "y"), &Tensor::ones(&[16, 4]));
    assert_eq!(
        backend.count_ops(|op| matches!(op, Operation::RngUniform(_))),
        0
    );
    assert!(store.is_empty());
    Ok(())
}
