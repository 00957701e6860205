mod common;

use std::sync::Arc;

use anyhow::Result;
use graft::backend::spec::{DType, Shape, TensorSpec};
use graft::config::{AttentionOptions, DenseOptions, OptionsRecord, RmsNormOptions};
use graft::nn::Dense;
use graft::ops::graph::output;
use graft::params::ParamScope;
use graft::runtime::SessionOptions;
use graft::{Feeds, GraphError, InMemoryParamStore, Node, Session, Tensor};
use serde_json::json;

use common::{session, tensor, RecordingBackend};

fn dense_graph() -> Result<(Node, Dense)> {
    let layer = Dense::new(ParamScope::root().child("proj")?, DenseOptions::new(2))?;
    let x = Node::input("x", TensorSpec::new(DType::F32, Shape::from_static(&[1, 3])));
    Ok((layer.forward(&x)?, layer))
}

#[test]
fn repeated_runs_reuse_the_plan() -> Result<()> {
    let (backend, session) = session();
    let (y, _layer) = dense_graph()?;
    let outputs = output([("y", y)]);
    let mut store = InMemoryParamStore::new(4);
    let feeds = Feeds::new().with("x", Tensor::ones(&[1, 3]));

    let first = session.run(&outputs, &feeds, &mut store)?;
    let second = session.run(&outputs, &feeds, &mut store)?;
    assert_eq!(tensor(&first, "y"), tensor(&second, "y"));
    assert_eq!(session.cached_plans(), 1);
    assert_eq!(backend.runs(), 2);
    assert_eq!(store.len(), 2);
    Ok(())
}

#[test]
fn stored_parameters_drive_the_result() -> Result<()> {
    let (_, session) = session();
    let (y, _layer) = dense_graph()?;
    let outputs = output([("y", y)]);
    let mut store = InMemoryParamStore::default();
    store.insert("proj.weight", Tensor::from_f32(&[3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0])?);
    store.insert("proj.bias", Tensor::from_f32(&[2], vec![0.5, -0.5])?);

    let feeds = Feeds::new().with("x", Tensor::from_f32(&[1, 3], vec![1.0, 2.0, 3.0])?);
    let result = session.run(&outputs, &feeds, &mut store)?;
    assert_eq!(tensor(&result, "y").as_f32()?, &[4.5, 4.5]);
    Ok(())
}

#[test]
fn plan_cache_evicts_least_recently_used() -> Result<()> {
    common::init_logging();
    let backend = Arc::new(RecordingBackend::default());
    let session = Session::with_options(
        Arc::clone(&backend),
        SessionOptions {
            plan_cache_capacity: 1,
        },
    )?;
    let x = Node::optional_input("x", TensorSpec::new(DType::F32, Shape::from_static(&[2])));
    let outputs = output([("x", x)]);
    let mut store = InMemoryParamStore::default();
    let present = Feeds::new().with("x", Tensor::ones(&[2]));

    session.run(&outputs, &present, &mut store)?;
    session.run(&outputs, &Feeds::new(), &mut store)?;
    session.run(&outputs, &present, &mut store)?;
    assert_eq!(session.cached_plans(), 1);
    assert_eq!(backend.runs(), 3);
    Ok(())
}

#[test]
fn missing_required_feed_is_reported() -> Result<()> {
    let (backend, session) = session();
    let (y, _layer) = dense_graph()?;
    let err = session
        .run(&output([("y", y)]), &Feeds::new(), &mut InMemoryParamStore::default())
        .unwrap_err();
    assert!(format!("{err:#}").contains("missing feed for required input `x`"));
    assert_eq!(backend.runs(), 0);
    Ok(())
}

#[test]
fn unknown_option_keys_are_rejected() {
    let err = RmsNormOptions::from_options(json!({ "epsilon": 1e-5, "scale": true })).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GraphError>(),
        Some(GraphError::UnknownOption { key, .. }) if key == "scale"
    ));

    let attention = AttentionOptions::from_options(json!({ "num_heads": 4, "output_weights": true }))
        .expect("known keys parse");
    assert!(attention.output_weights);
    assert!(attention.scale_query);

    assert!(serde_json::from_value::<SessionOptions>(json!({ "plan_cache": 3 })).is_err());
    let defaults: SessionOptions = serde_json::from_value(json!({})).expect("defaults");
    assert_eq!(defaults, SessionOptions::default());
}

#[test]
fn zero_capacity_is_rejected() {
    let backend = Arc::new(RecordingBackend::default());
    let options = SessionOptions {
        plan_cache_capacity: 0,
    };
    assert!(Session::with_options(backend, options).is_err());
}
