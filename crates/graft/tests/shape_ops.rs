mod common;

use anyhow::Result;
use graft::backend::spec::{DType, Dimension, Shape, TensorSpec};
use graft::ops::functional::{
    cosine_similarity, flatten_leading, merge_heads, pixel_shuffle, pixel_unshuffle,
    split_heads, take_token,
};
use graft::ops::graph::output;
use graft::{Feeds, InMemoryParamStore, Node, Tensor};

use common::{session, tensor};

fn ramp(dims: &[usize]) -> Result<Tensor> {
    let len = dims.iter().product::<usize>();
    Tensor::from_f32(dims, (0..len).map(|v| v as f32).collect())
}

#[test]
fn pixel_unshuffle_inverts_shuffle() -> Result<()> {
    let (_, session) = session();
    let x = Node::input("x", TensorSpec::new(DType::F32, Shape::from_static(&[2, 4, 6, 3])));
    let packed = pixel_unshuffle(&x, 2)?;
    let restored = pixel_shuffle(&packed, 2)?;
    let outputs = output([("packed", packed), ("restored", restored)]);

    let input = ramp(&[2, 4, 6, 3])?;
    let feeds = Feeds::new().with("x", input.clone());
    let result = session.run(&outputs, &feeds, &mut InMemoryParamStore::default())?;
    let packed = tensor(&result, "packed");
    assert_eq!(packed.shape(), &[2, 2, 3, 12]);
    // Output pixel (0, 0) holds the 2x2 input window per channel, channel-major.
    let window: Vec<f32> = (0..3)
        .flat_map(|c| [0usize, 3, 18, 21].map(|base| (base + c) as f32))
        .collect();
    assert_eq!(&packed.as_f32()?[..12], window.as_slice());
    assert_eq!(tensor(&result, "restored"), &input);
    Ok(())
}

#[test]
fn merge_heads_undoes_split_heads() -> Result<()> {
    let (_, session) = session();
    let x = Node::input("x", TensorSpec::new(DType::F32, Shape::from_static(&[2, 3, 8])));
    let heads = split_heads(&x, 4)?;
    let outputs = output([("heads", heads.clone()), ("merged", merge_heads(&heads)?)]);
    let input = ramp(&[2, 3, 8])?;
    let result = session.run(
        &outputs,
        &Feeds::new().with("x", input.clone()),
        &mut InMemoryParamStore::default(),
    )?;
    assert_eq!(tensor(&result, "heads").shape(), &[2, 3, 4, 2]);
    assert_eq!(tensor(&result, "merged"), &input);
    Ok(())
}

#[test]
fn token_selection_and_similarity_follow_fed_batch() -> Result<()> {
    let (_, session) = session();
    let spec = TensorSpec::new(
        DType::F32,
        Shape::new(vec![Dimension::dynamic("batch"), 2.into(), 3.into()]),
    );
    let x = Node::input("x", spec);
    let first = take_token(&x, 1, 0)?;
    let last = take_token(&x, 1, 1)?;
    let outputs = output([
        ("first", first.clone()),
        ("similarity", cosine_similarity(&first, &last)?),
        ("flat", flatten_leading(&x)?),
    ]);

    let input = Tensor::from_f32(
        &[2, 2, 3],
        vec![1.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 3.0],
    )?;
    let result = session.run(
        &outputs,
        &Feeds::new().with("x", input),
        &mut InMemoryParamStore::default(),
    )?;
    assert_eq!(tensor(&result, "first").as_f32()?, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    let similarity = tensor(&result, "similarity");
    assert_eq!(similarity.shape(), &[2]);
    common::assert_close(similarity.as_f32()?, &[1.0, 0.0], 1e-6);
    assert_eq!(tensor(&result, "flat").shape(), &[4, 3]);
    Ok(())
}
