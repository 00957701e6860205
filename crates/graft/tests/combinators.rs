mod common;

use anyhow::Result;
use graft::backend::spec::{DType, ElementwiseBinaryOp, Operation, Shape, TensorSpec};
use graft::ops::functional::tensor_ops::{add, mul};
use graft::ops::graph::{append, default, if_present, maybe_container, output, unwrap_tuple};
use graft::{Container, Feeds, InMemoryParamStore, Node, Tensor};

use common::{is_absent, session, tensor};

fn vector(name: &str, optional: bool) -> Node {
    let spec = TensorSpec::new(DType::F32, Shape::from_static(&[3]));
    if optional {
        Node::optional_input(name, spec)
    } else {
        Node::input(name, spec)
    }
}

fn values(v: [f32; 3]) -> Tensor {
    Tensor::from_f32(&[3], v.to_vec()).expect("valid vector")
}

#[test]
fn default_prefers_present_value() -> Result<()> {
    let (backend, session) = session();
    let a = vector("a", true);
    let b = vector("b", false);
    let outputs = output([("y", default(&add(&a, &b)?, &b)?)]);
    let mut store = InMemoryParamStore::default();

    let feeds = Feeds::new()
        .with("a", values([1.0, 2.0, 3.0]))
        .with("b", values([10.0, 20.0, 30.0]));
    let result = session.run(&outputs, &feeds, &mut store)?;
    assert_eq!(tensor(&result, "y").as_f32()?, &[11.0, 22.0, 33.0]);

    let feeds = Feeds::new().absent("a").with("b", values([10.0, 20.0, 30.0]));
    let result = session.run(&outputs, &feeds, &mut store)?;
    assert_eq!(tensor(&result, "y").as_f32()?, &[10.0, 20.0, 30.0]);
    // The dead branch and its feed are gone from the program.
    let is_add = |op: &Operation| matches!(op, Operation::ElementwiseBinary(ElementwiseBinaryOp::Add));
    assert_eq!(backend.count_ops(is_add), 0);
    assert_eq!(backend.last_entry_function().parameters.len(), 1);
    Ok(())
}

#[test]
fn if_present_selects_on_condition_presence() -> Result<()> {
    let (_, session) = session();
    let condition = vector("condition", true);
    let b = vector("b", false);
    let squared = mul(&b, &b)?;
    let outputs = output([
        ("chosen", if_present(&condition, &squared, Some(&b))?),
        ("only_when_present", if_present(&condition, &squared, None)?),
    ]);
    let mut store = InMemoryParamStore::default();
    let b_value = values([1.0, 2.0, 3.0]);

    let feeds = Feeds::new()
        .with("condition", values([0.0; 3]))
        .with("b", b_value.clone());
    let result = session.run(&outputs, &feeds, &mut store)?;
    assert_eq!(tensor(&result, "chosen").as_f32()?, &[1.0, 4.0, 9.0]);
    assert_eq!(tensor(&result, "only_when_present").as_f32()?, &[1.0, 4.0, 9.0]);

    let result = session.run(&outputs, &Feeds::new().with("b", b_value), &mut store)?;
    assert_eq!(tensor(&result, "chosen").as_f32()?, &[1.0, 2.0, 3.0]);
    assert!(is_absent(&result, "only_when_present"));
    Ok(())
}

#[test]
fn tuples_round_trip_through_outputs() -> Result<()> {
    let (_, session) = session();
    let a = vector("a", false);
    let b = vector("b", false);
    let c = vector("c", true);
    let pair = Node::tuple(vec![a, b]);
    let triple = append(&pair, &c)?;
    let items = unwrap_tuple(&triple, 3)?;
    assert!(unwrap_tuple(&triple, 2).is_err());

    let outputs = Container::map([
        ("triple", Container::leaf(triple.clone())),
        ("last", Container::leaf(items[2].clone())),
        ("missing", maybe_container(Container::leaf(items[0].clone()), false)),
    ]);
    let feeds = Feeds::new()
        .with("a", values([1.0; 3]))
        .with("b", values([2.0; 3]));
    let result = session.run(&outputs, &feeds, &mut InMemoryParamStore::default())?;

    let triple = result.get("triple").expect("tuple output");
    let second = triple
        .index(1)
        .and_then(|entry| entry.as_leaf())
        .and_then(|value| value.as_ref())
        .expect("second element present");
    assert_eq!(second.as_f32()?, &[2.0; 3]);
    assert!(matches!(triple.index(2).and_then(|entry| entry.as_leaf()), Some(None)));
    assert!(is_absent(&result, "last"));
    assert!(is_absent(&result, "missing"));
    Ok(())
}
