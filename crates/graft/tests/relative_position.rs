mod common;

use anyhow::Result;
use graft::backend::spec::{DType, Shape, TensorSpec};
use graft::config::RelativePositionOptions;
use graft::ops::functional::{relative_position_bucket, relative_position_bucket_host};
use graft::ops::graph::output;
use graft::{Feeds, InMemoryParamStore, Node, Tensor};

use common::{session, tensor};

fn distances() -> Vec<i32> {
    (-300..=300).step_by(3).collect()
}

fn graph_buckets(options: &RelativePositionOptions) -> Result<Vec<i32>> {
    let (_, session) = session();
    let values = distances();
    let positions = Node::input(
        "positions",
        TensorSpec::new(DType::Si32, Shape::from_static(&[values.len()])),
    );
    let outputs = output([("buckets", relative_position_bucket(&positions, options)?)]);
    let feeds = Feeds::new().with("positions", Tensor::from_i32(&[values.len()], values)?);
    let result = session.run(&outputs, &feeds, &mut InMemoryParamStore::default())?;
    Ok(tensor(&result, "buckets").as_i32()?.to_vec())
}

#[test]
fn graph_buckets_match_host_reference() -> Result<()> {
    for bidirectional in [true, false] {
        let mut options = RelativePositionOptions::new(4);
        options.bidirectional = bidirectional;
        let expected: Vec<i32> = distances()
            .into_iter()
            .map(|d| relative_position_bucket_host(d, &options))
            .collect();
        assert_eq!(graph_buckets(&options)?, expected, "bidirectional={bidirectional}");
    }
    Ok(())
}

#[test]
fn buckets_are_bounded_and_monotonic_in_distance() {
    let options = RelativePositionOptions::new(4);
    let half = (options.num_buckets / 2) as i32;
    let mut previous_left = 0;
    let mut previous_right = half;
    for distance in 0..2_000 {
        let left = relative_position_bucket_host(-distance, &options);
        assert!((0..half).contains(&left));
        assert!(left >= previous_left);
        previous_left = left;
        if distance > 0 {
            let right = relative_position_bucket_host(distance, &options);
            assert!((half..options.num_buckets as i32).contains(&right));
            assert!(right >= previous_right);
            previous_right = right;
        }
    }
    assert_eq!(previous_left, half - 1);
}
