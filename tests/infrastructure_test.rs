//! Test to verify test infrastructure works correctly

mod common;

use common::builders::{two_frame_stream, BatchBuilder, StreamBuilder};
use datahub_rs::protocol::FrameReader;

#[test]
fn test_infrastructure_setup() {
    let stream = StreamBuilder::new()
        .frame(BatchBuilder::new("f64").sample(1, 1, 1.0).build())
        .build();
    let mut reader = FrameReader::new(stream.as_slice());
    assert!(reader.next_frame().unwrap().is_some());
    assert!(reader.next_frame().unwrap().is_none());
}

#[test]
fn test_two_frame_stream_fixture() {
    let stream = two_frame_stream();
    let mut reader = FrameReader::new(stream.as_slice());
    let mut frames = 0;
    while reader.next_frame().unwrap().is_some() {
        frames += 1;
    }
    assert_eq!(frames, 2);
}

#[test]
fn test_float_comparison() {
    common::assert_float_eq(1.0, 1.0000001, 0.001);
}

#[test]
#[should_panic]
fn test_float_comparison_fails() {
    common::assert_float_eq(1.0, 2.0, 0.001);
}
