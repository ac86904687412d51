//! Integration tests for graph validation, scheduling and field propagation.

use std::f32::consts::FRAC_PI_2;

use lidarsim::device::{Device, DevicePtr, Stream};
use lidarsim::graph::{
    connect, invalidate_downstream, share, with_points, with_rays, DistanceF32, Field,
    FromArrayPointsNode, GaussianNoiseAngularHitpointNode, Graph, Node, NodeRef, NodeState,
    RaysFromMat3x4Node, TransformPointsNode, TransformRaysNode, XyzF32,
};
use lidarsim::util::{Axis, DeviceConfig, Mat3x4f, Vec3};
use lidarsim::Error;

fn setup() -> (Device, Stream) {
    let device = Device::new(&DeviceConfig::default()).expect("device");
    let stream = Stream::new(&device).expect("stream");
    (device, stream)
}

fn assert_vec3_eq(actual: &[Vec3], expected: &[Vec3]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!(a.abs_diff_eq(*e, 1e-5), "{a:?} != {e:?}");
    }
}

#[test]
fn test_transform_rays_quarter_turn() {
    let (device, stream) = setup();
    let source = share(RaysFromMat3x4Node::with_device(&device));
    source
        .write()
        .set_rays(&[
            Mat3x4f::from_translation(Vec3::X),
            Mat3x4f::from_translation(Vec3::new(0.0, 2.0, 0.0)),
        ])
        .unwrap();
    let rotation = Mat3x4f::from_axis_angle(Vec3::X, FRAC_PI_2);
    let transform = share(TransformRaysNode::with_device(&device, rotation));

    let src: NodeRef = source.clone();
    let dst: NodeRef = transform.clone();
    connect(&src, &dst).unwrap();
    let mut graph = Graph::new(&dst).unwrap();
    graph.run(&stream).unwrap();
    stream.synchronize().unwrap();

    let rays = with_rays(&dst, |r| r.rays().to_vec()).unwrap();
    let origins: Vec<Vec3> = rays.iter().map(Mat3x4f::translation).collect();
    let directions: Vec<Vec3> = rays.iter().map(Mat3x4f::z_axis).collect();
    assert_vec3_eq(&origins, &[Vec3::X, Vec3::new(0.0, 0.0, 2.0)]);
    assert_vec3_eq(&directions, &[Vec3::new(0.0, -1.0, 0.0); 2]);
    assert!(with_rays(&dst, |r| Ok(r.cumulative_ray_transform()))
        .unwrap()
        .abs_diff_eq(&rotation, 1e-6));

    // Parameter change reschedules without revalidation
    transform.write().set_transform(Mat3x4f::IDENTITY);
    assert_eq!(dst.read().base().state(), NodeState::Validated);
    graph.run(&stream).unwrap();
    stream.synchronize().unwrap();
    let rays = with_rays(&dst, |r| r.rays().to_vec()).unwrap();
    assert!(rays[0].translation().abs_diff_eq(Vec3::X, 1e-6));
}

#[test]
fn test_noise_without_deviation_rotates_and_emits_distance() {
    let (device, stream) = setup();
    let points = share(FromArrayPointsNode::with_device(&device));
    let xyz = [Vec3::new(2.0, 0.0, 0.0), Vec3::new(0.0, 3.0, 0.0)];
    points
        .write()
        .set_points(&xyz, Some(&[2.0, 3.0]))
        .unwrap();
    let noise = share(
        GaussianNoiseAngularHitpointNode::with_device(&device, FRAC_PI_2, 0.0, Axis::Z).with_seed(7),
    );

    let src: NodeRef = points.clone();
    let dst: NodeRef = noise.clone();
    connect(&src, &dst).unwrap();
    let mut graph = Graph::new(&dst).unwrap();

    let out = graph
        .field_data(&dst, Field::Xyz, &stream)
        .unwrap()
        .read::<XyzF32>()
        .unwrap();
    assert_vec3_eq(&out, &[Vec3::new(0.0, 2.0, 0.0), Vec3::new(-3.0, 0.0, 0.0)]);
    assert!(noise.read().produces_distance());

    let distance = graph
        .field_data(&dst, Field::Distance, &stream)
        .unwrap()
        .read::<DistanceF32>()
        .unwrap();
    assert!((distance[0] - 2.0).abs() < 1e-5);
    assert!((distance[1] - 3.0).abs() < 1e-5);
}

#[test]
fn test_zero_noise_leaves_points_unchanged() {
    let (device, stream) = setup();
    let xyz = [
        Vec3::new(1.25, -3.5, 0.75),
        Vec3::new(-7.1, 2.2, 4.9),
        Vec3::new(0.3, 0.4, -12.6),
        Vec3::new(15.0, -0.01, 2.5),
    ];
    let distances: Vec<f32> = xyz.iter().map(|p| p.length()).collect();
    let points = share(FromArrayPointsNode::with_device(&device));
    points.write().set_points(&xyz, Some(&distances)).unwrap();
    let noise = share(GaussianNoiseAngularHitpointNode::with_device(&device, 0.0, 0.0, Axis::Z).with_seed(3));

    let src: NodeRef = points.clone();
    let dst: NodeRef = noise.clone();
    connect(&src, &dst).unwrap();
    let mut graph = Graph::new(&dst).unwrap();

    let out = graph
        .field_data(&dst, Field::Xyz, &stream)
        .unwrap()
        .read::<XyzF32>()
        .unwrap();
    let out_distance = graph
        .field_data(&dst, Field::Distance, &stream)
        .unwrap()
        .read::<DistanceF32>()
        .unwrap();
    assert!(noise.read().produces_distance());
    assert_vec3_eq(&out, &xyz);
    for (a, e) in out_distance.iter().zip(&distances) {
        assert!((a - e).abs() <= e * 1e-6, "{a} != {e}");
    }
}

#[test]
fn test_distance_follows_input_field_set() {
    let (device, stream) = setup();
    let points = share(FromArrayPointsNode::with_device(&device));
    points.write().set_points(&[Vec3::X], None).unwrap();
    let noise = share(GaussianNoiseAngularHitpointNode::with_device(&device, 0.0, 0.0, Axis::Z));

    let src: NodeRef = points.clone();
    let dst: NodeRef = noise.clone();
    connect(&src, &dst).unwrap();
    let mut graph = Graph::new(&dst).unwrap();
    graph.run(&stream).unwrap();

    assert!(!noise.read().produces_distance());
    let err = graph.field_data(&dst, Field::Distance, &stream).unwrap_err();
    assert!(matches!(err, Error::FieldNotFound { field: Field::Distance, .. }));

    // Adding distance upstream changes the field set; the noise node picks it up.
    points.write().set_points(&[Vec3::X], Some(&[1.0])).unwrap();
    assert_eq!(src.read().base().state(), NodeState::Unvalidated);
    let distance = graph
        .field_data(&dst, Field::Distance, &stream)
        .unwrap()
        .read::<DistanceF32>()
        .unwrap();
    assert!(noise.read().produces_distance());
    assert!((distance[0] - 1.0).abs() < 1e-5);

    // Fields the node does not produce come from upstream.
    assert!(graph.field_data(&dst, Field::IsHit, &stream).is_err());
}

#[test]
fn test_rng_states_only_grow() {
    let (device, stream) = setup();
    let points = share(FromArrayPointsNode::with_device(&device));
    let noise = share(GaussianNoiseAngularHitpointNode::with_device(&device, 0.0, 0.01, Axis::Z).with_seed(1));
    let src: NodeRef = points.clone();
    let dst: NodeRef = noise.clone();
    connect(&src, &dst).unwrap();
    let mut graph = Graph::new(&dst).unwrap();

    for (n, expected) in [(2, 2), (5, 5), (3, 5)] {
        points.write().set_points(&vec![Vec3::X; n], None).unwrap();
        let out = graph.field_data(&dst, Field::Xyz, &stream).unwrap();
        assert_eq!(out.len(), n);
        assert_eq!(noise.read().rng_state_count(), expected);
    }
}

#[test]
fn test_transform_points_forwards_other_fields() {
    let (device, stream) = setup();
    let points = share(FromArrayPointsNode::with_device(&device));
    points
        .write()
        .set_points(&[Vec3::ZERO, Vec3::Y], Some(&[0.0, 1.0]))
        .unwrap();
    let shift = Mat3x4f::from_translation(Vec3::new(0.0, 0.0, 5.0));
    let transform = share(TransformPointsNode::with_device(&device, shift));
    let src: NodeRef = points.clone();
    let dst: NodeRef = transform.clone();
    connect(&src, &dst).unwrap();
    let mut graph = Graph::new(&dst).unwrap();

    let xyz = graph
        .field_data(&dst, Field::Xyz, &stream)
        .unwrap()
        .read::<XyzF32>()
        .unwrap();
    assert_vec3_eq(&xyz, &[Vec3::new(0.0, 0.0, 5.0), Vec3::new(0.0, 1.0, 5.0)]);
    let distance = graph
        .field_data(&dst, Field::Distance, &stream)
        .unwrap()
        .read::<DistanceF32>()
        .unwrap();
    assert_eq!(distance, vec![0.0, 1.0]);
}

#[test]
fn test_validate_is_idempotent() {
    let (device, stream) = setup();
    let points = share(FromArrayPointsNode::with_device(&device));
    points.write().set_points(&[Vec3::X], None).unwrap();
    let noise = share(GaussianNoiseAngularHitpointNode::with_device(&device, 0.0, 0.0, Axis::Z));
    let src: NodeRef = points.clone();
    let dst: NodeRef = noise.clone();
    connect(&src, &dst).unwrap();

    let mut graph = Graph::new(&dst).unwrap();
    graph.validate().unwrap();
    graph.validate().unwrap();
    assert!(graph
        .nodes()
        .iter()
        .all(|n| n.read().base().state() == NodeState::Validated));
    graph.schedule(&stream).unwrap();
    assert!(graph.is_current());
    graph.validate().unwrap();
    assert!(graph.is_current());
    stream.synchronize().unwrap();
}

#[test]
fn test_revalidation_keeps_distance_output() {
    let (device, stream) = setup();
    let points = share(FromArrayPointsNode::with_device(&device));
    points
        .write()
        .set_points(&[Vec3::X, Vec3::new(0.0, 2.0, 0.0)], Some(&[1.0, 2.0]))
        .unwrap();
    let noise = share(GaussianNoiseAngularHitpointNode::with_device(&device, 0.0, 0.0, Axis::Z));
    let src: NodeRef = points.clone();
    let dst: NodeRef = noise.clone();
    connect(&src, &dst).unwrap();
    let mut graph = Graph::new(&dst).unwrap();
    graph.run(&stream).unwrap();
    stream.synchronize().unwrap();

    let output_ptrs = || -> (DevicePtr, DevicePtr) {
        with_points(&dst, |p| {
            Ok((
                p.field_data(Field::Xyz)?.device_ptr(),
                p.field_data(Field::Distance)?.device_ptr(),
            ))
        })
        .unwrap()
    };
    let before = output_ptrs();
    assert!(noise.read().produces_distance());
    assert!(!before.1.is_null());

    noise.write().validate().unwrap();
    noise.write().validate().unwrap();
    assert!(noise.read().produces_distance());
    assert_eq!(output_ptrs(), before);

    // A full revalidation through the graph keeps the same decision and buffers.
    invalidate_downstream(&src);
    let distance = graph
        .field_data(&dst, Field::Distance, &stream)
        .unwrap()
        .read::<DistanceF32>()
        .unwrap();
    assert!(noise.read().produces_distance());
    assert_eq!(output_ptrs(), before);
    assert!((distance[0] - 1.0).abs() < 1e-5);
    assert!((distance[1] - 2.0).abs() < 1e-5);
}

#[test]
fn test_missing_input_is_rejected() {
    let (device, _stream) = setup();
    let noise: NodeRef = share(GaussianNoiseAngularHitpointNode::with_device(&device, 0.0, 0.0, Axis::Z));
    let mut graph = Graph::new(&noise).unwrap();
    let err = graph.validate().unwrap_err();
    assert!(matches!(err, Error::InvalidPipeline(_)));

    // Rays are not points.
    let rays: NodeRef = share(RaysFromMat3x4Node::with_device(&device));
    connect(&rays, &noise).unwrap();
    assert!(Graph::new(&noise).unwrap().validate().is_err());
}

#[test]
fn test_cycles_are_rejected() {
    let (device, _stream) = setup();
    let a: NodeRef = share(TransformPointsNode::with_device(&device, Mat3x4f::IDENTITY));
    let b: NodeRef = share(TransformPointsNode::with_device(&device, Mat3x4f::IDENTITY));
    let c: NodeRef = share(TransformPointsNode::with_device(&device, Mat3x4f::IDENTITY));
    connect(&a, &b).unwrap();
    connect(&b, &c).unwrap();
    assert!(matches!(connect(&c, &a), Err(Error::InvalidPipeline(_))));
    assert_eq!(Graph::new(&a).unwrap().nodes().len(), 3);
}
