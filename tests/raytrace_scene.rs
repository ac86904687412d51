//! End-to-end LiDAR scans against small scenes.

use parking_lot::RwLock;
use std::f32::consts::PI;
use std::sync::Arc;

use lidarsim::device::{Device, Stream};
use lidarsim::graph::{
    connect, share, DistanceF32, Field, GaussianNoiseAngularHitpointNode, Graph, IsHitI32,
    NodeRef, RayIdxU32, RaysFromMat3x4Node, RaytraceNode, TransformRaysNode, XyzF32,
};
use lidarsim::rt::RayTracingBackend;
use lidarsim::scene::Scene;
use lidarsim::util::{Affine3A, Axis, BackendConfig, DeviceConfig, Mat3x4f, Quat, Vec3};

struct Fixture {
    device: Device,
    stream: Stream,
    backend: Arc<RayTracingBackend>,
}

fn fixture() -> Fixture {
    let device = Device::new(&DeviceConfig::default()).expect("device");
    let stream = Stream::new(&device).expect("stream");
    let backend = Arc::new(RayTracingBackend::new(&device, &BackendConfig::default()).expect("backend"));
    Fixture {
        device,
        stream,
        backend,
    }
}

/// Ray at `origin` looking down -Z.
fn down_ray(origin: Vec3) -> Mat3x4f {
    Mat3x4f::from_affine(&Affine3A::from_rotation_translation(
        Quat::from_rotation_x(PI),
        origin,
    ))
}

fn ground_scene(device: &Device) -> Arc<RwLock<Scene>> {
    let mut scene = Scene::new(device);
    let ground = scene.add_mesh(Scene::ground_plane(device, 10.0, 0.0).unwrap());
    scene.add_entity(ground, Mat3x4f::IDENTITY).unwrap();
    Arc::new(RwLock::new(scene))
}

/// rays -> raytrace, returning (rays, raytrace) handles.
fn scan(f: &Fixture, scene: Arc<RwLock<Scene>>, rays: &[Mat3x4f]) -> (NodeRef, NodeRef) {
    let source = share(RaysFromMat3x4Node::with_device(&f.device));
    source.write().set_rays(rays).unwrap();
    let source: NodeRef = source;
    let raytrace: NodeRef = share(RaytraceNode::new(scene, Arc::clone(&f.backend)));
    connect(&source, &raytrace).unwrap();
    (source, raytrace)
}

#[test]
fn test_rays_hit_ground_plane() {
    let f = fixture();
    let rays = [
        down_ray(Vec3::new(0.5, -1.5, 5.0)),
        down_ray(Vec3::new(3.0, -2.0, 2.0)),
        down_ray(Vec3::new(20.0, 0.0, 5.0)),
    ];
    let (_source, raytrace) = scan(&f, ground_scene(&f.device), &rays);
    let mut graph = Graph::new(&raytrace).unwrap();

    let xyz = graph
        .field_data(&raytrace, Field::Xyz, &f.stream)
        .unwrap()
        .read::<XyzF32>()
        .unwrap();
    let distance = graph
        .field_data(&raytrace, Field::Distance, &f.stream)
        .unwrap()
        .read::<DistanceF32>()
        .unwrap();
    let hit = graph
        .field_data(&raytrace, Field::IsHit, &f.stream)
        .unwrap()
        .read::<IsHitI32>()
        .unwrap();
    let idx = graph
        .field_data(&raytrace, Field::RayIdx, &f.stream)
        .unwrap()
        .read::<RayIdxU32>()
        .unwrap();

    assert_eq!(hit, vec![1, 1, 0]);
    assert_eq!(idx, vec![0, 1, 2]);
    assert!(xyz[0].abs_diff_eq(Vec3::new(0.5, -1.5, 0.0), 1e-4), "{:?}", xyz[0]);
    assert!(xyz[1].abs_diff_eq(Vec3::new(3.0, -2.0, 0.0), 1e-4), "{:?}", xyz[1]);
    assert_eq!(xyz[2], Vec3::ZERO);
    assert!((distance[0] - 5.0).abs() < 1e-4);
    assert!((distance[1] - 2.0).abs() < 1e-4);
    assert_eq!(distance[2], 0.0);
    assert_eq!(f.device.last_error(), None);
}

#[test]
fn test_empty_scene_misses_everything() {
    let f = fixture();
    let scene = Arc::new(RwLock::new(Scene::new(&f.device)));
    let rays: Vec<Mat3x4f> = (0..16).map(|i| down_ray(Vec3::new(i as f32, 0.0, 1.0))).collect();
    let (_source, raytrace) = scan(&f, scene, &rays);
    let mut graph = Graph::new(&raytrace).unwrap();

    let hit = graph
        .field_data(&raytrace, Field::IsHit, &f.stream)
        .unwrap()
        .read::<IsHitI32>()
        .unwrap();
    let xyz = graph
        .field_data(&raytrace, Field::Xyz, &f.stream)
        .unwrap()
        .read::<XyzF32>()
        .unwrap();
    let distance = graph
        .field_data(&raytrace, Field::Distance, &f.stream)
        .unwrap()
        .read::<DistanceF32>()
        .unwrap();
    assert_eq!(hit.len(), 16);
    assert!(hit.iter().all(|&h| h == 0));
    assert!(xyz.iter().all(|p| *p == Vec3::ZERO));
    assert!(distance.iter().all(|&d| d == 0.0));
}

#[test]
fn test_nearest_instance_wins_and_scene_edits_apply() {
    let f = fixture();
    let scene = ground_scene(&f.device);
    let cube = {
        let mut s = scene.write();
        let cube = s.add_mesh(Scene::cube(&f.device, 1.0).unwrap());
        s.add_entity(cube, Mat3x4f::from_translation(Vec3::new(0.0, 0.0, 1.0)))
            .unwrap()
    };
    let (_source, raytrace) = scan(&f, Arc::clone(&scene), &[down_ray(Vec3::new(0.3, 0.2, 10.0))]);
    let mut graph = Graph::new(&raytrace).unwrap();

    let xyz = graph
        .field_data(&raytrace, Field::Xyz, &f.stream)
        .unwrap()
        .read::<XyzF32>()
        .unwrap();
    assert!(xyz[0].abs_diff_eq(Vec3::new(0.3, 0.2, 2.0), 1e-4), "{:?}", xyz[0]);

    // Lift the cube; reading the field again retraces the edited scene.
    assert!(graph.is_current());
    scene
        .write()
        .set_entity_transform(cube, Mat3x4f::from_translation(Vec3::new(0.0, 0.0, 4.0)))
        .unwrap();
    assert!(!graph.is_current());
    let distance = graph
        .field_data(&raytrace, Field::Distance, &f.stream)
        .unwrap()
        .read::<DistanceF32>()
        .unwrap();
    assert!((distance[0] - 5.0).abs() < 1e-4, "{}", distance[0]);

    assert!(scene.write().remove_entity(cube));
    assert!(!scene.write().remove_entity(cube));
    let distance = graph
        .field_data(&raytrace, Field::Distance, &f.stream)
        .unwrap()
        .read::<DistanceF32>()
        .unwrap();
    assert!((distance[0] - 10.0).abs() < 1e-4, "{}", distance[0]);
}

#[test]
fn test_moving_the_ground_updates_distances() {
    let f = fixture();
    let mut scene = Scene::new(&f.device);
    let ground = scene.add_mesh(Scene::ground_plane(&f.device, 10.0, 0.0).unwrap());
    let entity = scene.add_entity(ground, Mat3x4f::IDENTITY).unwrap();
    let scene = Arc::new(RwLock::new(scene));
    let (_source, raytrace) = scan(&f, Arc::clone(&scene), &[down_ray(Vec3::new(0.5, -1.5, 10.0))]);
    let mut graph = Graph::new(&raytrace).unwrap();

    let read_distance = |graph: &mut Graph| {
        graph
            .field_data(&raytrace, Field::Distance, &f.stream)
            .unwrap()
            .read::<DistanceF32>()
            .unwrap()[0]
    };
    assert!((read_distance(&mut graph) - 10.0).abs() < 1e-4);
    assert!((read_distance(&mut graph) - 10.0).abs() < 1e-4);

    scene
        .write()
        .set_entity_transform(entity, Mat3x4f::from_translation(Vec3::new(0.0, 0.0, 4.0)))
        .unwrap();
    let moved = read_distance(&mut graph);
    assert!((moved - 6.0).abs() < 1e-4, "{moved}");
    assert!(graph.is_current());
}

#[test]
fn test_sensor_frame_follows_ray_transforms() {
    let f = fixture();
    let source = share(RaysFromMat3x4Node::with_device(&f.device));
    source.write().set_rays(&[down_ray(Vec3::ZERO)]).unwrap();
    let mount = share(TransformRaysNode::with_device(
        &f.device,
        Mat3x4f::from_translation(Vec3::new(1.0, -2.0, 5.0)),
    ));
    let raytrace = share(RaytraceNode::new(ground_scene(&f.device), Arc::clone(&f.backend)));
    let noise = share(GaussianNoiseAngularHitpointNode::with_device(&f.device, 0.0, 0.0, Axis::Z));

    let nodes: [NodeRef; 4] = [source, mount, raytrace, noise];
    for pair in nodes.windows(2) {
        connect(&pair[0], &pair[1]).unwrap();
    }
    let mut graph = Graph::new(&nodes[3]).unwrap();

    let xyz = graph
        .field_data(&nodes[3], Field::Xyz, &f.stream)
        .unwrap()
        .read::<XyzF32>()
        .unwrap();
    let distance = graph
        .field_data(&nodes[3], Field::Distance, &f.stream)
        .unwrap()
        .read::<DistanceF32>()
        .unwrap();
    assert!(xyz[0].abs_diff_eq(Vec3::new(1.0, -2.0, 0.0), 1e-4), "{:?}", xyz[0]);
    // Distance is measured in the sensor frame, not from the world origin.
    assert!((distance[0] - 5.0).abs() < 1e-4, "{}", distance[0]);
}
