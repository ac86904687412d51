use parking_lot::RwLock;
use std::sync::Arc;

use crate::buffer::TypedBuffer;
use crate::device::Stream;
use crate::graph::node::resolved;
use crate::graph::{with_rays, Field, FieldView, Node, NodeBase, NodeRef, PointsNode};
use crate::kernels;
use crate::rt::{LaunchLidarParams, RayTracingBackend};
use crate::scene::Scene;
use crate::util::{CheckStatus, Error, Mat3x4f, Result, Vec3};

/// Casts the upstream rays against a scene.
///
/// Produces hit positions, distances from the ray origin, hit flags and ray
/// indices. Rays that miss report position and distance 0.
pub struct RaytraceNode {
    base: NodeBase,
    scene: Arc<RwLock<Scene>>,
    backend: Arc<RayTracingBackend>,
    input: Option<NodeRef>,
    xyz: TypedBuffer<Vec3>,
    distance: TypedBuffer<f32>,
    is_hit: TypedBuffer<i32>,
    ray_idx: TypedBuffer<u32>,
    /// Scene generation the last launch traced against
    traced_generation: Option<u64>,
}

impl RaytraceNode {
    pub fn new(scene: Arc<RwLock<Scene>>, backend: Arc<RayTracingBackend>) -> Self {
        let device = backend.device().clone();
        Self {
            base: NodeBase::new("RaytraceNode"),
            scene,
            backend,
            input: None,
            xyz: TypedBuffer::empty(&device),
            distance: TypedBuffer::empty(&device),
            is_hit: TypedBuffer::empty(&device),
            ray_idx: TypedBuffer::empty(&device),
            traced_generation: None,
        }
    }

    pub fn set_scene(&mut self, scene: Arc<RwLock<Scene>>) {
        self.scene = scene;
        self.traced_generation = None;
        self.base.mark_stale();
    }

    pub fn scene(&self) -> &Arc<RwLock<Scene>> {
        &self.scene
    }

    fn input(&self) -> Result<NodeRef> {
        resolved(&self.input, self.base.name())
    }
}

impl Node for RaytraceNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn validate(&mut self) -> Result<()> {
        self.input = Some(self.base.rays_input()?);
        Ok(())
    }

    fn schedule(&mut self, stream: &Stream) -> Result<()> {
        let input = self.input()?;
        let (count, rays) = with_rays(&input, |src| Ok((src.ray_count(), src.rays().device_ptr())))?;
        let fb_size = i32::try_from(count)
            .map_err(|_| Error::invalid_argument(format!("{count} rays exceed one launch")))?;

        self.xyz.resize(count, false, false)?;
        self.distance.resize(count, false, false)?;
        self.is_hit.resize(count, false, false)?;
        self.ray_idx.resize(count, false, false)?;

        let (traversable, sbt, generation) = {
            let mut scene = self.scene.write();
            let handle = scene.prepare(&self.backend, stream)?;
            (handle, scene.sbt(), scene.generation())
        };
        let params = LaunchLidarParams {
            ray_buffer: rays,
            position_buffer: self.xyz.device_ptr(),
            fb_size,
            _pad0: 0,
            hit_buffer: self.is_hit.device_ptr(),
            traversable,
        };
        // SAFETY: the output buffers are owned here and the ray buffer by the
        // input; both only reallocate after synchronizing the device. The
        // scene's structures and records stay alive behind the shared lock.
        unsafe { self.backend.launch(&params, &sbt, stream)? };
        self.traced_generation = Some(generation);

        kernels::compute_distances(
            stream,
            count,
            rays,
            self.xyz.device_ptr(),
            self.is_hit.device_ptr(),
            self.distance.device_ptr(),
        )
        .checked("compute_distances")?;
        kernels::fill_ray_indices(stream, count, self.ray_idx.device_ptr())
            .checked("fill_ray_indices")
    }

    fn needs_schedule(&self) -> bool {
        self.traced_generation != Some(self.scene.read().generation())
    }

    fn as_points(&self) -> Option<&dyn PointsNode> {
        Some(self)
    }
}

impl PointsNode for RaytraceNode {
    fn point_count(&self) -> usize {
        self.xyz.len()
    }

    fn has_field(&self, field: Field) -> bool {
        Field::ALL.contains(&field)
    }

    fn field_data(&self, field: Field) -> Result<FieldView> {
        let buffer = match field {
            Field::Xyz => self.xyz.untyped(),
            Field::Distance => self.distance.untyped(),
            Field::IsHit => self.is_hit.untyped(),
            Field::RayIdx => self.ray_idx.untyped(),
        };
        Ok(FieldView::new(field, buffer))
    }

    /// Hits are reported in world space; the sensor frame undoes the rays' transforms.
    fn look_at_origin_transform(&self) -> Mat3x4f {
        self.input()
            .and_then(|input| with_rays(&input, |src| Ok(src.cumulative_ray_transform())))
            .map(|t| t.inverse())
            .unwrap_or(Mat3x4f::IDENTITY)
    }
}
