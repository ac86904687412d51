use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::TypedBuffer;
use crate::device::{Device, DevicePtr, Stream};
use crate::graph::node::resolved;
use crate::graph::{with_points, Field, FieldView, Node, NodeBase, NodeRef, PointsNode};
use crate::kernels::{self, PcgState};
use crate::util::{Axis, CheckStatus, Mat3x4f, Result, Vec3};

/// Perturbs each point's angular position around the sensor.
///
/// Every point is rotated about `axis` of its sensor frame by an angle drawn
/// from N(mean, st_dev) (radians). If the input carries [`Field::Distance`]
/// the node also emits a recomputed distance; otherwise distance requests
/// are forwarded upstream.
pub struct GaussianNoiseAngularHitpointNode {
    base: NodeBase,
    mean: f32,
    st_dev: f32,
    axis: Axis,
    input: Option<NodeRef>,
    look_at_origin: Mat3x4f,
    out_xyz: TypedBuffer<Vec3>,
    out_distance: Option<TypedBuffer<f32>>,
    rng_states: TypedBuffer<PcgState>,
    seeds: StdRng,
}

impl GaussianNoiseAngularHitpointNode {
    pub fn new(mean: f32, st_dev: f32, axis: Axis) -> Result<Self> {
        let device = Device::current().checked("Device::current")?;
        Ok(Self::with_device(&device, mean, st_dev, axis))
    }

    pub fn with_device(device: &Device, mean: f32, st_dev: f32, axis: Axis) -> Self {
        Self {
            base: NodeBase::new("GaussianNoiseAngularHitpointNode"),
            mean,
            st_dev,
            axis,
            input: None,
            look_at_origin: Mat3x4f::IDENTITY,
            out_xyz: TypedBuffer::empty(device),
            out_distance: None,
            rng_states: TypedBuffer::empty(device),
            seeds: StdRng::from_entropy(),
        }
    }

    /// Seed generator states deterministically from `seed`.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seeds = StdRng::seed_from_u64(seed);
        self
    }

    pub fn set_parameters(&mut self, mean: f32, st_dev: f32, axis: Axis) {
        self.mean = mean;
        self.st_dev = st_dev;
        self.axis = axis;
        self.base.mark_stale();
    }

    pub fn parameters(&self) -> (f32, f32, Axis) {
        (self.mean, self.st_dev, self.axis)
    }

    /// Whether this configuration emits its own distance field.
    pub fn produces_distance(&self) -> bool {
        self.out_distance.is_some()
    }

    /// Generator states allocated so far.
    pub fn rng_state_count(&self) -> usize {
        self.rng_states.len()
    }

    fn input(&self) -> Result<NodeRef> {
        resolved(&self.input, self.base.name())
    }
}

impl Node for GaussianNoiseAngularHitpointNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn validate(&mut self) -> Result<()> {
        let input = self.base.points_input()?;
        let has_distance = with_points(&input, |p| Ok(p.has_field(Field::Distance)))?;
        if has_distance {
            if self.out_distance.is_none() {
                self.out_distance = Some(TypedBuffer::empty(self.out_xyz.device()));
            }
        } else {
            self.out_distance = None;
        }
        self.input = Some(input);
        Ok(())
    }

    fn schedule(&mut self, stream: &Stream) -> Result<()> {
        let input = self.input()?;
        let (count, look_at, in_xyz) = with_points(&input, |p| {
            Ok((
                p.point_count(),
                p.look_at_origin_transform(),
                p.field_data(Field::Xyz)?,
            ))
        })?;
        self.look_at_origin = look_at;

        self.out_xyz.resize(count, false, false)?;
        let out_distance = match &mut self.out_distance {
            Some(distance) => {
                distance.resize(count, false, false)?;
                distance.device_ptr()
            }
            None => DevicePtr::NULL,
        };

        let initialized = self.rng_states.len();
        if initialized < count {
            self.rng_states.resize(count, false, true)?;
            let seed: u64 = self.seeds.gen();
            kernels::setup_gaussian_noise_generator(
                stream,
                initialized,
                count - initialized,
                seed,
                self.rng_states.device_ptr(),
            )
            .checked("setup_gaussian_noise_generator")?;
            tracing::trace!(from = initialized, to = count, "grew noise generator states");
        }

        kernels::add_gaussian_noise_angular_hitpoint(
            stream,
            count,
            self.mean,
            self.st_dev,
            self.axis,
            self.look_at_origin,
            self.rng_states.device_ptr(),
            in_xyz.device_ptr(),
            self.out_xyz.device_ptr(),
            out_distance,
        )
        .checked("add_gaussian_noise_angular_hitpoint")
    }

    fn required_fields(&self) -> &[Field] {
        &[Field::Xyz]
    }

    fn as_points(&self) -> Option<&dyn PointsNode> {
        Some(self)
    }
}

impl PointsNode for GaussianNoiseAngularHitpointNode {
    fn point_count(&self) -> usize {
        self.input()
            .and_then(|input| with_points(&input, |p| Ok(p.point_count())))
            .unwrap_or(0)
    }

    fn has_field(&self, field: Field) -> bool {
        match field {
            Field::Xyz => true,
            Field::Distance if self.out_distance.is_some() => true,
            _ => self
                .input()
                .and_then(|input| with_points(&input, |p| Ok(p.has_field(field))))
                .unwrap_or(false),
        }
    }

    fn field_data(&self, field: Field) -> Result<FieldView> {
        match (field, &self.out_distance) {
            (Field::Xyz, _) => Ok(FieldView::new(field, self.out_xyz.untyped())),
            (Field::Distance, Some(distance)) => Ok(FieldView::new(field, distance.untyped())),
            _ => with_points(&self.input()?, |p| p.field_data(field)),
        }
    }

    fn look_at_origin_transform(&self) -> Mat3x4f {
        self.input()
            .and_then(|input| with_points(&input, |p| Ok(p.look_at_origin_transform())))
            .unwrap_or(self.look_at_origin)
    }
}
