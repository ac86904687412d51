use crate::buffer::TypedBuffer;
use crate::device::{Device, Stream};
use crate::graph::node::resolved;
use crate::graph::{with_points, Field, FieldView, Node, NodeBase, NodeRef, PointsNode};
use crate::kernels;
use crate::util::{CheckStatus, Mat3x4f, Result, Vec3};

/// Rigid transform of [`Field::Xyz`]; every other field is forwarded.
pub struct TransformPointsNode {
    base: NodeBase,
    transform: Mat3x4f,
    input: Option<NodeRef>,
    out_xyz: TypedBuffer<Vec3>,
}

impl TransformPointsNode {
    pub fn new(transform: Mat3x4f) -> Result<Self> {
        let device = Device::current().checked("Device::current")?;
        Ok(Self::with_device(&device, transform))
    }

    pub fn with_device(device: &Device, transform: Mat3x4f) -> Self {
        Self {
            base: NodeBase::new("TransformPointsNode"),
            transform,
            input: None,
            out_xyz: TypedBuffer::empty(device),
        }
    }

    pub fn set_transform(&mut self, transform: Mat3x4f) {
        self.transform = transform;
        self.base.mark_stale();
    }

    fn input(&self) -> Result<NodeRef> {
        resolved(&self.input, self.base.name())
    }
}

impl Node for TransformPointsNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn validate(&mut self) -> Result<()> {
        self.input = Some(self.base.points_input()?);
        Ok(())
    }

    fn schedule(&mut self, stream: &Stream) -> Result<()> {
        let input = self.input()?;
        let (count, in_xyz) =
            with_points(&input, |p| Ok((p.point_count(), p.field_data(Field::Xyz)?)))?;
        self.out_xyz.resize(count, false, false)?;
        kernels::transform_points(
            stream,
            count,
            in_xyz.device_ptr(),
            self.out_xyz.device_ptr(),
            self.transform,
        )
        .checked("transform_points")
    }

    fn required_fields(&self) -> &[Field] {
        &[Field::Xyz]
    }

    fn as_points(&self) -> Option<&dyn PointsNode> {
        Some(self)
    }
}

impl PointsNode for TransformPointsNode {
    fn point_count(&self) -> usize {
        self.input()
            .and_then(|input| with_points(&input, |p| Ok(p.point_count())))
            .unwrap_or(0)
    }

    fn has_field(&self, field: Field) -> bool {
        field == Field::Xyz
            || self
                .input()
                .and_then(|input| with_points(&input, |p| Ok(p.has_field(field))))
                .unwrap_or(false)
    }

    fn field_data(&self, field: Field) -> Result<FieldView> {
        if field == Field::Xyz {
            return Ok(FieldView::new(field, self.out_xyz.untyped()));
        }
        with_points(&self.input()?, |p| p.field_data(field))
    }

    /// Points moved by `T` are seen from the sensor as `L * T^-1`.
    fn look_at_origin_transform(&self) -> Mat3x4f {
        let upstream = self
            .input()
            .and_then(|input| with_points(&input, |p| Ok(p.look_at_origin_transform())))
            .unwrap_or(Mat3x4f::IDENTITY);
        upstream * self.transform.inverse()
    }
}
