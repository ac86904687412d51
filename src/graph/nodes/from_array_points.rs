use crate::buffer::TypedBuffer;
use crate::device::{Device, Stream};
use crate::graph::{Field, FieldView, Node, NodeBase, PointsNode};
use crate::util::{CheckStatus, Error, Mat3x4f, Result, Vec3};

/// Point source from host arrays, with an optional distance channel.
pub struct FromArrayPointsNode {
    base: NodeBase,
    xyz: TypedBuffer<Vec3>,
    distance: Option<TypedBuffer<f32>>,
    look_at_origin: Mat3x4f,
}

impl FromArrayPointsNode {
    pub fn new() -> Result<Self> {
        let device = Device::current().checked("Device::current")?;
        Ok(Self::with_device(&device))
    }

    pub fn with_device(device: &Device) -> Self {
        Self {
            base: NodeBase::new("FromArrayPointsNode"),
            xyz: TypedBuffer::empty(device),
            distance: None,
            look_at_origin: Mat3x4f::IDENTITY,
        }
    }

    /// Replace the points. `distance`, when given, must match `xyz` in length.
    pub fn set_points(&mut self, xyz: &[Vec3], distance: Option<&[f32]>) -> Result<()> {
        if let Some(d) = distance {
            if d.len() != xyz.len() {
                return Err(Error::invalid_argument(format!(
                    "{} distances for {} points",
                    d.len(),
                    xyz.len()
                )));
            }
        }
        let had_distance = self.distance.is_some();
        self.xyz.set_data(xyz)?;
        match distance {
            Some(d) => {
                let buffer = self
                    .distance
                    .get_or_insert_with(|| TypedBuffer::empty(self.xyz.device()));
                buffer.set_data(d)?;
            }
            None => self.distance = None,
        }
        if had_distance != self.distance.is_some() {
            self.base.invalidate();
        } else {
            self.base.mark_stale();
        }
        Ok(())
    }

    /// Sensor frame the points were measured in (world to sensor).
    pub fn set_look_at_origin(&mut self, transform: Mat3x4f) {
        self.look_at_origin = transform;
        self.base.mark_stale();
    }
}

impl Node for FromArrayPointsNode {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn validate(&mut self) -> Result<()> {
        Ok(())
    }

    fn schedule(&mut self, _stream: &Stream) -> Result<()> {
        Ok(())
    }

    fn as_points(&self) -> Option<&dyn PointsNode> {
        Some(self)
    }
}

impl PointsNode for FromArrayPointsNode {
    fn point_count(&self) -> usize {
        self.xyz.len()
    }

    fn has_field(&self, field: Field) -> bool {
        match field {
            Field::Xyz => true,
            Field::Distance => self.distance.is_some(),
            _ => false,
        }
    }

    fn field_data(&self, field: Field) -> Result<FieldView> {
        match (field, &self.distance) {
            (Field::Xyz, _) => Ok(FieldView::new(field, self.xyz.untyped())),
            (Field::Distance, Some(d)) => Ok(FieldView::new(field, d.untyped())),
            _ => Err(Error::FieldNotFound {
                node: self.base.name(),
                field,
            }),
        }
    }

    fn look_at_origin_transform(&self) -> Mat3x4f {
        self.look_at_origin
    }
}
