use crate::buffer::TypedBuffer;
use crate::device::{Device, Stream};
use crate::graph::{Node, NodeBase, RaysNode};
use crate::util::{CheckStatus, Mat3x4f, Result};

/// Ray source: one ray per host-provided transform.
pub struct RaysFromMat3x4Node {
    base: NodeBase,
    rays: TypedBuffer<Mat3x4f>,
}

impl RaysFromMat3x4Node {
    pub fn new() -> Result<Self> {
        let device = Device::current().checked("Device::current")?;
        Ok(Self::with_device(&device))
    }

    pub fn with_device(device: &Device) -> Self {
        Self {
            base: NodeBase::new("RaysFromMat3x4Node"),
            rays: TypedBuffer::empty(device),
        }
    }

    /// Replace the rays.
    pub fn set_rays(&mut self, rays: &[Mat3x4f]) -> Result<()> {
        self.rays.set_data(rays)?;
        self.base.mark_stale();
        Ok(())
    }
}

impl Node for RaysFromMat3x4Node {
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

    fn as_rays(&self) -> Option<&dyn RaysNode> {
        Some(self)
    }
}

impl RaysNode for RaysFromMat3x4Node {
    fn rays(&self) -> &TypedBuffer<Mat3x4f> {
        &self.rays
    }

    fn ray_count(&self) -> usize {
        self.rays.len()
    }

    fn cumulative_ray_transform(&self) -> Mat3x4f {
        Mat3x4f::IDENTITY
    }
}
