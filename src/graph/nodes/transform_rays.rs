use crate::buffer::TypedBuffer;
use crate::device::{Device, Stream};
use crate::graph::node::resolved;
use crate::graph::{with_rays, Node, NodeBase, NodeRef, RaysNode};
use crate::kernels;
use crate::util::{CheckStatus, Mat3x4f, Result};

/// Applies a fixed transform to every upstream ray.
pub struct TransformRaysNode {
    base: NodeBase,
    transform: Mat3x4f,
    input: Option<NodeRef>,
    rays: TypedBuffer<Mat3x4f>,
}

impl TransformRaysNode {
    pub fn new(transform: Mat3x4f) -> Result<Self> {
        let device = Device::current().checked("Device::current")?;
        Ok(Self::with_device(&device, transform))
    }

    pub fn with_device(device: &Device, transform: Mat3x4f) -> Self {
        Self {
            base: NodeBase::new("TransformRaysNode"),
            transform,
            input: None,
            rays: TypedBuffer::empty(device),
        }
    }

    pub fn transform(&self) -> Mat3x4f {
        self.transform
    }

    pub fn set_transform(&mut self, transform: Mat3x4f) {
        self.transform = transform;
        self.base.mark_stale();
    }
}

impl Node for TransformRaysNode {
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
        let input = resolved(&self.input, self.base.name())?;
        with_rays(&input, |src| {
            let count = src.ray_count();
            self.rays.resize(count, false, false)?;
            kernels::transform_rays(
                stream,
                count,
                src.rays().device_ptr(),
                self.rays.device_ptr(),
                self.transform,
            )
            .checked("transform_rays")
        })
    }

    fn as_rays(&self) -> Option<&dyn RaysNode> {
        Some(self)
    }
}

impl RaysNode for TransformRaysNode {
    fn rays(&self) -> &TypedBuffer<Mat3x4f> {
        &self.rays
    }

    fn ray_count(&self) -> usize {
        self.input
            .as_ref()
            .and_then(|input| with_rays(input, |src| Ok(src.ray_count())).ok())
            .unwrap_or(0)
    }

    fn cumulative_ray_transform(&self) -> Mat3x4f {
        let upstream = self
            .input
            .as_ref()
            .and_then(|input| with_rays(input, |src| Ok(src.cumulative_ray_transform())).ok())
            .unwrap_or(Mat3x4f::IDENTITY);
        self.transform * upstream
    }
}
