use crate::device::{DevicePtr, Status, Stream};
use crate::util::Mat3x4f;

/// `out[i] = transform * in[i]` over `count` ray transforms.
pub fn transform_rays(
    stream: &Stream,
    count: usize,
    in_rays: DevicePtr,
    out_rays: DevicePtr,
    transform: Mat3x4f,
) -> Result<(), Status> {
    stream.launch_kernel("transform_rays", count, move |i| unsafe {
        let ray: Mat3x4f = in_rays.read(i);
        out_rays.write(i, transform * ray);
    })
}
