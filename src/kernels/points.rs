use crate::device::{DevicePtr, Status, Stream};
use crate::util::{Mat3x4f, Vec3};

/// `out[i] = transform * in[i]` over `count` points.
pub fn transform_points(
    stream: &Stream,
    count: usize,
    in_xyz: DevicePtr,
    out_xyz: DevicePtr,
    transform: Mat3x4f,
) -> Result<(), Status> {
    stream.launch_kernel("transform_points", count, move |i| unsafe {
        let p: Vec3 = in_xyz.read(i);
        out_xyz.write(i, transform.transform_point(p));
    })
}

/// `out[i] = i` over `count` indices.
pub fn fill_ray_indices(stream: &Stream, count: usize, out_idx: DevicePtr) -> Result<(), Status> {
    stream.launch_kernel("fill_ray_indices", count, move |i| unsafe {
        out_idx.write(i, i as u32);
    })
}

/// Distance from each ray's origin to its hit point; 0 where the ray missed.
pub fn compute_distances(
    stream: &Stream,
    count: usize,
    rays: DevicePtr,
    xyz: DevicePtr,
    is_hit: DevicePtr,
    out_distance: DevicePtr,
) -> Result<(), Status> {
    stream.launch_kernel("compute_distances", count, move |i| unsafe {
        let distance = if is_hit.read::<i32>(i) != 0 {
            let ray: Mat3x4f = rays.read(i);
            (xyz.read::<Vec3>(i) - ray.translation()).length()
        } else {
            0.0
        };
        out_distance.write(i, distance);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TypedBuffer;
    use crate::device::Device;
    use crate::util::DeviceConfig;

    #[test]
    fn test_transform_points_and_indices() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let stream = Stream::new(&device).unwrap();
        let input = TypedBuffer::from_slice(&device, &[Vec3::X, Vec3::Y]).unwrap();
        let output = TypedBuffer::<Vec3>::with_device(&device, 2).unwrap();
        let idx = TypedBuffer::<u32>::with_device(&device, 5).unwrap();

        let t = Mat3x4f::from_translation(Vec3::Z);
        transform_points(&stream, 2, input.device_ptr(), output.device_ptr(), t).unwrap();
        fill_ray_indices(&stream, 5, idx.device_ptr()).unwrap();
        stream.synchronize().unwrap();

        assert_eq!(output.to_vec().unwrap(), vec![Vec3::new(1.0, 0.0, 1.0), Vec3::new(0.0, 1.0, 1.0)]);
        assert_eq!(idx.to_vec().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_distances_zero_on_miss() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let stream = Stream::new(&device).unwrap();
        let origin = Mat3x4f::from_translation(Vec3::new(1.0, 0.0, 0.0));
        let rays = TypedBuffer::from_slice(&device, &[origin, origin]).unwrap();
        let xyz = TypedBuffer::from_slice(&device, &[Vec3::new(1.0, 0.0, 5.0), Vec3::ZERO]).unwrap();
        let hit = TypedBuffer::from_slice(&device, &[1i32, 0]).unwrap();
        let out = TypedBuffer::<f32>::with_device(&device, 2).unwrap();

        compute_distances(
            &stream,
            2,
            rays.device_ptr(),
            xyz.device_ptr(),
            hit.device_ptr(),
            out.device_ptr(),
        )
        .unwrap();
        stream.synchronize().unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![5.0, 0.0]);
    }
}
