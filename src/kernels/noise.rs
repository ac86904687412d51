use super::rng::PcgState;
use crate::device::{DevicePtr, Status, Stream};
use crate::util::{Axis, Mat3x4f, Vec3};

/// Initialize generator states `offset..offset + count`.
pub fn setup_gaussian_noise_generator(
    stream: &Stream,
    offset: usize,
    count: usize,
    seed: u64,
    states: DevicePtr,
) -> Result<(), Status> {
    stream.launch_kernel("setup_gaussian_noise_generator", count, move |i| unsafe {
        let idx = offset + i;
        states.write(idx, PcgState::new(idx as u64, seed));
    })
}

/// Rotate each point around `axis` of the `look_at_origin` frame by
/// `mean + st_dev * N(0, 1)` radians.
///
/// When `out_distance` is non-null it receives the length of the rotated
/// point in the reference frame.
#[allow(clippy::too_many_arguments)]
pub fn add_gaussian_noise_angular_hitpoint(
    stream: &Stream,
    count: usize,
    mean: f32,
    st_dev: f32,
    axis: Axis,
    look_at_origin: Mat3x4f,
    states: DevicePtr,
    in_xyz: DevicePtr,
    out_xyz: DevicePtr,
    out_distance: DevicePtr,
) -> Result<(), Status> {
    let to_world = look_at_origin.inverse();
    let axis = axis.unit();
    stream.launch_kernel("add_gaussian_noise_angular_hitpoint", count, move |i| unsafe {
        let mut rng: PcgState = states.read(i);
        let angle = mean + st_dev * rng.next_normal();
        states.write(i, rng);

        let local = look_at_origin.transform_point(in_xyz.read::<Vec3>(i));
        let rotated = Mat3x4f::from_axis_angle(axis, angle).transform_point(local);
        out_xyz.write(i, to_world.transform_point(rotated));
        if !out_distance.is_null() {
            out_distance.write(i, rotated.length());
        }
    })
}
