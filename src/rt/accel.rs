//! Acceleration structure build, size query and compaction.
//!
//! A structure is one contiguous block in device memory:
//!
//! ```text
//! +---------------+------------------------+--------------------------+
//! | AccelHeader   | BvhNode * node_count   | primitive * prim_count   |
//! | 64 bytes      | 32 bytes each          | 48 (tri) / 128 (inst)    |
//! +---------------+------------------------+--------------------------+
//! ```
//!
//! All offsets are relative to the header, so the block can be relocated
//! with a plain copy. A [`TraversableHandle`] is the header's address.

use bytemuck::{Pod, Zeroable};
use std::ops::BitOr;

use super::bvh::{build_bvh, Aabb, Bvh, BvhNode};
use super::context::DeviceContext;
use super::launch_params::TraversableHandle;
use crate::device::{DevicePtr, Status, Stream};
use crate::util::Mat3x4f;

pub(crate) const ACCEL_MAGIC: u32 = 0x4c41_4353;
pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<AccelHeader>();

/// Bytes of build workspace per primitive.
const TEMP_BYTES_PER_PRIM: usize = 32;

/// Acceleration structure build flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BuildFlags(pub u32);

impl BuildFlags {
    pub const NONE: Self = Self(0);
    pub const ALLOW_UPDATE: Self = Self(1 << 0);
    pub const ALLOW_COMPACTION: Self = Self(1 << 1);
    pub const PREFER_FAST_TRACE: Self = Self(1 << 2);
    pub const PREFER_FAST_BUILD: Self = Self(1 << 3);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BuildFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BuildOperation {
    #[default]
    Build,
    /// Refit in place; requires [`BuildFlags::ALLOW_UPDATE`] on the original build.
    Update,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccelBuildOptions {
    pub build_flags: BuildFlags,
    pub operation: BuildOperation,
}

/// Buffer sizes a build needs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccelBufferSizes {
    pub output_size_in_bytes: usize,
    pub temp_size_in_bytes: usize,
    pub temp_update_size_in_bytes: usize,
}

/// Indexed triangle geometry in device memory.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TriangleArray {
    /// `[f32; 3]` per vertex
    pub vertex_buffer: DevicePtr,
    pub num_vertices: u32,
    /// 0 means tightly packed
    pub vertex_stride_in_bytes: u32,
    /// `[i32; 3]` per triangle
    pub index_buffer: DevicePtr,
    pub num_index_triplets: u32,
    /// 0 means tightly packed
    pub index_stride_in_bytes: u32,
}

/// Array of [`Instance`] records in device memory.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct InstanceArray {
    pub instances: DevicePtr,
    pub num_instances: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BuildInput {
    Triangles(TriangleArray),
    Instances(InstanceArray),
}

impl BuildInput {
    pub fn prim_count(&self) -> usize {
        match self {
            BuildInput::Triangles(t) => t.num_index_triplets as usize,
            BuildInput::Instances(i) => i.num_instances as usize,
        }
    }

    fn kind(&self) -> AccelKind {
        match self {
            BuildInput::Triangles(_) => AccelKind::Triangles,
            BuildInput::Instances(_) => AccelKind::Instances,
        }
    }

    fn validate(&self) -> Result<(), Status> {
        match self {
            BuildInput::Triangles(t) => {
                let vertex_stride = effective_stride(t.vertex_stride_in_bytes, 12);
                let index_stride = effective_stride(t.index_stride_in_bytes, 12);
                if vertex_stride < 12 || index_stride < 12 {
                    return Err(Status::InvalidValue);
                }
                if t.num_index_triplets > 0 && (t.vertex_buffer.is_null() || t.index_buffer.is_null()) {
                    return Err(Status::InvalidValue);
                }
            }
            BuildInput::Instances(i) => {
                if i.num_instances > 0 && i.instances.is_null() {
                    return Err(Status::InvalidValue);
                }
            }
        }
        Ok(())
    }
}

/// One instance of a lower-level structure (80 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Instance {
    /// Row-major object-to-world transform
    pub transform: [f32; 12],
    pub instance_id: u32,
    /// Index of the instance's first hit record
    pub sbt_offset: u32,
    /// Zero hides the instance
    pub visibility_mask: u32,
    pub flags: u32,
    pub traversable_handle: TraversableHandle,
    pub _pad: [u32; 2],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum AccelKind {
    Triangles = 1,
    Instances = 2,
}

/// Header of a built structure (64 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub(crate) struct AccelHeader {
    pub magic: u32,
    pub kind: u32,
    pub node_count: u32,
    pub prim_count: u32,
    pub aabb_min: [f32; 3],
    pub build_flags: u32,
    pub aabb_max: [f32; 3],
    pub _pad0: u32,
    pub nodes_offset: u32,
    pub prims_offset: u32,
    pub used_bytes: u64,
}

impl AccelHeader {
    pub fn kind(&self) -> Result<AccelKind, Status> {
        match self.kind {
            1 => Ok(AccelKind::Triangles),
            2 => Ok(AccelKind::Instances),
            _ => Err(Status::InvalidHandle),
        }
    }

    pub fn bounds(&self) -> Aabb {
        Aabb {
            min: self.aabb_min,
            max: self.aabb_max,
        }
    }

    /// Read and check the header at `handle`.
    ///
    /// # Safety
    /// `handle` must point at readable memory of at least [`HEADER_SIZE`] bytes.
    pub unsafe fn read(handle: TraversableHandle) -> Result<Self, Status> {
        if handle.is_null() {
            return Err(Status::InvalidHandle);
        }
        let header: Self = handle.as_device_ptr().read(0);
        if header.magic != ACCEL_MAGIC {
            return Err(Status::InvalidHandle);
        }
        header.kind()?;
        Ok(header)
    }
}

/// Triangle primitive record (48 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub(crate) struct AccelTriangle {
    pub v0: [f32; 3],
    pub prim_index: u32,
    pub v1: [f32; 3],
    pub _pad0: u32,
    pub v2: [f32; 3],
    pub _pad1: u32,
}

/// Instance primitive record (128 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub(crate) struct AccelInstance {
    pub world_to_object: [f32; 12],
    pub object_to_world: [f32; 12],
    pub instance_id: u32,
    pub instance_index: u32,
    pub sbt_offset: u32,
    pub visibility_mask: u32,
    pub child: TraversableHandle,
    pub _pad: [u32; 2],
}

fn prim_record_size(kind: AccelKind) -> usize {
    match kind {
        AccelKind::Triangles => std::mem::size_of::<AccelTriangle>(),
        AccelKind::Instances => std::mem::size_of::<AccelInstance>(),
    }
}

#[inline]
fn effective_stride(stride: u32, packed: u32) -> usize {
    if stride == 0 {
        packed as usize
    } else {
        stride as usize
    }
}

fn single_input(inputs: &[BuildInput]) -> Result<&BuildInput, Status> {
    match inputs {
        [input] => Ok(input),
        _ => Err(Status::InvalidValue),
    }
}

/// Buffer sizes needed to build `inputs` (exactly one build input).
pub fn accel_compute_memory_usage(
    _ctx: &DeviceContext,
    options: &AccelBuildOptions,
    inputs: &[BuildInput],
) -> Result<AccelBufferSizes, Status> {
    let input = single_input(inputs)?;
    input.validate()?;
    let n = input.prim_count();
    let output = HEADER_SIZE
        + Bvh::max_nodes(n) * std::mem::size_of::<BvhNode>()
        + n * prim_record_size(input.kind());
    let temp = n.max(1) * TEMP_BYTES_PER_PRIM;
    Ok(AccelBufferSizes {
        output_size_in_bytes: output,
        temp_size_in_bytes: temp,
        temp_update_size_in_bytes: if options.build_flags.contains(BuildFlags::ALLOW_UPDATE) {
            temp
        } else {
            0
        },
    })
}

/// Enqueue a build of `inputs` into `output` on `stream`.
///
/// The handle is valid immediately; the structure is usable by operations
/// enqueued after the build on the same stream. When `emit_compacted_size`
/// is given, the compacted size (`u64`) is written there in stream order.
#[allow(clippy::too_many_arguments)]
pub fn accel_build(
    ctx: &DeviceContext,
    stream: &Stream,
    options: &AccelBuildOptions,
    inputs: &[BuildInput],
    temp: DevicePtr,
    temp_size_in_bytes: usize,
    output: DevicePtr,
    output_size_in_bytes: usize,
    emit_compacted_size: Option<DevicePtr>,
) -> Result<TraversableHandle, Status> {
    let sizes = accel_compute_memory_usage(ctx, options, inputs)?;
    let required_temp = match options.operation {
        BuildOperation::Build => sizes.temp_size_in_bytes,
        BuildOperation::Update => {
            if !options.build_flags.contains(BuildFlags::ALLOW_UPDATE) {
                return Err(Status::InvalidValue);
            }
            sizes.temp_update_size_in_bytes
        }
    };
    if output.is_null() || temp.is_null() {
        return Err(Status::InvalidValue);
    }
    if temp_size_in_bytes < required_temp || output_size_in_bytes < sizes.output_size_in_bytes {
        return Err(Status::InvalidValue);
    }

    let input = *single_input(inputs)?;
    let flags = options.build_flags;
    stream.enqueue("accel_build", move || {
        // SAFETY: the caller keeps inputs and output alive until the build has run.
        let block = unsafe { serialize(&input, flags)? };
        let used = block.len();
        unsafe {
            std::ptr::copy_nonoverlapping(block.as_ptr(), output.as_mut_ptr::<u8>(), used);
            if let Some(dst) = emit_compacted_size {
                dst.write(0, used as u64);
            }
        }
        tracing::trace!(kind = ?input.kind(), prims = input.prim_count(), bytes = used, "accel built");
        Ok(())
    })?;
    Ok(TraversableHandle::from_raw(output.as_raw()))
}

/// Enqueue a copy of the structure at `input` into the smaller `output`.
pub fn accel_compact(
    _ctx: &DeviceContext,
    stream: &Stream,
    input: TraversableHandle,
    output: DevicePtr,
    output_size_in_bytes: usize,
) -> Result<TraversableHandle, Status> {
    if input.is_null() || output.is_null() {
        return Err(Status::InvalidValue);
    }
    stream.enqueue("accel_compact", move || {
        // SAFETY: the caller keeps both blocks alive until the copy has run.
        unsafe {
            let header = AccelHeader::read(input)?;
            let used = usize::try_from(header.used_bytes).map_err(|_| Status::AccelCompactionFailed)?;
            if output_size_in_bytes < used {
                return Err(Status::AccelCompactionFailed);
            }
            std::ptr::copy(input.as_device_ptr().as_ptr::<u8>(), output.as_mut_ptr::<u8>(), used);
        }
        Ok(())
    })?;
    Ok(TraversableHandle::from_raw(output.as_raw()))
}

/// Read the build input and lay out the structure block.
///
/// # Safety
/// Pointers in `input` must reference the memory they describe.
unsafe fn serialize(input: &BuildInput, flags: BuildFlags) -> Result<Vec<u8>, Status> {
    let (bvh, prims, kind): (Bvh, Vec<u8>, AccelKind) = match input {
        BuildInput::Triangles(t) => {
            let tris = read_triangles(t)?;
            let aabbs: Vec<Aabb> = tris.iter().map(triangle_bounds).collect();
            let bvh = build_bvh(&aabbs);
            let ordered: Vec<AccelTriangle> = bvh.prim_indices.iter().map(|&i| tris[i]).collect();
            (bvh, bytemuck::cast_slice(&ordered).to_vec(), AccelKind::Triangles)
        }
        BuildInput::Instances(a) => {
            let records = read_instances(a)?;
            let aabbs: Vec<Aabb> = records.iter().map(|(_, bounds)| *bounds).collect();
            let bvh = build_bvh(&aabbs);
            let ordered: Vec<AccelInstance> = bvh.prim_indices.iter().map(|&i| records[i].0).collect();
            (bvh, bytemuck::cast_slice(&ordered).to_vec(), AccelKind::Instances)
        }
    };

    let nodes_bytes: &[u8] = bytemuck::cast_slice(&bvh.nodes);
    let prims_offset = HEADER_SIZE + nodes_bytes.len();
    let used = prims_offset + prims.len();
    let bounds = bvh.bounds();
    let header = AccelHeader {
        magic: ACCEL_MAGIC,
        kind: kind as u32,
        node_count: bvh.nodes.len() as u32,
        prim_count: bvh.prim_indices.len() as u32,
        aabb_min: bounds.min,
        build_flags: flags.0,
        aabb_max: bounds.max,
        _pad0: 0,
        nodes_offset: HEADER_SIZE as u32,
        prims_offset: prims_offset as u32,
        used_bytes: used as u64,
    };

    let mut block = Vec::with_capacity(used);
    block.extend_from_slice(bytemuck::bytes_of(&header));
    block.extend_from_slice(nodes_bytes);
    block.extend_from_slice(&prims);
    Ok(block)
}

fn triangle_bounds(t: &AccelTriangle) -> Aabb {
    let mut b = Aabb::EMPTY;
    b.grow_point(t.v0);
    b.grow_point(t.v1);
    b.grow_point(t.v2);
    b
}

unsafe fn read_triangles(t: &TriangleArray) -> Result<Vec<AccelTriangle>, Status> {
    let vertex_stride = effective_stride(t.vertex_stride_in_bytes, 12);
    let index_stride = effective_stride(t.index_stride_in_bytes, 12);
    let vertex = |i: i32| -> Result<[f32; 3], Status> {
        if i < 0 || i as u32 >= t.num_vertices {
            return Err(Status::InvalidValue);
        }
        Ok(t.vertex_buffer.offset_bytes(i as usize * vertex_stride).read(0))
    };
    (0..t.num_index_triplets as usize)
        .map(|tri| {
            let idx: [i32; 3] = t.index_buffer.offset_bytes(tri * index_stride).read(0);
            Ok(AccelTriangle {
                v0: vertex(idx[0])?,
                prim_index: tri as u32,
                v1: vertex(idx[1])?,
                v2: vertex(idx[2])?,
                ..Default::default()
            })
        })
        .collect()
}

unsafe fn read_instances(a: &InstanceArray) -> Result<Vec<(AccelInstance, Aabb)>, Status> {
    (0..a.num_instances as usize)
        .map(|i| {
            let inst: Instance = a.instances.read(i);
            let child = AccelHeader::read(inst.traversable_handle)?;
            let object_to_world = Mat3x4f::from_rows(inst.transform);
            let world_to_object = object_to_world.inverse();
            let bounds = if child.prim_count == 0 {
                Aabb::EMPTY
            } else {
                child.bounds().transformed(&object_to_world)
            };
            let record = AccelInstance {
                world_to_object: world_to_object.to_rows(),
                object_to_world: inst.transform,
                instance_id: inst.instance_id,
                instance_index: i as u32,
                sbt_offset: inst.sbt_offset,
                visibility_mask: inst.visibility_mask,
                child: inst.traversable_handle,
                _pad: [0; 2],
            };
            Ok((record, bounds))
        })
        .collect()
}

/// Bounds of the structure at `handle` in its own space.
///
/// # Safety
/// `handle` must reference a built structure.
pub(crate) unsafe fn accel_bounds(handle: TraversableHandle) -> Result<Aabb, Status> {
    let header = AccelHeader::read(handle)?;
    if header.prim_count == 0 {
        return Ok(Aabb::EMPTY);
    }
    Ok(header.bounds())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TypedBuffer;
    use crate::device::Device;
    use crate::util::DeviceConfig;
    use std::mem::size_of;

    #[test]
    fn test_record_layouts() {
        assert_eq!(size_of::<AccelHeader>(), 64);
        assert_eq!(size_of::<AccelTriangle>(), 48);
        assert_eq!(size_of::<AccelInstance>(), 128);
        assert_eq!(size_of::<Instance>(), 80);
    }

    #[test]
    fn test_memory_usage() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let ctx = DeviceContext::create(&device).unwrap();
        let input = BuildInput::Triangles(TriangleArray {
            vertex_buffer: DevicePtr::from_raw(16),
            num_vertices: 3,
            index_buffer: DevicePtr::from_raw(32),
            num_index_triplets: 10,
            ..Default::default()
        });
        let sizes =
            accel_compute_memory_usage(&ctx, &AccelBuildOptions::default(), &[input]).unwrap();
        assert_eq!(sizes.output_size_in_bytes, 64 + 19 * 32 + 10 * 48);
        assert_eq!(sizes.temp_size_in_bytes, 320);
        assert_eq!(sizes.temp_update_size_in_bytes, 0);

        assert_eq!(
            accel_compute_memory_usage(&ctx, &AccelBuildOptions::default(), &[]),
            Err(Status::InvalidValue)
        );
        let bad = BuildInput::Instances(InstanceArray {
            instances: DevicePtr::NULL,
            num_instances: 2,
        });
        assert_eq!(
            accel_compute_memory_usage(&ctx, &AccelBuildOptions::default(), &[bad]),
            Err(Status::InvalidValue)
        );
    }

    #[test]
    fn test_build_and_compact() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let ctx = DeviceContext::create(&device).unwrap();
        let stream = Stream::new(&device).unwrap();

        let vertices: Vec<[f32; 3]> = (0..30).map(|i| [i as f32, (i % 3) as f32, 0.0]).collect();
        let indices: Vec<[i32; 3]> = (0..10).map(|t| [3 * t, 3 * t + 1, 3 * t + 2]).collect();
        let vb = TypedBuffer::from_slice(&device, &vertices).unwrap();
        let ib = TypedBuffer::from_slice(&device, &indices).unwrap();
        let input = BuildInput::Triangles(TriangleArray {
            vertex_buffer: vb.device_ptr(),
            num_vertices: 30,
            index_buffer: ib.device_ptr(),
            num_index_triplets: 10,
            ..Default::default()
        });
        let options = AccelBuildOptions {
            build_flags: BuildFlags::ALLOW_COMPACTION,
            ..Default::default()
        };
        let sizes = accel_compute_memory_usage(&ctx, &options, &[input]).unwrap();
        let temp = TypedBuffer::<u8>::with_device(&device, sizes.temp_size_in_bytes).unwrap();
        let out = TypedBuffer::<u8>::with_device(&device, sizes.output_size_in_bytes).unwrap();
        let compacted = TypedBuffer::<u64>::with_device(&device, 1).unwrap();

        let handle = accel_build(
            &ctx,
            &stream,
            &options,
            &[input],
            temp.device_ptr(),
            temp.len(),
            out.device_ptr(),
            out.len(),
            Some(compacted.device_ptr()),
        )
        .unwrap();
        assert_eq!(handle.as_raw(), out.device_ptr().as_raw());
        stream.synchronize().unwrap();

        let used = compacted.to_vec().unwrap()[0] as usize;
        assert!(used <= sizes.output_size_in_bytes);
        let bounds = unsafe { accel_bounds(handle) }.unwrap();
        assert_eq!(bounds.min[0], 0.0);
        assert_eq!(bounds.max[0], 29.0);

        let small = TypedBuffer::<u8>::with_device(&device, used).unwrap();
        let moved = accel_compact(&ctx, &stream, handle, small.device_ptr(), small.len()).unwrap();
        stream.synchronize().unwrap();
        assert_eq!(unsafe { accel_bounds(moved) }.unwrap(), bounds);
    }

    #[test]
    fn test_build_rejects_small_output() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let ctx = DeviceContext::create(&device).unwrap();
        let stream = Stream::new(&device).unwrap();
        let input = BuildInput::Instances(InstanceArray::default());
        let buf = TypedBuffer::<u8>::with_device(&device, 64).unwrap();
        let err = accel_build(
            &ctx,
            &stream,
            &AccelBuildOptions::default(),
            &[input],
            buf.device_ptr(),
            buf.len(),
            buf.device_ptr(),
            10,
            None,
        )
        .unwrap_err();
        assert_eq!(err, Status::InvalidValue);

        let update = AccelBuildOptions {
            operation: BuildOperation::Update,
            ..Default::default()
        };
        let err = accel_build(
            &ctx,
            &stream,
            &update,
            &[input],
            buf.device_ptr(),
            buf.len(),
            buf.device_ptr(),
            buf.len(),
            None,
        )
        .unwrap_err();
        assert_eq!(err, Status::InvalidValue);
    }
}
