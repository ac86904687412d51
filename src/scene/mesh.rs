use crate::buffer::TypedBuffer;
use crate::device::{Device, DevicePtr, Stream};
use crate::rt::{
    AccelBuildOptions, BuildFlags, BuildInput, DeviceContext, TraversableHandle, TriangleArray,
    TriangleMeshSbtData,
};
use crate::util::{Error, Result, Vec3};

use super::AccelBuildScratch;

/// Triangle mesh in device memory with its own geometry acceleration structure.
#[derive(Debug)]
pub struct Mesh {
    vertices: TypedBuffer<Vec3>,
    indices: TypedBuffer<[i32; 3]>,
    color: Vec3,
    scratch: AccelBuildScratch,
    gas: TraversableHandle,
    dirty: bool,
}

impl Mesh {
    pub fn new(device: &Device, vertices: &[Vec3], indices: &[[i32; 3]]) -> Result<Self> {
        check_indices(vertices.len(), indices)?;
        Ok(Self {
            vertices: TypedBuffer::from_slice(device, vertices)?,
            indices: TypedBuffer::from_slice(device, indices)?,
            color: Vec3::ONE,
            scratch: AccelBuildScratch::new(device),
            gas: TraversableHandle::NULL,
            dirty: true,
        })
    }

    /// Replace vertex positions; the index buffer must stay in range.
    pub fn set_vertices(&mut self, vertices: &[Vec3]) -> Result<()> {
        check_indices(vertices.len(), &self.indices.to_vec()?)?;
        self.vertices.set_data(vertices)?;
        self.dirty = true;
        Ok(())
    }

    pub fn set_color(&mut self, color: Vec3) {
        self.color = color;
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    /// Handle of the last build; null before the first one.
    pub fn gas(&self) -> TraversableHandle {
        self.gas
    }

    pub fn sbt_data(&self) -> TriangleMeshSbtData {
        TriangleMeshSbtData {
            color: self.color.to_array(),
            vertex: self.vertices.device_ptr(),
            normal: DevicePtr::NULL,
            texcoord: DevicePtr::NULL,
            index: self.indices.device_ptr(),
            has_texture: 0,
            ..Default::default()
        }
    }

    fn build_input(&self) -> BuildInput {
        BuildInput::Triangles(TriangleArray {
            vertex_buffer: self.vertices.device_ptr(),
            num_vertices: self.vertices.len() as u32,
            vertex_stride_in_bytes: std::mem::size_of::<Vec3>() as u32,
            index_buffer: self.indices.device_ptr(),
            num_index_triplets: self.indices.len() as u32,
            index_stride_in_bytes: std::mem::size_of::<[i32; 3]>() as u32,
        })
    }

    /// Rebuild the structure if the geometry changed. Returns whether it did.
    pub(crate) fn update_gas(&mut self, ctx: &DeviceContext, stream: &Stream) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let input = self.build_input();
        let options = AccelBuildOptions {
            build_flags: BuildFlags::PREFER_FAST_TRACE,
            ..Default::default()
        };
        self.scratch.resize_to_fit(ctx, &input, &options)?;
        self.gas = self.scratch.build(ctx, stream, &input, &options)?;
        self.dirty = false;
        tracing::trace!(triangles = self.triangle_count(), gas = ?self.gas, "mesh structure built");
        Ok(true)
    }
}

fn check_indices(vertex_count: usize, indices: &[[i32; 3]]) -> Result<()> {
    if let Some((tri, idx)) = indices.iter().enumerate().find_map(|(t, tri)| {
        tri.iter()
            .find(|&&i| i < 0 || i as usize >= vertex_count)
            .map(|&i| (t, i))
    }) {
        return Err(Error::invalid_argument(format!(
            "triangle {tri} references vertex {idx}, mesh has {vertex_count}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::DeviceConfig;

    #[test]
    fn test_rejects_out_of_range_indices() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let verts = [Vec3::ZERO, Vec3::X, Vec3::Y];
        assert!(Mesh::new(&device, &verts, &[[0, 1, 2]]).is_ok());
        let err = Mesh::new(&device, &verts, &[[0, 1, 3]]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let mut mesh = Mesh::new(&device, &verts, &[[0, 1, 2]]).unwrap();
        assert!(mesh.set_vertices(&[Vec3::ZERO, Vec3::X]).is_err());
    }

    #[test]
    fn test_gas_rebuilds_only_when_dirty() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let ctx = DeviceContext::create(&device).unwrap();
        let stream = Stream::new(&device).unwrap();
        let verts = [Vec3::ZERO, Vec3::X, Vec3::Y];
        let mut mesh = Mesh::new(&device, &verts, &[[0, 1, 2]]).unwrap();
        assert!(mesh.gas().is_null());

        assert!(mesh.update_gas(&ctx, &stream).unwrap());
        assert!(!mesh.gas().is_null());
        assert!(!mesh.update_gas(&ctx, &stream).unwrap());

        mesh.set_vertices(&[Vec3::ZERO, Vec3::Y, Vec3::Z]).unwrap();
        assert!(mesh.update_gas(&ctx, &stream).unwrap());
        stream.synchronize().unwrap();
        assert_eq!(mesh.sbt_data().vertex, mesh.vertices.device_ptr());
    }
}
