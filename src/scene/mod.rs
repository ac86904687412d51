//! Minimal scene: meshes, placed entities and the structures built over them.
//!
//! [`Scene::prepare`] builds one geometry structure per mesh and one
//! instance structure over all entities, and lays out the shader binding
//! table the LiDAR pipeline dispatches through.

mod mesh;
mod scratchpad;

pub use mesh::Mesh;
pub use scratchpad::AccelBuildScratch;

use crate::buffer::TypedBuffer;
use crate::device::{Device, Stream};
use crate::rt::{
    AccelBuildOptions, BuildFlags, BuildInput, EmptyRecord, HitgroupRecord, Instance,
    InstanceArray, LidarRayType, RayTracingBackend, ShaderBindingTable, TraversableHandle,
};
use crate::util::{Error, Mat3x4f, Result, Vec3};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeshId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntityId(usize);

#[derive(Clone, Copy, Debug)]
struct Entity {
    mesh: MeshId,
    transform: Mat3x4f,
}

#[derive(Debug)]
pub struct Scene {
    meshes: Vec<Mesh>,
    entities: Vec<Option<Entity>>,
    instances: TypedBuffer<Instance>,
    ias_scratch: AccelBuildScratch,
    raygen_record: TypedBuffer<EmptyRecord>,
    miss_record: TypedBuffer<EmptyRecord>,
    hitgroup_records: TypedBuffer<HitgroupRecord>,
    ias: TraversableHandle,
    dirty: bool,
    generation: u64,
}

impl Scene {
    pub fn new(device: &Device) -> Self {
        Self {
            meshes: Vec::new(),
            entities: Vec::new(),
            instances: TypedBuffer::empty(device),
            ias_scratch: AccelBuildScratch::new(device),
            raygen_record: TypedBuffer::empty(device),
            miss_record: TypedBuffer::empty(device),
            hitgroup_records: TypedBuffer::empty(device),
            ias: TraversableHandle::NULL,
            dirty: true,
            generation: 0,
        }
    }

    pub fn add_mesh(&mut self, mesh: Mesh) -> MeshId {
        self.meshes.push(mesh);
        self.touch();
        MeshId(self.meshes.len() - 1)
    }

    pub fn mesh(&self, id: MeshId) -> Option<&Mesh> {
        self.meshes.get(id.0)
    }

    /// Mutable access; the scene is rebuilt on the next `prepare`.
    pub fn mesh_mut(&mut self, id: MeshId) -> Option<&mut Mesh> {
        self.touch();
        self.meshes.get_mut(id.0)
    }

    pub fn add_entity(&mut self, mesh: MeshId, transform: Mat3x4f) -> Result<EntityId> {
        if mesh.0 >= self.meshes.len() {
            return Err(Error::invalid_argument(format!("unknown mesh {}", mesh.0)));
        }
        self.entities.push(Some(Entity { mesh, transform }));
        self.touch();
        Ok(EntityId(self.entities.len() - 1))
    }

    pub fn set_entity_transform(&mut self, id: EntityId, transform: Mat3x4f) -> Result<()> {
        let entity = self
            .entities
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::invalid_argument(format!("unknown entity {}", id.0)))?;
        entity.transform = transform;
        self.touch();
        Ok(())
    }

    /// Returns false if the entity did not exist.
    pub fn remove_entity(&mut self, id: EntityId) -> bool {
        match self.entities.get_mut(id.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.touch();
                true
            }
            _ => false,
        }
    }

    /// Bumped by every edit. Nodes compare it against the value they last
    /// traced to tell whether their output is stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.generation += 1;
    }

    pub fn entity_count(&self) -> usize {
        self.entities.iter().flatten().count()
    }

    /// Rebuild what changed and return the scene's traversable.
    ///
    /// A scene without entities yields a null handle; every ray misses it.
    pub fn prepare(&mut self, backend: &RayTracingBackend, stream: &Stream) -> Result<TraversableHandle> {
        let ctx = backend.context();
        let mut rebuilt = false;
        for mesh in &mut self.meshes {
            rebuilt |= mesh.update_gas(ctx, stream)?;
        }
        if !self.dirty && !rebuilt {
            return Ok(self.ias);
        }

        self.write_sbt(backend)?;

        let instances: Vec<Instance> = self
            .entities
            .iter()
            .enumerate()
            .filter_map(|(id, e)| e.map(|e| (id, e)))
            .map(|(id, entity)| Instance {
                transform: entity.transform.to_rows(),
                instance_id: id as u32,
                sbt_offset: entity.mesh.0 as u32 * LidarRayType::COUNT,
                visibility_mask: 0xff,
                flags: 0,
                traversable_handle: self.meshes[entity.mesh.0].gas(),
                _pad: [0; 2],
            })
            .collect();

        self.ias = if instances.is_empty() {
            TraversableHandle::NULL
        } else {
            self.instances.set_data(&instances)?;
            let input = BuildInput::Instances(InstanceArray {
                instances: self.instances.device_ptr(),
                num_instances: instances.len() as u32,
            });
            let options = AccelBuildOptions {
                build_flags: BuildFlags::PREFER_FAST_TRACE,
                ..Default::default()
            };
            self.ias_scratch.resize_to_fit(ctx, &input, &options)?;
            self.ias_scratch.build(ctx, stream, &input, &options)?
        };
        self.dirty = false;
        tracing::debug!(
            meshes = self.meshes.len(),
            instances = instances.len(),
            ias = ?self.ias,
            "scene prepared"
        );
        Ok(self.ias)
    }

    fn write_sbt(&mut self, backend: &RayTracingBackend) -> Result<()> {
        self.raygen_record.set_data(&[EmptyRecord {
            header: backend.raygen_header(),
        }])?;
        self.miss_record.set_data(&[EmptyRecord {
            header: backend.miss_header(),
        }])?;
        let hitgroups: Vec<HitgroupRecord> = self
            .meshes
            .iter()
            .map(|mesh| HitgroupRecord {
                header: backend.hitgroup_header(),
                data: mesh.sbt_data(),
            })
            .collect();
        self.hitgroup_records.set_data(&hitgroups)
    }

    /// Binding table written by the last [`prepare`](Self::prepare).
    pub fn sbt(&self) -> ShaderBindingTable {
        ShaderBindingTable {
            raygen_record: self.raygen_record.device_ptr(),
            miss_record_base: self.miss_record.device_ptr(),
            miss_record_stride_in_bytes: std::mem::size_of::<EmptyRecord>() as u32,
            miss_record_count: self.miss_record.len() as u32,
            hitgroup_record_base: self.hitgroup_records.device_ptr(),
            hitgroup_record_stride_in_bytes: std::mem::size_of::<HitgroupRecord>() as u32,
            hitgroup_record_count: self.hitgroup_records.len() as u32,
        }
    }

    /// Axis-aligned quad in the `z = height` plane, `half_extent` on each side.
    pub fn ground_plane(device: &Device, half_extent: f32, height: f32) -> Result<Mesh> {
        let h = half_extent;
        Mesh::new(
            device,
            &[
                Vec3::new(-h, -h, height),
                Vec3::new(h, -h, height),
                Vec3::new(h, h, height),
                Vec3::new(-h, h, height),
            ],
            &[[0, 1, 2], [0, 2, 3]],
        )
    }

    /// Axis-aligned cube centred at the origin.
    pub fn cube(device: &Device, half_extent: f32) -> Result<Mesh> {
        let h = half_extent;
        let vertices: Vec<Vec3> = (0..8)
            .map(|c| {
                Vec3::new(
                    if c & 1 == 0 { -h } else { h },
                    if c & 2 == 0 { -h } else { h },
                    if c & 4 == 0 { -h } else { h },
                )
            })
            .collect();
        #[rustfmt::skip]
        let indices = [
            [0, 2, 1], [1, 2, 3], // -z
            [4, 5, 6], [5, 7, 6], // +z
            [0, 1, 4], [1, 5, 4], // -y
            [2, 6, 3], [3, 6, 7], // +y
            [0, 4, 2], [2, 4, 6], // -x
            [1, 3, 5], [3, 7, 5], // +x
        ];
        Mesh::new(device, &vertices, &indices)
    }
}
