//! Device programs and the contexts they run in.
//!
//! A [`DeviceCode`] is the unit a [`Module`](super::Module) is created
//! from: a table of named entry points plus the name and size of the
//! launch parameter block they read.

use bytemuck::Pod;
use std::sync::Arc;

use super::launch_params::{LaunchLidarParams, LidarRayType, TraversableHandle};
use super::module::LinkedPipeline;
use super::sbt::{SbtRecordHeader, ShaderBindingTable, SBT_RECORD_HEADER_SIZE};
use super::traverse::{trace_closest, AnyHitResult, Candidate, TraceRay};
use crate::device::{DevicePtr, Status};
use crate::util::{Mat3x4f, Vec2, Vec3};

/// Payload registers carried by a ray.
pub type Payload = [u32; 4];

pub type RaygenFn = fn(&RaygenContext<'_>) -> Result<(), Status>;
pub type MissFn = fn(&mut MissContext<'_>);
pub type ClosestHitFn = fn(&mut HitContext<'_>);
pub type AnyHitFn = fn(&mut HitContext<'_>) -> AnyHitResult;

/// Entry point table of a device program set.
pub struct DeviceCode {
    pub name: &'static str,
    pub launch_params_variable: &'static str,
    pub launch_params_size: usize,
    pub raygen: &'static [(&'static str, RaygenFn)],
    pub miss: &'static [(&'static str, MissFn)],
    pub closest_hit: &'static [(&'static str, ClosestHitFn)],
    pub any_hit: &'static [(&'static str, AnyHitFn)],
}

fn lookup<F: Copy>(table: &[(&'static str, F)], entry: &str) -> Option<F> {
    table.iter().find(|(name, _)| *name == entry).map(|(_, f)| *f)
}

impl DeviceCode {
    pub(crate) fn raygen_entry(&self, entry: &str) -> Option<RaygenFn> {
        lookup(self.raygen, entry)
    }

    pub(crate) fn miss_entry(&self, entry: &str) -> Option<MissFn> {
        lookup(self.miss, entry)
    }

    pub(crate) fn closest_hit_entry(&self, entry: &str) -> Option<ClosestHitFn> {
        lookup(self.closest_hit, entry)
    }

    pub(crate) fn any_hit_entry(&self, entry: &str) -> Option<AnyHitFn> {
        lookup(self.any_hit, entry)
    }
}

/// One `trace` request issued by a raygen program.
#[derive(Clone, Copy, Debug)]
pub struct TraceCall {
    pub handle: TraversableHandle,
    pub origin: Vec3,
    pub direction: Vec3,
    pub tmin: f32,
    pub tmax: f32,
    /// Ray type; added to the instance's hit record offset
    pub sbt_offset: u32,
    /// Ray type count; scales the geometry's build-input index
    pub sbt_stride: u32,
    pub miss_index: u32,
}

/// What a raygen program sees for one launch index.
pub struct RaygenContext<'a> {
    pub(crate) launch_index: u32,
    pub(crate) launch_dimensions: [u32; 3],
    pub(crate) params: DevicePtr,
    pub(crate) sbt: &'a ShaderBindingTable,
    pub(crate) pipeline: &'a Arc<LinkedPipeline>,
}

impl RaygenContext<'_> {
    /// Linear launch index.
    pub fn launch_index(&self) -> u32 {
        self.launch_index
    }

    pub fn launch_dimensions(&self) -> [u32; 3] {
        self.launch_dimensions
    }

    /// The launch parameter block.
    pub fn params<T: Pod>(&self) -> T {
        // SAFETY: the launch checked the block size against the module.
        unsafe { self.params.read(0) }
    }

    /// Trace a ray and run the closest-hit or miss program on `payload`.
    pub fn trace(&self, call: &TraceCall, payload: &mut Payload) -> Result<(), Status> {
        let ray = TraceRay {
            origin: call.origin,
            direction: call.direction,
            tmin: call.tmin,
            tmax: call.tmax,
        };
        let mut fault = None;
        let mut any_hit = |candidate: &Candidate| -> AnyHitResult {
            match self.any_hit(call, &ray, candidate, payload) {
                Ok(verdict) => verdict,
                Err(status) => {
                    fault.get_or_insert(status);
                    AnyHitResult::Terminate
                }
            }
        };
        // SAFETY: handles in launch parameters are built structures kept alive by the launcher.
        let hit = unsafe {
            trace_closest(call.handle, &ray, self.pipeline.max_graph_depth, &mut any_hit)?
        };
        if let Some(status) = fault {
            return Err(status);
        }

        match hit {
            Some(candidate) => {
                let record = self.hit_record(call, &candidate)?;
                let header = read_header(record);
                let programs = self.pipeline.hitgroup(header.program_group())?;
                if let Some(closest_hit) = programs.closest_hit {
                    let mut ctx = HitContext::new(&ray, &candidate, record, payload);
                    closest_hit(&mut ctx);
                }
            }
            None => {
                let record = self.sbt.miss_record(call.miss_index).ok_or(Status::InvalidValue)?;
                let miss = self.pipeline.miss(read_header(record).program_group())?;
                miss(&mut MissContext {
                    payload,
                    ray_tmax: call.tmax,
                });
            }
        }
        Ok(())
    }

    fn hit_record(&self, call: &TraceCall, candidate: &Candidate) -> Result<DevicePtr, Status> {
        let index = hitgroup_record_index(
            call.sbt_offset,
            call.sbt_stride,
            GAS_SBT_INDEX,
            candidate.instance.sbt_offset,
        )
        .ok_or(Status::InvalidValue)?;
        self.sbt.hitgroup_record(index).ok_or(Status::InvalidValue)
    }

    fn any_hit(
        &self,
        call: &TraceCall,
        ray: &TraceRay,
        candidate: &Candidate,
        payload: &mut Payload,
    ) -> Result<AnyHitResult, Status> {
        let record = self.hit_record(call, candidate)?;
        let programs = self.pipeline.hitgroup(read_header(record).program_group())?;
        Ok(match programs.any_hit {
            Some(any_hit) => any_hit(&mut HitContext::new(ray, candidate, record, payload)),
            None => AnyHitResult::Accept,
        })
    }
}

/// Build-input index within a geometry structure; structures are built
/// from a single input.
const GAS_SBT_INDEX: u32 = 0;

/// `ray offset + ray stride * geometry index + instance offset`.
fn hitgroup_record_index(
    ray_offset: u32,
    ray_stride: u32,
    geometry_index: u32,
    instance_offset: u32,
) -> Option<u32> {
    ray_stride
        .checked_mul(geometry_index)?
        .checked_add(ray_offset)?
        .checked_add(instance_offset)
}

fn read_header(record: DevicePtr) -> SbtRecordHeader {
    // SAFETY: records come from the launch's shader binding table.
    unsafe { record.read(0) }
}

/// What hit programs see for one candidate intersection.
pub struct HitContext<'a> {
    pub payload: &'a mut Payload,
    ray_origin: Vec3,
    ray_direction: Vec3,
    ray_tmax: f32,
    primitive_index: u32,
    instance_id: u32,
    instance_index: u32,
    barycentrics: Vec2,
    record: DevicePtr,
}

impl<'a> HitContext<'a> {
    fn new(ray: &TraceRay, candidate: &Candidate, record: DevicePtr, payload: &'a mut Payload) -> Self {
        Self {
            payload,
            ray_origin: ray.origin,
            ray_direction: ray.direction,
            ray_tmax: candidate.t,
            primitive_index: candidate.primitive_index,
            instance_id: candidate.instance.instance_id,
            instance_index: candidate.instance.instance_index,
            barycentrics: candidate.barycentrics,
            record,
        }
    }

    /// Hit distance along the world ray.
    pub fn ray_tmax(&self) -> f32 {
        self.ray_tmax
    }

    pub fn world_ray_origin(&self) -> Vec3 {
        self.ray_origin
    }

    pub fn world_ray_direction(&self) -> Vec3 {
        self.ray_direction
    }

    pub fn hit_point(&self) -> Vec3 {
        self.ray_origin + self.ray_direction * self.ray_tmax
    }

    pub fn primitive_index(&self) -> u32 {
        self.primitive_index
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn instance_index(&self) -> u32 {
        self.instance_index
    }

    pub fn triangle_barycentrics(&self) -> Vec2 {
        self.barycentrics
    }

    /// User data following the record header.
    pub fn sbt_data<T: Pod>(&self) -> T {
        // SAFETY: the record stride covers header plus data for this hit group.
        unsafe { self.record.offset_bytes(SBT_RECORD_HEADER_SIZE).read(0) }
    }
}

/// What a miss program sees.
pub struct MissContext<'a> {
    pub payload: &'a mut Payload,
    ray_tmax: f32,
}

impl MissContext<'_> {
    pub fn ray_tmax(&self) -> f32 {
        self.ray_tmax
    }
}

// LiDAR programs

pub const LIDAR_LAUNCH_PARAMS_VARIABLE: &str = "optixLaunchLidarParams";
pub const LIDAR_RAYGEN: &str = "__raygen__renderLidar";
pub const LIDAR_MISS: &str = "__miss__lidar";
pub const LIDAR_CLOSEST_HIT: &str = "__closesthit__lidar";
pub const LIDAR_ANY_HIT: &str = "__anyhit__lidar";

/// Maximum LiDAR range.
pub const LIDAR_RANGE: f32 = 1e4;

const PAYLOAD_HIT: usize = 3;

/// LiDAR ray casting: one ray per launch index, origin at the ray
/// transform's translation, direction along its Z axis.
pub static LIDAR_DEVICE_CODE: DeviceCode = DeviceCode {
    name: "lidar",
    launch_params_variable: LIDAR_LAUNCH_PARAMS_VARIABLE,
    launch_params_size: std::mem::size_of::<LaunchLidarParams>(),
    raygen: &[(LIDAR_RAYGEN, lidar_raygen)],
    miss: &[(LIDAR_MISS, lidar_miss)],
    closest_hit: &[(LIDAR_CLOSEST_HIT, lidar_closest_hit)],
    any_hit: &[(LIDAR_ANY_HIT, lidar_any_hit)],
};

fn lidar_raygen(ctx: &RaygenContext<'_>) -> Result<(), Status> {
    let params: LaunchLidarParams = ctx.params();
    let i = ctx.launch_index() as usize;
    if i >= params.fb_size.max(0) as usize {
        return Ok(());
    }
    // SAFETY: buffers in the launch parameters hold fb_size elements.
    let ray: Mat3x4f = unsafe { params.ray_buffer.read(i) };
    let mut payload: Payload = [0; 4];
    ctx.trace(
        &TraceCall {
            handle: params.traversable,
            origin: ray.translation(),
            direction: ray.z_axis(),
            tmin: 0.0,
            tmax: LIDAR_RANGE,
            sbt_offset: LidarRayType::Lidar as u32,
            sbt_stride: LidarRayType::COUNT,
            miss_index: LidarRayType::Lidar as u32,
        },
        &mut payload,
    )?;

    let hit = payload[PAYLOAD_HIT] != 0;
    let position = if hit {
        Vec3::new(
            f32::from_bits(payload[0]),
            f32::from_bits(payload[1]),
            f32::from_bits(payload[2]),
        )
    } else {
        Vec3::ZERO
    };
    unsafe {
        params.position_buffer.write(i, position);
        params.hit_buffer.write(i, i32::from(hit));
    }
    Ok(())
}

fn lidar_miss(ctx: &mut MissContext<'_>) {
    *ctx.payload = [0; 4];
}

fn lidar_closest_hit(ctx: &mut HitContext<'_>) {
    let p = ctx.hit_point();
    *ctx.payload = [p.x.to_bits(), p.y.to_bits(), p.z.to_bits(), 1];
}

fn lidar_any_hit(_ctx: &mut HitContext<'_>) -> AnyHitResult {
    AnyHitResult::Accept
}
