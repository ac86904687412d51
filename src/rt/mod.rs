//! Ray-tracing backend.
//!
//! - [`DeviceContext`]: context on the device's primary context, with log callbacks
//! - [`Module`], [`ProgramGroup`], [`Pipeline`]: compiled device programs
//! - [`accel`]: acceleration structure size query, build and compaction
//! - [`RayTracingBackend`]: the LiDAR pipeline, shared process-wide

pub mod accel;
mod backend;
mod bvh;
mod context;
mod device_code;
mod launch_params;
mod module;
mod sbt;
mod traverse;

pub use accel::{
    accel_build, accel_compact, accel_compute_memory_usage, AccelBufferSizes, AccelBuildOptions,
    BuildFlags, BuildInput, BuildOperation, Instance, InstanceArray, TriangleArray,
};
pub use backend::RayTracingBackend;
pub use bvh::{build_bvh, Aabb, Bvh, BvhNode};
pub use context::{
    DeviceContext, LogCallback, LOG_LEVEL_ERROR, LOG_LEVEL_FATAL, LOG_LEVEL_INFO, LOG_LEVEL_WARN,
};
pub use device_code::{
    AnyHitFn, ClosestHitFn, DeviceCode, HitContext, MissContext, MissFn, Payload, RaygenContext,
    RaygenFn, TraceCall, LIDAR_ANY_HIT, LIDAR_CLOSEST_HIT, LIDAR_DEVICE_CODE,
    LIDAR_LAUNCH_PARAMS_VARIABLE, LIDAR_MISS, LIDAR_RANGE, LIDAR_RAYGEN,
};
pub use launch_params::{
    CameraParams, FrameParams, LaunchLidarParams, LaunchParams, LidarRayType, RayType,
    TraversableHandle, TriangleMeshSbtData,
};
pub use module::{
    Module, ModuleCompileOptions, Pipeline, PipelineCompileOptions, PipelineLinkOptions,
    ProgramGroup, ProgramGroupDesc, StackSizes, TraversableGraphFlags,
};
pub use sbt::{
    EmptyRecord, HitgroupRecord, SbtRecordHeader, ShaderBindingTable, SBT_RECORD_ALIGNMENT,
    SBT_RECORD_HEADER_SIZE,
};
pub use traverse::AnyHitResult;
