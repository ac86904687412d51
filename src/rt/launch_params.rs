//! Host/device parameter layouts.
//!
//! These structs are read byte-for-byte by device programs. Field order,
//! sizes and explicit padding are part of the contract; the tests pin the
//! offsets.

use bytemuck::{Pod, Zeroable};
use std::fmt;

use crate::device::DevicePtr;

/// Opaque handle of a traversable acceleration structure.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct TraversableHandle(u64);

impl TraversableHandle {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub(crate) fn as_device_ptr(self) -> DevicePtr {
        DevicePtr::from_raw(self.0)
    }
}

impl fmt::Debug for TraversableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraversableHandle(0x{:x})", self.0)
    }
}

/// Ray types of the general rendering path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum RayType {
    Radiance = 0,
    Shadow = 1,
}

impl RayType {
    pub const COUNT: u32 = 2;
}

/// Ray types of the LiDAR path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum LidarRayType {
    Lidar = 0,
}

impl LidarRayType {
    pub const COUNT: u32 = 1;
}

/// Frame block of [`LaunchParams`] (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct FrameParams {
    /// `u32` RGBA8 per pixel
    pub color_buffer: DevicePtr,
    /// `f32` LiDAR samples
    pub lidar_buffer: DevicePtr,
    pub size: [i32; 2],
    pub lidar_size: u32,
    pub _pad0: u32,
}

/// Camera block of [`LaunchParams`] (48 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct CameraParams {
    pub position: [f32; 3],
    pub direction: [f32; 3],
    pub horizontal: [f32; 3],
    pub vertical: [f32; 3],
}

/// Launch parameters of the general rendering path (88 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct LaunchParams {
    pub frame: FrameParams,
    pub camera: CameraParams,
    pub traversable: TraversableHandle,
}

/// Launch parameters of the LiDAR path (40 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct LaunchLidarParams {
    /// `Mat3x4f` per ray
    pub ray_buffer: DevicePtr,
    /// `Vec3` hit position per ray
    pub position_buffer: DevicePtr,
    /// Ray count
    pub fb_size: i32,
    pub _pad0: u32,
    /// `i32` hit flag per ray
    pub hit_buffer: DevicePtr,
    pub traversable: TraversableHandle,
}

/// Shading record of one triangle mesh (64 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct TriangleMeshSbtData {
    pub color: [f32; 3],
    pub _pad0: u32,
    /// `Vec3` per vertex
    pub vertex: DevicePtr,
    /// `Vec3` per vertex, may be null
    pub normal: DevicePtr,
    /// `Vec2` per vertex, may be null
    pub texcoord: DevicePtr,
    /// `[i32; 3]` per triangle
    pub index: DevicePtr,
    pub has_texture: u8,
    pub _pad1: [u8; 7],
    pub texture: u64,
}
