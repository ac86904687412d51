//! Shader binding table.
//!
//! Every record starts with a [`SbtRecordHeader`] packed from the program
//! group that should run for it, followed by the record's user data.

use bytemuck::{Pod, Zeroable};

use super::launch_params::TriangleMeshSbtData;
use crate::device::DevicePtr;

pub const SBT_RECORD_HEADER_SIZE: usize = 32;
pub const SBT_RECORD_ALIGNMENT: usize = 16;

/// Opaque record header; see [`ProgramGroup::pack_header`](super::ProgramGroup::pack_header).
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SbtRecordHeader {
    pub(crate) bytes: [u8; SBT_RECORD_HEADER_SIZE],
}

impl SbtRecordHeader {
    pub(crate) fn from_program_group(id: u64) -> Self {
        let mut bytes = [0u8; SBT_RECORD_HEADER_SIZE];
        bytes[..8].copy_from_slice(&id.to_le_bytes());
        Self { bytes }
    }

    pub(crate) fn program_group(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.bytes[..8]);
        u64::from_le_bytes(id)
    }
}

/// Record without user data (raygen, miss).
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct EmptyRecord {
    pub header: SbtRecordHeader,
}

/// Hit group record of one triangle mesh.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct HitgroupRecord {
    pub header: SbtRecordHeader,
    pub data: TriangleMeshSbtData,
}

/// Device addresses of the records a launch dispatches through.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ShaderBindingTable {
    pub raygen_record: DevicePtr,
    pub miss_record_base: DevicePtr,
    pub miss_record_stride_in_bytes: u32,
    pub miss_record_count: u32,
    pub hitgroup_record_base: DevicePtr,
    pub hitgroup_record_stride_in_bytes: u32,
    pub hitgroup_record_count: u32,
}

impl ShaderBindingTable {
    pub(crate) fn miss_record(&self, index: u32) -> Option<DevicePtr> {
        record(
            self.miss_record_base,
            self.miss_record_stride_in_bytes,
            self.miss_record_count,
            index,
        )
    }

    pub(crate) fn hitgroup_record(&self, index: u32) -> Option<DevicePtr> {
        record(
            self.hitgroup_record_base,
            self.hitgroup_record_stride_in_bytes,
            self.hitgroup_record_count,
            index,
        )
    }
}

fn record(base: DevicePtr, stride: u32, count: u32, index: u32) -> Option<DevicePtr> {
    if base.is_null() || index >= count {
        return None;
    }
    Some(base.offset_bytes(index as usize * stride as usize))
}
