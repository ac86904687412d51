//! Unified (managed) device memory.
//!
//! Allocations live in a single address space shared by host code and
//! kernels. A [`DevicePtr`] is a plain 64-bit address, so it can be embedded
//! in `#[repr(C)]` parameter blobs exactly like a native device pointer.

use bytemuck::{Pod, Zeroable};
use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{Device, Status};

/// Alignment of every managed allocation.
pub const ALLOCATION_ALIGNMENT: usize = 256;

/// Address in the unified address space (host and device).
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn from_raw(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address of host memory, usable as the source/destination of a device-aware copy.
    #[inline]
    pub fn from_host<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    /// Pointer advanced by `bytes`.
    #[inline]
    pub const fn offset_bytes(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    #[inline]
    pub(crate) fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    #[inline]
    pub(crate) fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    /// Read element `index` of a `T` array starting at this address.
    ///
    /// # Safety
    /// The address must reference live memory holding at least `index + 1` elements.
    #[inline]
    pub unsafe fn read<T: Pod>(self, index: usize) -> T {
        self.as_ptr::<T>().add(index).read_unaligned()
    }

    /// Write element `index` of a `T` array starting at this address.
    ///
    /// # Safety
    /// The address must reference live, writable memory holding at least
    /// `index + 1` elements, with no concurrent access to the same element.
    #[inline]
    pub unsafe fn write<T: Pod>(self, index: usize, value: T) {
        self.as_mut_ptr::<T>().add(index).write_unaligned(value)
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr(0x{:x})", self.0)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Processor a managed allocation should preferably reside on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Placement {
    Host,
    Device(u32),
}

impl Placement {
    const HOST_CODE: u32 = u32::MAX;

    fn encode(self) -> u32 {
        match self {
            Placement::Host => Self::HOST_CODE,
            Placement::Device(ordinal) => ordinal,
        }
    }

    fn decode(code: u32) -> Self {
        if code == Self::HOST_CODE {
            Placement::Host
        } else {
            Placement::Device(code)
        }
    }
}

/// One managed allocation. Freed when dropped.
///
/// Dropping does not synchronize; owners that may still have queued work
/// reading the memory must synchronize first (see [`crate::buffer::ManagedBuffer`]).
pub struct DeviceAllocation {
    device: Device,
    ptr: NonNull<u8>,
    size: usize,
    placement: AtomicU32,
}

// The allocation is plain bytes in the unified address space; access is
// governed by stream ordering, not by Rust borrows.
unsafe impl Send for DeviceAllocation {}
unsafe impl Sync for DeviceAllocation {}

impl DeviceAllocation {
    fn layout(size: usize) -> Result<Layout, Status> {
        Layout::from_size_align(size.max(1), ALLOCATION_ALIGNMENT).map_err(|_| Status::InvalidValue)
    }

    /// Allocate `size` zero-filled bytes. Budget accounting is done by the caller.
    pub(super) fn allocate_zeroed(device: Device, size: usize) -> Result<Self, Status> {
        let layout = Self::layout(size)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(Status::OutOfMemory)?;
        let placement = AtomicU32::new(Placement::Device(device.ordinal()).encode());
        Ok(Self {
            device,
            ptr,
            size,
            placement,
        })
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Base address.
    #[inline]
    pub fn device_ptr(&self) -> DevicePtr {
        DevicePtr::from_host(self.ptr.as_ptr())
    }

    /// Owning device.
    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Last placement hint applied to this allocation.
    pub fn placement(&self) -> Placement {
        Placement::decode(self.placement.load(Ordering::Acquire))
    }

    pub(super) fn set_placement(&self, placement: Placement) {
        self.placement.store(placement.encode(), Ordering::Release);
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.size) {
            // SAFETY: allocated in allocate_zeroed with the same layout.
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
        self.device.release_bytes(self.size);
        tracing::trace!(bytes = self.size, ptr = %self.device_ptr(), "freed managed allocation");
    }
}

impl fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("ptr", &self.device_ptr())
            .field("size", &self.size)
            .field("placement", &self.placement())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ptr_layout() {
        assert_eq!(std::mem::size_of::<DevicePtr>(), 8);
        assert!(DevicePtr::NULL.is_null());
        assert_eq!(DevicePtr::from_raw(16).offset_bytes(8).as_raw(), 24);
    }

    #[test]
    fn test_placement_codes() {
        assert_eq!(Placement::decode(Placement::Host.encode()), Placement::Host);
        assert_eq!(Placement::decode(Placement::Device(0).encode()), Placement::Device(0));
    }

    #[test]
    fn test_read_write_host_memory() {
        let mut values = [0u32; 4];
        let ptr = DevicePtr::from_host(values.as_mut_ptr());
        unsafe {
            ptr.write(2, 7u32);
            assert_eq!(ptr.read::<u32>(2), 7);
        }
        assert_eq!(values, [0, 0, 7, 0]);
    }
}
