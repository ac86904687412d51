//! Growable unified-memory buffer with a runtime element type.

use bytemuck::Pod;
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use crate::device::{Device, DeviceAllocation, DevicePtr, Placement, Stream};
use crate::util::{CheckStatus, Error, Result};

/// Runtime description of a buffer's element type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    pub name: &'static str,
    pub id: TypeId,
    pub size: usize,
}

impl TypeDescriptor {
    pub fn of<T: Pod>() -> Self {
        Self {
            name: std::any::type_name::<T>(),
            id: TypeId::of::<T>(),
            size: std::mem::size_of::<T>(),
        }
    }

    #[inline]
    pub fn is<T: Pod>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

/// Contiguous unified-memory array of `count` elements of one type.
///
/// `capacity >= count` always holds and capacity never shrinks. Growth
/// allocates a new block; the old block is released only after the device
/// has drained queued work that may still reference it.
pub struct ManagedBuffer {
    device: Device,
    ty: TypeDescriptor,
    data: Option<Arc<DeviceAllocation>>,
    count: usize,
    capacity: usize,
}

impl ManagedBuffer {
    /// Buffer on the current device holding `count` zeroed elements.
    pub fn new(ty: TypeDescriptor, count: usize) -> Result<Self> {
        let device = Device::current().checked("Device::current")?;
        Self::with_device(&device, ty, count)
    }

    /// Buffer on `device` holding `count` zeroed elements.
    pub fn with_device(device: &Device, ty: TypeDescriptor, count: usize) -> Result<Self> {
        let mut buffer = Self::empty(device, ty);
        buffer.resize(count, true, false)?;
        Ok(buffer)
    }

    /// Buffer without an allocation.
    pub fn empty(device: &Device, ty: TypeDescriptor) -> Self {
        Self {
            device: device.clone(),
            ty,
            data: None,
            count: 0,
            capacity: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn type_descriptor(&self) -> TypeDescriptor {
        self.ty
    }

    #[inline]
    pub fn element_size(&self) -> usize {
        self.ty.size
    }

    /// Size of the live elements in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.count * self.ty.size
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Address of element 0, or null when nothing is allocated.
    pub fn device_ptr(&self) -> DevicePtr {
        self.data
            .as_ref()
            .map_or(DevicePtr::NULL, |alloc| alloc.device_ptr())
    }

    pub(crate) fn allocation(&self) -> Option<&Arc<DeviceAllocation>> {
        self.data.as_ref()
    }

    pub(crate) fn check_type<T: Pod>(&self) -> Result<()> {
        if self.ty.is::<T>() {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                expected: self.ty.name,
                actual: std::any::type_name::<T>(),
            })
        }
    }

    fn bytes_for(&self, count: usize) -> Result<usize> {
        count.checked_mul(self.ty.size).ok_or_else(|| {
            Error::invalid_argument(format!("{count} elements of {} overflow", self.ty.name))
        })
    }

    /// Set the element count to `new_count`.
    ///
    /// Grows capacity to at least `max(new_count, 2 * capacity)` when needed.
    /// With `preserve_data` the first `min(len, new_count)` elements survive.
    /// With `zero_init` every element past the preserved prefix is zeroed
    /// (all of them when not preserving).
    pub fn resize(&mut self, new_count: usize, zero_init: bool, preserve_data: bool) -> Result<()> {
        if new_count > self.capacity {
            let grown = new_count.max(self.capacity.saturating_mul(2));
            self.reserve(grown, preserve_data)?;
        }
        if zero_init {
            let start = if preserve_data { self.count.min(new_count) } else { 0 };
            if new_count > start {
                let offset = self.bytes_for(start)?;
                let bytes = self.bytes_for(new_count - start)?;
                let dst = self.device_ptr().offset_bytes(offset);
                // SAFETY: [start, new_count) lies within capacity.
                unsafe { self.device.memset(dst, 0, bytes) }.checked("ManagedBuffer::resize")?;
            }
        }
        self.count = new_count;
        Ok(())
    }

    /// Ensure room for `new_capacity` elements; allocates exactly that much.
    ///
    /// No-op if the capacity already suffices. When reallocating without
    /// `preserve_data` the count resets to zero.
    pub fn reserve(&mut self, new_capacity: usize, preserve_data: bool) -> Result<()> {
        if self.capacity >= new_capacity {
            return Ok(());
        }
        let bytes = self.bytes_for(new_capacity)?;
        let alloc = self
            .device
            .alloc_managed(bytes)
            .checked("ManagedBuffer::reserve")?;

        if let Some(old) = &self.data {
            if preserve_data && self.count > 0 {
                let live = self.bytes_for(self.count)?;
                // SAFETY: both blocks hold at least `live` bytes.
                unsafe { self.device.memcpy(alloc.device_ptr(), old.device_ptr(), live) }
                    .checked("ManagedBuffer::reserve")?;
            } else {
                self.device.synchronize().checked("ManagedBuffer::reserve")?;
            }
        }

        tracing::trace!(
            ty = self.ty.name,
            from = self.capacity,
            to = new_capacity,
            preserve_data,
            "buffer reallocated"
        );
        self.data = Some(Arc::new(alloc));
        self.capacity = new_capacity;
        if !preserve_data {
            self.count = 0;
        }
        Ok(())
    }

    /// Replace the contents with `src`.
    pub fn copy_from_slice<T: Pod>(&mut self, src: &[T]) -> Result<()> {
        self.check_type::<T>()?;
        // SAFETY: a live slice of `src.len()` elements of the buffer's type.
        unsafe { self.copy_from(DevicePtr::from_host(src.as_ptr()), src.len()) }
    }

    /// Replace the contents with `count` elements read from `src`.
    ///
    /// Works for host and device addresses alike.
    ///
    /// # Safety
    /// `src` must reference `count` readable elements of this buffer's type.
    pub unsafe fn copy_from(&mut self, src: DevicePtr, count: usize) -> Result<()> {
        self.resize(count, false, false)?;
        let bytes = self.bytes_for(count)?;
        self.device
            .memcpy(self.device_ptr(), src, bytes)
            .checked("ManagedBuffer::copy_from")
    }

    /// Copy the live elements back into a `Vec`.
    pub fn to_vec<T: Pod>(&self) -> Result<Vec<T>> {
        self.check_type::<T>()?;
        let mut out = vec![T::zeroed(); self.count];
        let bytes = self.byte_len();
        // SAFETY: `out` holds `count` elements, the buffer at least as many.
        unsafe {
            self.device
                .memcpy(DevicePtr::from_host(out.as_mut_ptr()), self.device_ptr(), bytes)
        }
        .checked("ManagedBuffer::to_vec")?;
        Ok(out)
    }

    /// Advise the runtime to migrate the storage toward `placement`.
    ///
    /// No-op on an empty buffer. Never affects results.
    pub fn hint_location(&self, placement: Placement, stream: Option<&Stream>) -> Result<()> {
        match &self.data {
            Some(alloc) if self.capacity > 0 => self
                .device
                .prefetch_async(alloc, placement, stream)
                .checked("ManagedBuffer::hint_location"),
            _ => Ok(()),
        }
    }

    /// Last placement applied to the storage, if any.
    pub fn placement(&self) -> Option<Placement> {
        self.data.as_ref().map(|alloc| alloc.placement())
    }

    /// Deep copy into a new, independent allocation of the same capacity.
    pub fn try_clone(&self) -> Result<Self> {
        let mut copy = Self::empty(&self.device, self.ty);
        if self.capacity > 0 {
            copy.reserve(self.capacity, false)?;
            let bytes = self.bytes_for(self.capacity)?;
            // SAFETY: both blocks hold `capacity` elements.
            unsafe { self.device.memcpy(copy.device_ptr(), self.device_ptr(), bytes) }
                .checked("ManagedBuffer::try_clone")?;
        }
        copy.count = self.count;
        Ok(copy)
    }

    /// Move the allocation out, leaving `self` empty (no allocation, zero count and capacity).
    pub fn take(&mut self) -> Self {
        let empty = Self::empty(&self.device, self.ty);
        std::mem::replace(self, empty)
    }
}

impl Drop for ManagedBuffer {
    fn drop(&mut self) {
        if self.data.is_some() {
            if let Err(status) = self.device.synchronize() {
                tracing::warn!(ty = self.ty.name, %status, "releasing buffer after device fault");
            }
        }
    }
}

impl fmt::Debug for ManagedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedBuffer")
            .field("ty", &self.ty.name)
            .field("count", &self.count)
            .field("capacity", &self.capacity)
            .field("ptr", &self.device_ptr())
            .finish()
    }
}
