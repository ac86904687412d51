//! Statically typed view over [`ManagedBuffer`].

use bytemuck::Pod;
use std::fmt;
use std::marker::PhantomData;

use super::managed::{ManagedBuffer, TypeDescriptor};
use crate::device::{Device, DevicePtr, Placement, Stream};
use crate::util::{Error, Result};

/// [`ManagedBuffer`] whose element type is known at compile time.
pub struct TypedBuffer<T: Pod> {
    inner: ManagedBuffer,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Pod> TypedBuffer<T> {
    /// Buffer on the current device with `count` zeroed elements.
    pub fn new(count: usize) -> Result<Self> {
        Ok(Self::wrap(ManagedBuffer::new(TypeDescriptor::of::<T>(), count)?))
    }

    pub fn with_device(device: &Device, count: usize) -> Result<Self> {
        Ok(Self::wrap(ManagedBuffer::with_device(
            device,
            TypeDescriptor::of::<T>(),
            count,
        )?))
    }

    /// Buffer without an allocation.
    pub fn empty(device: &Device) -> Self {
        Self::wrap(ManagedBuffer::empty(device, TypeDescriptor::of::<T>()))
    }

    /// Buffer on `device` holding a copy of `data`.
    pub fn from_slice(device: &Device, data: &[T]) -> Result<Self> {
        let mut buffer = Self::empty(device);
        buffer.set_data(data)?;
        Ok(buffer)
    }

    fn wrap(inner: ManagedBuffer) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.inner.byte_len()
    }

    #[inline]
    pub fn device_ptr(&self) -> DevicePtr {
        self.inner.device_ptr()
    }

    #[inline]
    pub fn device(&self) -> &Device {
        self.inner.device()
    }

    pub fn resize(&mut self, count: usize, zero_init: bool, preserve_data: bool) -> Result<()> {
        self.inner.resize(count, zero_init, preserve_data)
    }

    pub fn reserve(&mut self, capacity: usize, preserve_data: bool) -> Result<()> {
        self.inner.reserve(capacity, preserve_data)
    }

    /// Grow to exactly `count` elements if shorter, discarding contents.
    ///
    /// Returns whether the buffer grew. A buffer that is already long
    /// enough keeps its length and contents.
    pub fn resize_to_fit(&mut self, count: usize) -> Result<bool> {
        if self.len() >= count {
            return Ok(false);
        }
        self.inner.reserve(count, false)?;
        self.inner.resize(count, false, false)?;
        Ok(true)
    }

    /// Replace the contents with `data`.
    pub fn set_data(&mut self, data: &[T]) -> Result<()> {
        self.inner.copy_from_slice(data)
    }

    /// Replace the contents with `count` elements read from `src`.
    ///
    /// # Safety
    /// `src` must reference `count` readable elements of `T`.
    pub unsafe fn copy_from(&mut self, src: DevicePtr, count: usize) -> Result<()> {
        self.inner.copy_from(src, count)
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.inner.to_vec::<T>()
    }

    pub fn hint_location(&self, placement: Placement, stream: Option<&Stream>) -> Result<()> {
        self.inner.hint_location(placement, stream)
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self::wrap(self.inner.try_clone()?))
    }

    /// Move the contents out, leaving `self` empty.
    pub fn take(&mut self) -> Self {
        Self::wrap(self.inner.take())
    }

    #[inline]
    pub fn untyped(&self) -> &ManagedBuffer {
        &self.inner
    }

    pub fn into_untyped(self) -> ManagedBuffer {
        self.inner
    }
}

impl<T: Pod> TryFrom<ManagedBuffer> for TypedBuffer<T> {
    type Error = Error;

    fn try_from(buffer: ManagedBuffer) -> Result<Self> {
        buffer.check_type::<T>()?;
        Ok(Self::wrap(buffer))
    }
}

impl<T: Pod> fmt::Debug for TypedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::DeviceConfig;
    use glam::Vec3;

    fn device() -> Device {
        Device::new(&DeviceConfig::default()).unwrap()
    }

    #[test]
    fn test_resize_to_fit_grows_exactly() {
        let mut buf = TypedBuffer::<u8>::empty(&device());
        assert!(buf.resize_to_fit(100).unwrap());
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.capacity(), 100);
        assert!(!buf.resize_to_fit(100).unwrap());
        assert!(!buf.resize_to_fit(10).unwrap());
        assert_eq!(buf.len(), 100);
        assert!(buf.resize_to_fit(101).unwrap());
        assert_eq!(buf.capacity(), 101);
    }

    #[test]
    fn test_from_slice_round_trip() {
        let points = [Vec3::X, Vec3::Y, Vec3::new(1.0, 2.0, 3.0)];
        let buf = TypedBuffer::from_slice(&device(), &points).unwrap();
        assert_eq!(buf.to_vec().unwrap(), points.to_vec());
        assert_eq!(buf.byte_len(), 36);
    }

    #[test]
    fn test_try_from_untyped() {
        let device = device();
        let raw = ManagedBuffer::with_device(&device, TypeDescriptor::of::<f32>(), 2).unwrap();
        assert!(TypedBuffer::<u32>::try_from(raw).is_err());
        let raw = ManagedBuffer::with_device(&device, TypeDescriptor::of::<f32>(), 2).unwrap();
        let typed = TypedBuffer::<f32>::try_from(raw).unwrap();
        assert_eq!(typed.to_vec().unwrap(), vec![0.0, 0.0]);
    }
}
