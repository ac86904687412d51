//! Device runtime.
//!
//! A single software device with unified (managed) memory, asynchronous
//! streams and data-parallel kernels. Every call reports failure as a
//! [`Status`]; the first failure of any queued operation is sticky for the
//! whole device, so a hard fault stays visible for the rest of the session.
//!
//! ```no_run
//! use lidarsim::device::{Device, Stream};
//!
//! let device = Device::current()?;
//! let stream = Stream::new(&device)?;
//! stream.launch_kernel("noop", 128, |_| {})?;
//! stream.synchronize()?;
//! # Ok::<(), lidarsim::device::Status>(())
//! ```

mod memory;
mod status;
mod stream;

pub use memory::{DeviceAllocation, DevicePtr, Placement, ALLOCATION_ALIGNMENT};
pub use status::Status;
pub use stream::Stream;

use parking_lot::Mutex;
use rayon::prelude::*;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::util::DeviceConfig;
use stream::StreamShared;

static CURRENT: Mutex<Option<Device>> = parking_lot::const_mutex(None);

struct DeviceInner {
    ordinal: u32,
    name: String,
    memory_limit: Option<usize>,
    allocated: AtomicUsize,
    streams: Mutex<Vec<Weak<StreamShared>>>,
    sticky_error: Mutex<Option<Status>>,
    primary_context_refs: AtomicUsize,
    pool: rayon::ThreadPool,
}

/// Handle to a device. Cheap to clone; all clones refer to the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Create an independent device.
    pub fn new(config: &DeviceConfig) -> Result<Self, Status> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|i| format!("lidarsim-kernel-{i}"))
            .build()
            .map_err(|_| Status::NotInitialized)?;
        let inner = DeviceInner {
            ordinal: 0,
            name: format!("lidarsim software device ({} lanes)", pool.current_num_threads()),
            memory_limit: config.memory_limit_bytes,
            allocated: AtomicUsize::new(0),
            streams: Mutex::new(Vec::new()),
            sticky_error: Mutex::new(None),
            primary_context_refs: AtomicUsize::new(0),
            pool,
        };
        tracing::debug!(name = %inner.name, limit = ?inner.memory_limit, "device created");
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Initialize the process-wide device with `config`.
    ///
    /// If the device already exists it is returned unchanged.
    pub fn init(config: &DeviceConfig) -> Result<Self, Status> {
        let mut current = CURRENT.lock();
        if let Some(device) = current.as_ref() {
            tracing::debug!("device already initialized");
            return Ok(device.clone());
        }
        let device = Self::new(config)?;
        *current = Some(device.clone());
        Ok(device)
    }

    /// The process-wide device, created with default settings on first use.
    pub fn current() -> Result<Self, Status> {
        Self::init(&DeviceConfig::default())
    }

    #[inline]
    pub fn ordinal(&self) -> u32 {
        self.inner.ordinal
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Bytes held by live allocations.
    pub fn allocated_bytes(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.inner.memory_limit
    }

    /// Number of kernel lanes.
    pub fn lanes(&self) -> usize {
        self.inner.pool.current_num_threads()
    }

    /// Sticky error recorded by a failed operation, if any.
    pub fn last_error(&self) -> Option<Status> {
        *self.inner.sticky_error.lock()
    }

    pub(crate) fn check(&self) -> Result<(), Status> {
        self.last_error().map_or(Ok(()), Err)
    }

    pub(crate) fn record_fault(&self, status: Status) {
        let mut sticky = self.inner.sticky_error.lock();
        if sticky.is_none() {
            tracing::error!(%status, "device fault, session is no longer usable");
            *sticky = Some(status);
        }
    }

    /// Allocate `bytes` of zero-filled unified memory.
    pub fn alloc_managed(&self, bytes: usize) -> Result<DeviceAllocation, Status> {
        self.check()?;
        self.reserve_bytes(bytes)?;
        match DeviceAllocation::allocate_zeroed(self.clone(), bytes) {
            Ok(allocation) => {
                tracing::trace!(bytes, ptr = %allocation.device_ptr(), "managed allocation");
                Ok(allocation)
            }
            Err(status) => {
                self.release_bytes(bytes);
                Err(status)
            }
        }
    }

    fn reserve_bytes(&self, bytes: usize) -> Result<(), Status> {
        let allocated = &self.inner.allocated;
        let mut current = allocated.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(bytes).ok_or(Status::OutOfMemory)?;
            if let Some(limit) = self.inner.memory_limit {
                if next > limit {
                    tracing::warn!(bytes, allocated = current, limit, "device out of memory");
                    return Err(Status::OutOfMemory);
                }
            }
            match allocated.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn release_bytes(&self, bytes: usize) {
        self.inner.allocated.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Device-aware synchronous copy between any two unified addresses.
    ///
    /// Waits for all queued work of the device first.
    ///
    /// # Safety
    /// Both ranges must be valid for `bytes` bytes.
    pub unsafe fn memcpy(&self, dst: DevicePtr, src: DevicePtr, bytes: usize) -> Result<(), Status> {
        self.synchronize()?;
        if bytes == 0 {
            return Ok(());
        }
        if dst.is_null() || src.is_null() {
            return Err(Status::InvalidValue);
        }
        std::ptr::copy(src.as_ptr::<u8>(), dst.as_mut_ptr::<u8>(), bytes);
        Ok(())
    }

    /// Synchronous fill of `bytes` bytes at `dst` with `value`.
    ///
    /// # Safety
    /// The range must be valid for `bytes` bytes.
    pub unsafe fn memset(&self, dst: DevicePtr, value: u8, bytes: usize) -> Result<(), Status> {
        self.synchronize()?;
        if bytes == 0 {
            return Ok(());
        }
        if dst.is_null() {
            return Err(Status::InvalidValue);
        }
        std::ptr::write_bytes(dst.as_mut_ptr::<u8>(), value, bytes);
        Ok(())
    }

    /// Advise migration of `allocation` toward `placement`.
    ///
    /// With a stream the hint is applied in stream order, otherwise immediately.
    pub fn prefetch_async(
        &self,
        allocation: &Arc<DeviceAllocation>,
        placement: Placement,
        stream: Option<&Stream>,
    ) -> Result<(), Status> {
        if let Placement::Device(ordinal) = placement {
            if ordinal != self.ordinal() {
                return Err(Status::InvalidDevice);
            }
        }
        match stream {
            Some(stream) => {
                let allocation = Arc::clone(allocation);
                stream.enqueue("prefetch_async", move || {
                    allocation.set_placement(placement);
                    Ok(())
                })
            }
            None => {
                self.check()?;
                allocation.set_placement(placement);
                Ok(())
            }
        }
    }

    /// Wait for every live stream of this device, then report the sticky error.
    pub fn synchronize(&self) -> Result<(), Status> {
        if !stream::on_stream_worker() {
            let streams: Vec<Arc<StreamShared>> = {
                let mut list = self.inner.streams.lock();
                list.retain(|s| s.strong_count() > 0);
                list.iter().filter_map(Weak::upgrade).collect()
            };
            for shared in streams {
                // Per-stream failures are also recorded as the device error.
                let _ = shared.wait();
            }
        }
        self.check()
    }

    pub(crate) fn register_stream(&self, shared: &Arc<StreamShared>) {
        let mut list = self.inner.streams.lock();
        list.retain(|s| s.strong_count() > 0);
        list.push(Arc::downgrade(shared));
    }

    /// Run `kernel` for every index in `0..count` on the kernel pool and wait.
    pub(crate) fn run_kernel<K>(&self, count: usize, kernel: K)
    where
        K: Fn(usize) + Send + Sync,
    {
        self.inner
            .pool
            .install(|| (0..count).into_par_iter().for_each(|i| kernel(i)));
    }

    /// Retain the device's primary context.
    pub fn primary_context_retain(&self) -> Result<usize, Status> {
        self.check()?;
        let refs = self.inner.primary_context_refs.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(refs, "primary context retained");
        Ok(refs)
    }

    /// Release one reference to the primary context.
    pub fn primary_context_release(&self) -> Result<usize, Status> {
        let refs = &self.inner.primary_context_refs;
        let mut current = refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(Status::InvalidContext);
            }
            match refs.compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    tracing::trace!(refs = current - 1, "primary context released");
                    return Ok(current - 1);
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn primary_context_refs(&self) -> usize {
        self.inner.primary_context_refs.load(Ordering::Acquire)
    }

    /// True if both handles refer to the same device.
    pub fn same(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("ordinal", &self.inner.ordinal)
            .field("name", &self.inner.name)
            .field("allocated", &self.allocated_bytes())
            .field("error", &self.last_error())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_zeroed_and_aligned() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let alloc = device.alloc_managed(1000).unwrap();
        assert_eq!(alloc.device_ptr().as_raw() % ALLOCATION_ALIGNMENT as u64, 0);
        let bytes: Vec<u8> = (0..1000).map(|i| unsafe { alloc.device_ptr().read::<u8>(i) }).collect();
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(device.allocated_bytes(), 1000);
        drop(alloc);
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn test_memory_limit() {
        let config = DeviceConfig {
            memory_limit_bytes: Some(4096),
            ..Default::default()
        };
        let device = Device::new(&config).unwrap();
        let a = device.alloc_managed(4000).unwrap();
        assert_eq!(device.alloc_managed(200).unwrap_err(), Status::OutOfMemory);
        drop(a);
        assert!(device.alloc_managed(200).is_ok());
        // Allocation failure is not a device fault.
        assert_eq!(device.last_error(), None);
    }

    #[test]
    fn test_memcpy_memset() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let alloc = device.alloc_managed(16).unwrap();
        let src = [9u8; 8];
        unsafe {
            device.memset(alloc.device_ptr(), 0xff, 16).unwrap();
            device
                .memcpy(alloc.device_ptr(), DevicePtr::from_host(src.as_ptr()), 8)
                .unwrap();
            assert_eq!(alloc.device_ptr().read::<u8>(7), 9);
            assert_eq!(alloc.device_ptr().read::<u8>(8), 0xff);
            assert_eq!(
                device.memcpy(DevicePtr::NULL, alloc.device_ptr(), 4),
                Err(Status::InvalidValue)
            );
        }
    }

    #[test]
    fn test_prefetch_hint() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        let stream = Stream::new(&device).unwrap();
        let alloc = Arc::new(device.alloc_managed(64).unwrap());
        assert_eq!(alloc.placement(), Placement::Device(0));
        device
            .prefetch_async(&alloc, Placement::Host, Some(&stream))
            .unwrap();
        stream.synchronize().unwrap();
        assert_eq!(alloc.placement(), Placement::Host);
        assert_eq!(
            device.prefetch_async(&alloc, Placement::Device(3), None),
            Err(Status::InvalidDevice)
        );
    }

    #[test]
    fn test_primary_context_refcount() {
        let device = Device::new(&DeviceConfig::default()).unwrap();
        assert_eq!(device.primary_context_retain().unwrap(), 1);
        assert_eq!(device.primary_context_retain().unwrap(), 2);
        assert_eq!(device.primary_context_release().unwrap(), 1);
        assert_eq!(device.primary_context_release().unwrap(), 0);
        assert_eq!(device.primary_context_release(), Err(Status::InvalidContext));
    }

    #[test]
    fn test_current_is_shared() {
        let a = Device::current().unwrap();
        let b = Device::current().unwrap();
        assert_eq!(a, b);
    }
}
