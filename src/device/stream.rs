//! Compute streams: ordered queues of asynchronous device operations.
//!
//! Each stream owns one worker thread fed through a channel, so operations
//! submitted to the same stream run strictly in submission order while the
//! submitting thread returns immediately. Kernels are fanned out onto the
//! device's thread pool by the worker.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::memory::DevicePtr;
use super::{Device, Status};

type Operation = Box<dyn FnOnce() -> Result<(), Status> + Send>;

struct Task {
    label: &'static str,
    op: Operation,
}

thread_local! {
    static ON_STREAM_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// True when called from inside a stream operation.
pub(crate) fn on_stream_worker() -> bool {
    ON_STREAM_WORKER.with(|f| f.get())
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct StreamState {
    submitted: u64,
    completed: u64,
    error: Option<Status>,
}

/// State shared between a [`Stream`] handle, its worker and the device.
pub(crate) struct StreamShared {
    state: Mutex<StreamState>,
    idle: Condvar,
}

impl StreamShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(StreamState::default()),
            idle: Condvar::new(),
        }
    }

    /// Block until everything submitted so far has completed.
    pub(crate) fn wait(&self) -> Result<(), Status> {
        let mut state = self.state.lock();
        let target = state.submitted;
        while state.completed < target {
            self.idle.wait(&mut state);
        }
        state.error.map_or(Ok(()), Err)
    }
}

/// Ordered queue of asynchronous operations on one device.
pub struct Stream {
    id: u64,
    device: Device,
    shared: Arc<StreamShared>,
    sender: Option<Sender<Task>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    /// Create a stream on `device`.
    pub fn new(device: &Device) -> Result<Self, Status> {
        device.check()?;
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(StreamShared::new());
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();

        let worker = {
            let shared = Arc::clone(&shared);
            let device = device.clone();
            std::thread::Builder::new()
                .name(format!("lidarsim-stream-{id}"))
                .spawn(move || worker_loop(id, device, shared, receiver))
                .map_err(|_| Status::NotInitialized)?
        };

        device.register_stream(&shared);
        tracing::debug!(stream = id, "created stream");
        Ok(Self {
            id,
            device: device.clone(),
            shared,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Sticky error of this stream, if an operation has failed.
    pub fn error(&self) -> Option<Status> {
        self.shared.state.lock().error
    }

    /// Submit `op`. Returns immediately; `op` runs after everything queued before it.
    ///
    /// Fails without queueing if the stream or its device already failed.
    pub fn enqueue<F>(&self, label: &'static str, op: F) -> Result<(), Status>
    where
        F: FnOnce() -> Result<(), Status> + Send + 'static,
    {
        self.device.check()?;
        let sender = self.sender.as_ref().ok_or(Status::InvalidHandle)?;
        {
            let mut state = self.shared.state.lock();
            if let Some(status) = state.error {
                return Err(status);
            }
            state.submitted += 1;
        }
        let task = Task {
            label,
            op: Box::new(op),
        };
        if sender.send(task).is_err() {
            let mut state = self.shared.state.lock();
            state.submitted -= 1;
            return Err(Status::InvalidHandle);
        }
        Ok(())
    }

    /// Launch `kernel` over `count` threads, indexed `0..count`.
    pub fn launch_kernel<K>(&self, name: &'static str, count: usize, kernel: K) -> Result<(), Status>
    where
        K: Fn(usize) + Send + Sync + 'static,
    {
        if count == 0 {
            return Ok(());
        }
        let device = self.device.clone();
        self.enqueue(name, move || {
            device.run_kernel(count, kernel);
            Ok(())
        })
    }

    /// Stream-ordered copy of `bytes` between unified addresses.
    ///
    /// # Safety
    /// Both ranges must stay valid until the copy has executed.
    pub unsafe fn memcpy_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
    ) -> Result<(), Status> {
        if bytes == 0 {
            return Ok(());
        }
        if dst.is_null() || src.is_null() {
            return Err(Status::InvalidValue);
        }
        self.enqueue("memcpy_async", move || {
            // SAFETY: caller guarantees both ranges outlive the operation.
            unsafe { std::ptr::copy(src.as_ptr::<u8>(), dst.as_mut_ptr::<u8>(), bytes) };
            Ok(())
        })
    }

    /// Block until all work submitted so far has finished.
    pub fn synchronize(&self) -> Result<(), Status> {
        if on_stream_worker() {
            return self.error().map_or(Ok(()), Err);
        }
        self.shared.wait()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(status) = self.synchronize() {
            tracing::warn!(stream = self.id, %status, "stream destroyed after failure");
        }
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(stream = self.id, "stream worker panicked");
            }
        }
        tracing::debug!(stream = self.id, "destroyed stream");
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("error", &self.error())
            .finish()
    }
}

fn worker_loop(id: u64, device: Device, shared: Arc<StreamShared>, receiver: Receiver<Task>) {
    ON_STREAM_WORKER.with(|f| f.set(true));
    for Task { label, op } in receiver.iter() {
        let poisoned = shared.state.lock().error.is_some();
        let result = if poisoned {
            // Earlier failure: drain without executing.
            Ok(())
        } else {
            match catch_unwind(AssertUnwindSafe(op)) {
                Ok(result) => result,
                Err(_) => Err(Status::LaunchFailure),
            }
        };

        let mut state = shared.state.lock();
        if let Err(status) = result {
            tracing::error!(stream = id, op = label, %status, "stream operation failed");
            state.error = Some(status);
            device.record_fault(status);
        }
        state.completed += 1;
        shared.idle.notify_all();
    }
}
