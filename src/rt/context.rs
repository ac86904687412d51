//! Ray-tracing device context and its diagnostic log callbacks.

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::device::{Device, Status};

pub const LOG_LEVEL_FATAL: u32 = 1;
pub const LOG_LEVEL_ERROR: u32 = 2;
pub const LOG_LEVEL_WARN: u32 = 3;
pub const LOG_LEVEL_INFO: u32 = 4;

/// Receives `(level, tag, message)`.
pub type LogCallback = Arc<dyn Fn(u32, &str, &str) + Send + Sync>;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ContextInner {
    id: u64,
    device: Device,
    callbacks: RwLock<[Option<LogCallback>; 4]>,
}

impl ContextInner {
    /// Deliver a message to the callback installed for `level`.
    pub(crate) fn log(&self, level: u32, tag: &str, message: &str) {
        let slot = match level {
            LOG_LEVEL_FATAL..=LOG_LEVEL_INFO => (level - 1) as usize,
            _ => return,
        };
        let callback = self.callbacks.read()[slot].clone();
        if let Some(callback) = callback {
            callback(level, tag, message);
        }
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.log(LOG_LEVEL_INFO, "CONTEXT", "device context destroyed");
        if let Err(status) = self.device.primary_context_release() {
            tracing::warn!(context = self.id, %status, "primary context release failed");
        }
    }
}

/// Handle held by objects created from a context, keeping it alive.
pub(crate) type ContextRef = Arc<ContextInner>;

/// Ray-tracing context bound to a device's primary context.
pub struct DeviceContext {
    inner: ContextRef,
}

impl DeviceContext {
    /// Create a context on `device`, retaining its primary context.
    pub fn create(device: &Device) -> Result<Self, Status> {
        device.primary_context_retain()?;
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(context = id, device = device.name(), "device context created");
        Ok(Self {
            inner: Arc::new(ContextInner {
                id,
                device: device.clone(),
                callbacks: RwLock::new([None, None, None, None]),
            }),
        })
    }

    /// Install (or clear) the callback for one severity level.
    ///
    /// Each of the four levels (fatal, error, warn, info) has its own slot.
    pub fn set_log_callback(&self, level: u32, callback: Option<LogCallback>) -> Result<(), Status> {
        if !(LOG_LEVEL_FATAL..=LOG_LEVEL_INFO).contains(&level) {
            return Err(Status::InvalidValue);
        }
        self.inner.callbacks.write()[(level - 1) as usize] = callback;
        Ok(())
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn log(&self, level: u32, tag: &str, message: &str) {
        self.inner.log(level, tag, message);
    }

    pub(crate) fn share(&self) -> ContextRef {
        Arc::clone(&self.inner)
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext").field("id", &self.inner.id).finish()
    }
}
