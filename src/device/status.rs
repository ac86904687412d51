//! Status codes reported by the device runtime and the ray-tracing backend.

use std::fmt;

/// Failure status of a runtime call.
///
/// Runtime entry points return `Result<T, Status>`; the engine turns them into
/// [`crate::Error`] with [`crate::util::CheckStatus::checked`], which records the
/// name of the failing call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    /// Argument out of range or inconsistent
    InvalidValue = 1,
    /// Allocation exceeds the device budget or host allocator failed
    OutOfMemory = 2,
    /// Runtime used before initialization
    NotInitialized = 3,
    /// No such device ordinal
    InvalidDevice = 101,
    /// Context missing or already destroyed
    InvalidContext = 201,
    /// Handle does not reference a live object
    InvalidHandle = 400,
    /// A kernel or stream operation faulted
    LaunchFailure = 719,
    /// Device code does not declare what the pipeline needs
    InvalidDeviceCode = 7200,
    /// Entry point name not present in the compiled module
    EntryFunctionNotFound = 7201,
    /// Program groups cannot be linked into a pipeline
    PipelineLinkError = 7251,
    /// Launch parameter blob does not match the pipeline
    InvalidLaunchParameter = 7002,
    /// Traversal exceeded the configured graph depth
    TraversalDepthExceeded = 7300,
    /// Compaction or relocation of an acceleration structure failed
    AccelCompactionFailed = 7400,
    /// Unexpected internal condition
    InternalError = 7990,
}

impl Status {
    /// Numeric status code.
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Symbolic status name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::InvalidValue => "INVALID_VALUE",
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::InvalidDevice => "INVALID_DEVICE",
            Self::InvalidContext => "INVALID_CONTEXT",
            Self::InvalidHandle => "INVALID_HANDLE",
            Self::LaunchFailure => "LAUNCH_FAILURE",
            Self::InvalidDeviceCode => "INVALID_DEVICE_CODE",
            Self::EntryFunctionNotFound => "ENTRY_FUNCTION_NOT_FOUND",
            Self::PipelineLinkError => "PIPELINE_LINK_ERROR",
            Self::InvalidLaunchParameter => "INVALID_LAUNCH_PARAMETER",
            Self::TraversalDepthExceeded => "TRAVERSAL_DEPTH_EXCEEDED",
            Self::AccelCompactionFailed => "ACCEL_COMPACTION_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

impl std::error::Error for Status {}
