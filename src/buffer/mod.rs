//! Device-resident buffers.
//!
//! [`ManagedBuffer`] owns one unified allocation and tracks element count
//! separately from capacity; [`TypedBuffer`] fixes the element type at
//! compile time.

mod managed;
mod typed;

pub use managed::{ManagedBuffer, TypeDescriptor};
pub use typed::TypedBuffer;
