//! Utility types shared by every layer of the engine.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - [`Mat3x4f`], [`Axis`] - Device transform layout, plus glam re-exports
//! - [`EngineConfig`] - serde-backed configuration

mod config;
mod error;
mod math;

pub use config::*;
pub use error::*;
pub use math::*;
