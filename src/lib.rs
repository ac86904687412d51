//! # lidarsim
//!
//! Compute-graph engine for simulating LiDAR point clouds.
//!
//! Rays flow through a DAG of nodes: sources produce sensor rays, transform
//! nodes move them, [`RaytraceNode`](graph::RaytraceNode) casts them against
//! a [`Scene`](scene::Scene) and point nodes post-process the hits. All
//! device work is enqueued on a [`Stream`](device::Stream); results are read
//! back once the graph has been synchronized.
//!
//! ## Modules
//!
//! - [`util`] - Errors, math types, configuration
//! - [`device`] - Software device runtime (memory, streams, kernels)
//! - [`buffer`] - Device-resident growable buffers
//! - [`kernels`] - Data-parallel kernels used by graph nodes
//! - [`graph`] - Nodes, fields and graph execution
//! - [`rt`] - Ray-tracing backend (context, programs, acceleration structures)
//! - [`scene`] - Meshes and entities the backend traces against
//!
//! ## Example
//!
//! ```no_run
//! use lidarsim::prelude::*;
//!
//! let stream = Stream::new(&Device::current()?)?;
//! let rays = share(RaysFromMat3x4Node::new()?);
//! rays.write().set_rays(&[Mat3x4f::IDENTITY])?;
//! let rotate = share(TransformRaysNode::new(Mat3x4f::from_translation(Vec3::X))?);
//! let rays: NodeRef = rays;
//! let rotate: NodeRef = rotate;
//! connect(&rays, &rotate)?;
//!
//! let mut graph = Graph::new(&rotate)?;
//! graph.run(&stream)?;
//! stream.synchronize()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod buffer;
pub mod device;
pub mod graph;
pub mod kernels;
pub mod rt;
pub mod scene;
pub mod util;

// Re-export commonly used types
pub use util::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::buffer::{ManagedBuffer, TypedBuffer};
    pub use crate::device::{Device, DevicePtr, Status, Stream};
    pub use crate::graph::*;
    pub use crate::rt::{RayTracingBackend, TraversableHandle};
    pub use crate::scene::{EntityId, Mesh, MeshId, Scene};
    pub use crate::util::{EngineConfig, Error, Mat3x4f, Result, Vec3};
}
