//! Compute graph.
//!
//! Nodes are connected into a DAG with [`connect`] and driven by a [`Graph`]:
//! `validate()` resolves inputs and output fields after configuration
//! changes, `schedule(stream)` enqueues each node's device work in
//! dependency order. Consumers read results through [`FieldView`]s.

mod field;
pub(crate) mod node;
mod nodes;
mod pipeline;

pub use field::{DistanceF32, Field, FieldView, IsHitI32, RayIdxU32, TypedField, XyzF32};
pub use node::{
    share, with_points, with_rays, Node, NodeBase, NodeRef, NodeState, PointsNode, RaysNode,
    Shared,
};
pub use nodes::{
    FromArrayPointsNode, GaussianNoiseAngularHitpointNode, RaysFromMat3x4Node, RaytraceNode,
    TransformPointsNode, TransformRaysNode,
};
pub use pipeline::{connect, disconnect, invalidate_downstream, Graph};
